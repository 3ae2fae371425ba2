use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

use crate::types::{ControlAction, Mode, Window};

#[derive(Parser, Debug)]
#[command(
    name = "misting-monitor",
    version,
    about = "Smart misting controller client"
)]
pub struct Cli {
    /// Backend base URL; overrides MISTING_API_URL.
    #[arg(long, global = true)]
    pub api_url: Option<String>,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Poll the backend and log each refreshed view until Ctrl-C.
    Watch(WatchArgs),
    /// Print the current snapshot and control state.
    Status(OutputArgs),
    /// Fetch history for a window and print derived statistics.
    Stats(WindowArgs),
    /// Switch misting on or off, or put the controller in auto or continuous mode.
    Control(ControlArgs),
    /// Print one page of the misting event log.
    Events(EventsArgs),
    /// Print misting activation totals.
    Summary(WindowArgs),
    /// Download the CSV export.
    Export(ExportArgs),
}

#[derive(Args, Debug)]
pub struct WatchArgs {
    #[arg(long, value_parser = parse_window)]
    pub window: Option<Window>,
    /// Also apply live pushes from the MQTT broker.
    #[arg(long, default_value_t = false)]
    pub mqtt: bool,
    #[arg(long, default_value_t = false)]
    pub json: bool,
}

#[derive(Args, Debug)]
pub struct OutputArgs {
    #[arg(long, default_value_t = false)]
    pub json: bool,
}

#[derive(Args, Debug)]
pub struct WindowArgs {
    #[arg(long, value_parser = parse_window)]
    pub window: Option<Window>,
    #[arg(long, default_value_t = false)]
    pub json: bool,
}

#[derive(Args, Debug)]
pub struct ControlArgs {
    #[arg(value_enum)]
    pub action: Switch,
    #[arg(long, value_parser = parse_mode)]
    pub mode: Option<Mode>,
}

#[derive(Args, Debug)]
pub struct EventsArgs {
    #[arg(long, value_parser = parse_window)]
    pub window: Option<Window>,
    #[arg(long, default_value_t = 1)]
    pub page: u32,
    #[arg(long, default_value_t = false)]
    pub json: bool,
}

#[derive(Args, Debug)]
pub struct ExportArgs {
    #[arg(long, value_parser = parse_window)]
    pub window: Option<Window>,
    /// Write to this file instead of stdout.
    #[arg(long)]
    pub output: Option<PathBuf>,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Switch {
    On,
    Off,
    Auto,
    Continuous,
}

impl From<Switch> for ControlAction {
    fn from(switch: Switch) -> Self {
        match switch {
            Switch::On => ControlAction::On,
            Switch::Off => ControlAction::Off,
            Switch::Auto => ControlAction::Auto,
            Switch::Continuous => ControlAction::Continuous,
        }
    }
}

fn parse_window(raw: &str) -> Result<Window, String> {
    raw.parse()
}

fn parse_mode(raw: &str) -> Result<Mode, String> {
    raw.parse()
}
