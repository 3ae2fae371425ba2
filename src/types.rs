use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::telemetry::{de_number, de_timestamp};

pub const SENSOR_1: &str = "sensor1";
pub const SENSOR_2: &str = "sensor2";
pub const SENSOR_AVERAGE: &str = "average";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MistingStatus {
    On,
    Off,
    Auto,
    Continuous,
    #[serde(other)]
    Unknown,
}

impl Default for MistingStatus {
    fn default() -> Self {
        MistingStatus::Off
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Mode {
    Auto,
    Manual,
    Continuous,
    #[serde(other)]
    Unknown,
}

impl Default for Mode {
    fn default() -> Self {
        Mode::Auto
    }
}

impl Mode {
    /// False for modes this client cannot name; those are never sent back.
    pub fn is_known(self) -> bool {
        self != Mode::Unknown
    }
}

impl FromStr for Mode {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "AUTO" => Ok(Mode::Auto),
            "MANUAL" => Ok(Mode::Manual),
            "CONTINUOUS" => Ok(Mode::Continuous),
            other => Err(format!("unknown mode '{other}' (expected auto, manual or continuous)")),
        }
    }
}

/// One timestamped observation. Missing or non-numeric metrics stay `None`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    #[serde(default, deserialize_with = "de_timestamp")]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "de_number")]
    pub temperature: Option<f64>,
    #[serde(default, deserialize_with = "de_number")]
    pub humidity: Option<f64>,
    #[serde(default)]
    pub misting_status: Option<MistingStatus>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    Temperature,
    Humidity,
}

impl Metric {
    /// Finite value of this metric on `reading`, if any.
    pub fn value_of(self, reading: &Reading) -> Option<f64> {
        let value = match self {
            Metric::Temperature => reading.temperature,
            Metric::Humidity => reading.humidity,
        };
        value.filter(|v| v.is_finite())
    }
}

/// Latest known state per physical sensor plus the backend's computed average.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SensorSnapshot {
    pub sensor1: Reading,
    pub sensor2: Reading,
    pub average: Reading,
    pub misting_status: MistingStatus,
    pub mode: Mode,
    pub human_detected: bool,
    pub person_detection_status: Option<String>,
    pub person_detection_timestamp: Option<DateTime<Utc>>,
    pub water_level: Option<f64>,
}

impl Default for SensorSnapshot {
    fn default() -> Self {
        Self {
            sensor1: Reading::default(),
            sensor2: Reading::default(),
            average: Reading::default(),
            misting_status: MistingStatus::Off,
            mode: Mode::Auto,
            human_detected: false,
            person_detection_status: None,
            person_detection_timestamp: None,
            water_level: None,
        }
    }
}

/// Chronological (oldest first) readings per sensor id for one window.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct HistoricalSeries {
    series: BTreeMap<String, Vec<Reading>>,
}

impl HistoricalSeries {
    /// Builds a series from backend arrays, which arrive newest first.
    pub fn from_newest_first(series: BTreeMap<String, Vec<Reading>>) -> Self {
        let series = series
            .into_iter()
            .map(|(sensor_id, mut readings)| {
                readings.reverse();
                (sensor_id, readings)
            })
            .collect();
        Self { series }
    }

    pub fn get(&self, sensor_id: &str) -> &[Reading] {
        self.series
            .get(sensor_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn sensor_ids(&self) -> impl Iterator<Item = &str> {
        self.series.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[Reading])> {
        self.series
            .iter()
            .map(|(sensor_id, readings)| (sensor_id.as_str(), readings.as_slice()))
    }

    pub fn is_empty(&self) -> bool {
        self.series.values().all(Vec::is_empty)
    }

    pub fn len(&self) -> usize {
        self.series.values().map(Vec::len).sum()
    }

    /// Timestamp of the newest reading, preferring the average series.
    pub fn last_updated(&self) -> Option<DateTime<Utc>> {
        let preferred = [SENSOR_AVERAGE, SENSOR_1, SENSOR_2];
        preferred
            .iter()
            .copied()
            .chain(self.sensor_ids().filter(|id| !preferred.contains(id)))
            .find_map(|sensor_id| self.get(sensor_id).last().and_then(|r| r.timestamp))
    }
}

/// Named lookback duration for history, analytics and export.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Window {
    #[serde(rename = "24h")]
    Day,
    #[serde(rename = "7d")]
    Week,
    #[serde(rename = "30d")]
    Month,
}

impl Default for Window {
    fn default() -> Self {
        Window::Day
    }
}

impl Window {
    pub const ALL: [Window; 3] = [Window::Day, Window::Week, Window::Month];

    pub fn as_str(self) -> &'static str {
        match self {
            Window::Day => "24h",
            Window::Week => "7d",
            Window::Month => "30d",
        }
    }

    /// Sample count requested from `/historical-data`.
    pub fn sample_limit(self) -> u32 {
        match self {
            Window::Day => 24,
            Window::Week => 168,
            Window::Month => 720,
        }
    }

    pub fn hours(self) -> u32 {
        match self {
            Window::Day => 24,
            Window::Week => 24 * 7,
            Window::Month => 24 * 30,
        }
    }
}

impl fmt::Display for Window {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Window {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let raw = raw.trim();
        Window::ALL
            .into_iter()
            .find(|window| window.as_str().eq_ignore_ascii_case(raw))
            .ok_or_else(|| format!("unknown window '{raw}' (expected 24h, 7d or 30d)"))
    }
}

/// Command sent to `/control-misting`. `Auto` and `Continuous` switch the
/// controller's operating mode rather than the mister itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ControlAction {
    On,
    Off,
    Auto,
    Continuous,
}

impl ControlAction {
    /// Status to assume when the acknowledgement omits `current_status`.
    pub fn as_status(self) -> MistingStatus {
        match self {
            ControlAction::On => MistingStatus::On,
            ControlAction::Off => MistingStatus::Off,
            ControlAction::Auto => MistingStatus::Auto,
            ControlAction::Continuous => MistingStatus::Continuous,
        }
    }
}

impl FromStr for ControlAction {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "ON" => Ok(ControlAction::On),
            "OFF" => Ok(ControlAction::Off),
            "AUTO" => Ok(ControlAction::Auto),
            "CONTINUOUS" => Ok(ControlAction::Continuous),
            other => Err(format!(
                "unknown action '{other}' (expected on, off, auto or continuous)"
            )),
        }
    }
}

/// Operator intent plus the last acknowledged actuator state.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ControlState {
    pub misting_status: MistingStatus,
    pub mode: Mode,
    pub mist_duration_secs: u32,
    pub humidity_threshold: f64,
    pub auto_mode: bool,
}

impl Default for ControlState {
    fn default() -> Self {
        Self {
            misting_status: MistingStatus::Off,
            mode: Mode::Auto,
            mist_duration_secs: 30,
            humidity_threshold: 60.0,
            auto_mode: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MistingSummary {
    #[serde(default)]
    pub total_activations: u64,
    #[serde(default)]
    pub time_range_hours: u32,
    #[serde(default)]
    pub activations_by_trigger: BTreeMap<String, u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MistingEvent {
    #[serde(default)]
    pub id: Option<i64>,
    #[serde(default, deserialize_with = "de_timestamp")]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub trigger_type: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default, deserialize_with = "de_number")]
    pub duration: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EventLogPage {
    pub events: Vec<MistingEvent>,
    pub total_pages: u32,
}

impl Default for EventLogPage {
    fn default() -> Self {
        Self {
            events: Vec::new(),
            total_pages: 1,
        }
    }
}
