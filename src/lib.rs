pub mod cli;
pub mod config;
pub mod error;
pub mod mqtt;
pub mod poller;
pub mod source;
pub mod stats;
pub mod telemetry;
pub mod types;
