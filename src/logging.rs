//! Logging setup for the MUSIC binaries
//!
//! Library code logs through the `log` facade. The binaries install a
//! `tracing-subscriber` formatter here, which also picks up `log`
//! records, filtered by `RUST_LOG` or the configured level.

use serde::{Deserialize, Serialize};
use tracing::Level;
use tracing_subscriber::EnvFilter;

/// Log levels accepted in the configuration file
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl Default for LogLevel {
    fn default() -> Self {
        LogLevel::Info
    }
}

impl From<LogLevel> for Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => Level::TRACE,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Info => Level::INFO,
            LogLevel::Warn => Level::WARN,
            LogLevel::Error => Level::ERROR,
        }
    }
}

/// Logger configuration, the `log` section of the config file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggerConfig {
    /// Minimum log level to output
    pub level: LogLevel,
    /// Enable JSON formatting
    pub json: bool,
}

impl LoggerConfig {
    fn filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new(format!("{:?}", self.level).to_lowercase()))
            .unwrap_or_else(|_| EnvFilter::new("info"))
    }
}

/// Installs the global subscriber. Calling it twice is harmless; the
/// second call reports that a subscriber already exists and keeps it.
pub fn init(config: &LoggerConfig) {
    let init_result = if config.json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(config.filter())
            .try_init()
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(config.filter())
            .with_target(false)
            .try_init()
    };

    if let Err(e) = init_result {
        eprintln!("Warning: tracing subscriber already initialized: {}", e);
    }
}
