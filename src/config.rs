//! Configuration file handling
//!
//! `musicd` reads a single YAML file. Every section has defaults, so a
//! minimal file only needs the API key. Interval bounds are checked at
//! load time and a violating file is rejected naming the field.

use std::fmt;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::logging::LoggerConfig;

pub const MIN_INTERVAL_FLOOR: u64 = 15;
pub const MAX_INTERVAL_CEILING: u64 = 3600;

#[derive(Debug)]
pub enum ConfigError {
    Io { path: String, source: std::io::Error },
    Parse(serde_yaml::Error),
    Invalid { field: String, reason: String },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Io { path, source } => write!(f, "cannot read config {}: {}", path, source),
            ConfigError::Parse(e) => write!(f, "cannot parse config: {}", e),
            ConfigError::Invalid { field, reason } => {
                write!(f, "invalid configuration: {} {}", field, reason)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

fn invalid(field: &str, reason: String) -> ConfigError {
    ConfigError::Invalid {
        field: field.to_string(),
        reason,
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub apiserver: ApiServerConfig,
    pub db: DbConfig,
    pub fsmengine: FsmEngineConfig,
    pub signers: SignersConfig,
    pub log: LoggerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiServerConfig {
    /// Address the control plane listens on
    pub address: String,
    /// Value clients must present in `X-API-Key`
    pub apikey: String,
    /// CA bundle clients use to verify the server
    pub root_ca: Option<String>,
}

impl Default for ApiServerConfig {
    fn default() -> Self {
        ApiServerConfig {
            address: "127.0.0.1:8080".to_string(),
            apikey: String::new(),
            root_ca: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DbConfig {
    pub file: String,
}

impl Default for DbConfig {
    fn default() -> Self {
        DbConfig {
            file: "music.db".to_string(),
        }
    }
}

/// Scheduler intervals, in seconds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IntervalConfig {
    pub target: u64,
    pub minimum: u64,
    pub maximum: u64,
    /// How often blocked zones are re-examined as well
    pub complete: u64,
}

impl Default for IntervalConfig {
    fn default() -> Self {
        IntervalConfig {
            target: 60,
            minimum: 15,
            maximum: 1800,
            complete: 7200,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PropagationConfig {
    /// Floor for the wait after the parent DS set changed, in seconds
    pub min_wait: u64,
    /// When set, replaces the TTL based wait entirely (testing)
    pub fixed_wait: Option<u64>,
}

impl Default for PropagationConfig {
    fn default() -> Self {
        PropagationConfig {
            min_wait: 60,
            fixed_wait: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FsmEngineConfig {
    pub active: bool,
    pub intervals: IntervalConfig,
    pub propagation: PropagationConfig,
    /// `address:port` of the parent used when a zone has no `parentaddr`
    pub default_parent: Option<String>,
    pub csync_ttl: u32,
}

impl Default for FsmEngineConfig {
    fn default() -> Self {
        FsmEngineConfig {
            active: true,
            intervals: IntervalConfig::default(),
            propagation: PropagationConfig::default(),
            default_parent: None,
            csync_ttl: 300,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DdnsConfig {
    /// Fetches per second for the rate-limited variant
    pub fetch_limit: u32,
    /// Updates per second for the rate-limited variant
    pub update_limit: u32,
    pub fetch_timeout: u64,
    pub update_timeout: u64,
}

impl Default for DdnsConfig {
    fn default() -> Self {
        DdnsConfig {
            fetch_limit: 5,
            update_limit: 2,
            fetch_timeout: 3,
            update_timeout: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HostedConfig {
    pub baseurl: String,
    pub email: String,
    pub password: String,
    pub fetch_limit: u32,
    pub update_limit: u32,
    /// Authorization scheme put in front of the token
    pub auth_scheme: String,
    pub fetch_timeout: u64,
    pub update_timeout: u64,
}

impl Default for HostedConfig {
    fn default() -> Self {
        HostedConfig {
            baseurl: "https://desec.io/api/v1".to_string(),
            email: String::new(),
            password: String::new(),
            fetch_limit: 2,
            update_limit: 1,
            auth_scheme: "Token".to_string(),
            fetch_timeout: 5,
            update_timeout: 15,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SignersConfig {
    pub ddns: DdnsConfig,
    pub hosted: HostedConfig,
    /// Throttle responses tolerated per operation before giving up
    pub throttle_retries: u32,
}

impl Default for SignersConfig {
    fn default() -> Self {
        SignersConfig {
            ddns: DdnsConfig::default(),
            hosted: HostedConfig::default(),
            throttle_retries: 5,
        }
    }
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Config::from_yaml(&text)
    }

    pub fn from_yaml(text: &str) -> Result<Config, ConfigError> {
        let config: Config = serde_yaml::from_str(text).map_err(ConfigError::Parse)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let iv = &self.fsmengine.intervals;
        if iv.minimum < MIN_INTERVAL_FLOOR {
            return Err(invalid(
                "fsmengine.intervals.minimum",
                format!("must be at least {} s (is {})", MIN_INTERVAL_FLOOR, iv.minimum),
            ));
        }
        if iv.maximum > MAX_INTERVAL_CEILING {
            return Err(invalid(
                "fsmengine.intervals.maximum",
                format!("must be at most {} s (is {})", MAX_INTERVAL_CEILING, iv.maximum),
            ));
        }
        if iv.target < iv.minimum || iv.target > iv.maximum {
            return Err(invalid(
                "fsmengine.intervals.target",
                format!(
                    "must lie between minimum {} and maximum {} (is {})",
                    iv.minimum, iv.maximum, iv.target
                ),
            ));
        }
        if iv.complete < iv.minimum {
            return Err(invalid(
                "fsmengine.intervals.complete",
                format!("must not be below minimum {} (is {})", iv.minimum, iv.complete),
            ));
        }

        let signers = &self.signers;
        for (field, value) in [
            ("signers.ddns.fetch_limit", signers.ddns.fetch_limit),
            ("signers.ddns.update_limit", signers.ddns.update_limit),
            ("signers.hosted.fetch_limit", signers.hosted.fetch_limit),
            ("signers.hosted.update_limit", signers.hosted.update_limit),
        ] {
            if value == 0 {
                return Err(invalid(field, "must be at least 1".to_string()));
            }
        }

        if let Some(ref parent) = self.fsmengine.default_parent {
            if parent.parse::<std::net::SocketAddr>().is_err() {
                return Err(invalid(
                    "fsmengine.default_parent",
                    format!("is not an address:port pair ('{}')", parent),
                ));
            }
        }

        Ok(())
    }
}

impl IntervalConfig {
    pub fn target(&self) -> Duration {
        Duration::from_secs(self.target)
    }

    pub fn minimum(&self) -> Duration {
        Duration::from_secs(self.minimum)
    }

    pub fn maximum(&self) -> Duration {
        Duration::from_secs(self.maximum)
    }

    pub fn complete(&self) -> Duration {
        Duration::from_secs(self.complete)
    }
}
