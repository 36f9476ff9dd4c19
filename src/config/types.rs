//! Configuration data types.

use crate::drain::{DrainOptions, DrainType};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;

/// Root configuration structure.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Global settings
    #[serde(default)]
    pub global: GlobalConfig,

    /// Drain timing for the whole process
    #[serde(default)]
    pub drain: DrainConfig,

    /// Frontend definitions (where we listen)
    #[serde(default)]
    pub frontends: Vec<FrontendConfig>,
}

/// Global configuration settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GlobalConfig {
    /// Log level: trace, debug, info, warn, error
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Log format: json, pretty or compact
    #[serde(default)]
    pub log_format: LogFormat,

    /// Admin endpoint configuration
    #[serde(default)]
    pub admin: AdminConfig,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: LogFormat::default(),
            admin: AdminConfig::default(),
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
    Compact,
}

/// Admin endpoint configuration (metrics and drain control).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AdminConfig {
    /// Whether the admin endpoint is enabled
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Address to bind the admin server
    #[serde(default = "default_admin_address")]
    pub address: SocketAddr,

    /// Path for the metrics endpoint
    #[serde(default = "default_metrics_path")]
    pub metrics_path: String,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            address: default_admin_address(),
            metrics_path: default_metrics_path(),
        }
    }
}

/// Process-wide drain settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DrainConfig {
    /// Window over which connections are gradually closed
    #[serde(default = "default_drain_time", with = "humantime_serde")]
    pub drain_time: Duration,

    /// Delay before the parent process is terminated
    #[serde(default = "default_parent_shutdown_time", with = "humantime_serde")]
    pub parent_shutdown_time: Duration,

    /// Drain type of the root drain manager
    #[serde(default)]
    pub strategy: DrainType,

    /// Whether parent shutdown sequences are honored
    #[serde(default = "default_true")]
    pub parent_shutdown_enabled: bool,
}

impl DrainConfig {
    /// Timing handed to drain managers.
    pub fn options(&self) -> DrainOptions {
        DrainOptions {
            drain_time: self.drain_time,
            parent_shutdown_time: self.parent_shutdown_time,
            parent_shutdown_enabled: self.parent_shutdown_enabled,
        }
    }
}

impl Default for DrainConfig {
    fn default() -> Self {
        Self {
            drain_time: default_drain_time(),
            parent_shutdown_time: default_parent_shutdown_time(),
            strategy: DrainType::default(),
            parent_shutdown_enabled: true,
        }
    }
}

/// Frontend configuration (listener).
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct FrontendConfig {
    /// Unique name for this frontend
    pub name: String,

    /// Address and port to listen on
    pub listen: SocketAddr,

    /// Drain type for this listener; inherits the root's when unset
    #[serde(default)]
    pub drain_type: Option<DrainType>,
}

// Default value functions
fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

fn default_admin_address() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 9901))
}

fn default_metrics_path() -> String {
    "/metrics".to_string()
}

fn default_drain_time() -> Duration {
    Duration::from_secs(600)
}

fn default_parent_shutdown_time() -> Duration {
    Duration::from_secs(900)
}

/// Custom serde module for humantime durations.
mod humantime_serde {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let s = humantime::format_duration(*duration).to_string();
        serializer.serialize_str(&s)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}
