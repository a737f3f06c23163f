//! Configuration management

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub general: GeneralConfig,
    pub monitor: MonitorConfig,
    pub delivery: DeliveryConfig,
}

/// General settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Socket directory
    pub runtime_dir: Option<PathBuf>,

    /// Name of the server socket inside the runtime directory
    pub socket_name: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            runtime_dir: None,
            socket_name: "cardwatch.sock".to_string(),
        }
    }
}

/// Session liveness settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Seconds between keep-alive pings
    pub keep_alive_interval_secs: u64,

    /// Seconds between health checks (also the retry sweep cadence)
    pub health_check_interval_secs: u64,

    /// A session idle for longer than this is closed
    pub connection_timeout_secs: u64,

    /// A session without a heartbeat for longer than this is unhealthy
    pub heartbeat_timeout_secs: u64,

    /// Recovery attempts before an unhealthy session is closed
    pub max_reconnect_attempts: u32,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            keep_alive_interval_secs: 15,
            health_check_interval_secs: 30,
            connection_timeout_secs: 300,
            heartbeat_timeout_secs: 60,
            max_reconnect_attempts: 3,
        }
    }
}

impl MonitorConfig {
    pub fn keep_alive_interval(&self) -> Duration {
        Duration::from_secs(self.keep_alive_interval_secs.max(1))
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs.max(1))
    }

    pub fn connection_timeout(&self) -> chrono::Duration {
        saturating_seconds(self.connection_timeout_secs)
    }

    pub fn heartbeat_timeout(&self) -> chrono::Duration {
        saturating_seconds(self.heartbeat_timeout_secs)
    }
}

/// Values past what `chrono` can hold mean "never"
fn saturating_seconds(secs: u64) -> chrono::Duration {
    i64::try_from(secs)
        .ok()
        .and_then(chrono::Duration::try_seconds)
        .unwrap_or(chrono::Duration::MAX)
}

/// Alert delivery settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeliveryConfig {
    /// Undelivered alerts kept per session
    pub retry_queue_capacity: usize,

    /// Failed redeliveries before a queued alert is dropped
    pub max_retry_attempts: u32,

    /// Outbound messages buffered per socket connection
    pub outbound_buffer: usize,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            retry_queue_capacity: 10,
            max_retry_attempts: 3,
            outbound_buffer: 256,
        }
    }
}

impl Config {
    /// Load config from the default location, or return defaults if not found
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path())
    }

    /// Load config from an explicit file, or return defaults if it does not exist
    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Config = toml::from_str(&content)?;
            Ok(config)
        } else {
            Ok(Config::default())
        }
    }

    /// Get the config file path
    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("cardwatch")
            .join("config.toml")
    }

    /// Get the runtime directory for sockets
    pub fn runtime_dir(&self) -> PathBuf {
        self.general
            .runtime_dir
            .clone()
            .or_else(dirs::runtime_dir)
            .unwrap_or_else(std::env::temp_dir)
            .join("cardwatch")
    }

    /// Get the server socket path
    pub fn socket_path(&self) -> PathBuf {
        self.runtime_dir().join(&self.general.socket_name)
    }
}
