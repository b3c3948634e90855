//! Controller options.
//!
//! Options are plain data with defaults for every field, loaded from a TOML
//! file by the embedding daemon.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Tunables shared by all device controllers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Options {
    /// Seconds to wait for the hotplug agent to connect a new device.
    pub device_create_timeout_secs: u64,
    /// Seconds to wait for the hotplug agent to tear a device down.
    pub device_destroy_timeout_secs: u64,
    /// Seconds to wait for a backend to reach Connected after reconfiguration.
    pub device_reconfigure_timeout_secs: u64,
    /// Commit attempts for bounded transactions (device id allocation).
    pub transaction_retries: u32,
    /// External tool invoked for each device migration step.
    pub external_migration_tool: Option<PathBuf>,
    /// Directory holding the allocation tables of shared resource pools.
    pub pool_dir: PathBuf,
    /// Host network device listing, searched for buffer devices.
    pub netdev_dir: PathBuf,
    /// Directory holding the control fifos of replicated tap disks.
    pub tap_fifo_dir: PathBuf,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            device_create_timeout_secs: 100,
            device_destroy_timeout_secs: 100,
            device_reconfigure_timeout_secs: 100,
            transaction_retries: 100,
            external_migration_tool: None,
            pool_dir: PathBuf::from("/var/run/mvirt/pool"),
            netdev_dir: PathBuf::from("/sys/class/net"),
            tap_fifo_dir: PathBuf::from("/var/run/tap"),
        }
    }
}

impl Options {
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(s)?)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn device_create_timeout(&self) -> Duration {
        Duration::from_secs(self.device_create_timeout_secs)
    }

    pub fn device_destroy_timeout(&self) -> Duration {
        Duration::from_secs(self.device_destroy_timeout_secs)
    }

    pub fn device_reconfigure_timeout(&self) -> Duration {
        Duration::from_secs(self.device_reconfigure_timeout_secs)
    }
}
