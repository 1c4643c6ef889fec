//! Runtime configuration, read from TOML.
//!
//! Every field has a default, so an empty file (or no file at all) yields a
//! working configuration:
//!
//! ```toml
//! log_level = "debug"
//!
//! [sync]
//! pending_capacity = 512
//! dependency_timeout_ms = 2000
//!
//! [snapshot]
//! compact_log = true
//! ```

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;

use crate::error::Error;
use crate::error::Result;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Filter used when `RUST_LOG` is unset.
    pub log_level: String,
    pub sync: SyncConfig,
    pub broker: BrokerConfig,
    pub snapshot: SnapshotConfig,
    pub registry: RegistryConfig,
}

/// Knobs for a single document's coordinator.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Maximum operations held while waiting on dependencies.
    pub pending_capacity: usize,
    pub dependency_timeout_ms: u64,
    pub sweep_interval_ms: u64,
    pub request_capacity: usize,
    pub client_capacity: usize,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub retry_initial_ms: u64,
    pub retry_max_ms: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotConfig {
    /// Drop log entries covered by a new snapshot.
    pub compact_log: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    pub idle_timeout_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        return Config {
            log_level: "info".to_string(),
            sync: SyncConfig::default(),
            broker: BrokerConfig::default(),
            snapshot: SnapshotConfig::default(),
            registry: RegistryConfig::default(),
        };
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        return SyncConfig {
            pending_capacity: 1024,
            dependency_timeout_ms: 5000,
            sweep_interval_ms: 500,
            request_capacity: 256,
            client_capacity: 64,
        };
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        return BrokerConfig {
            retry_initial_ms: 50,
            retry_max_ms: 5000,
        };
    }
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        return SnapshotConfig { compact_log: false };
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        return RegistryConfig { idle_timeout_ms: 60_000 };
    }
}

impl Config {
    /// Parse a configuration from TOML text.
    pub fn from_toml(contents: &str) -> Result<Config> {
        return toml::from_str(contents).map_err(|e| Error::Config(e.to_string()));
    }

    /// Read and parse a configuration file.
    pub fn load(path: &Path) -> Result<Config> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read {}: {e}", path.display())))?;
        return Config::from_toml(&contents);
    }

    /// Load `path` if given, falling back to defaults when it is missing or invalid.
    pub fn load_or_default(path: Option<&Path>) -> Config {
        let Some(path) = path else {
            return Config::default();
        };
        match Config::load(path) {
            Ok(config) => return config,
            Err(e) => {
                tracing::warn!("config load failed, using defaults: {e}");
                return Config::default();
            }
        }
    }
}

impl SyncConfig {
    pub fn dependency_timeout(&self) -> Duration {
        return Duration::from_millis(self.dependency_timeout_ms);
    }

    pub fn sweep_interval(&self) -> Duration {
        return Duration::from_millis(self.sweep_interval_ms.max(1));
    }
}

impl BrokerConfig {
    pub fn retry_initial(&self) -> Duration {
        return Duration::from_millis(self.retry_initial_ms.max(1));
    }

    pub fn retry_max(&self) -> Duration {
        return Duration::from_millis(self.retry_max_ms.max(self.retry_initial_ms).max(1));
    }
}

impl RegistryConfig {
    pub fn idle_timeout(&self) -> Duration {
        return Duration::from_millis(self.idle_timeout_ms);
    }
}
