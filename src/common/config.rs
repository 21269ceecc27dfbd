//! Configuration for minicoord components
//!
//! Values are layered: built-in defaults, then an optional TOML file
//! (`minicoord.toml` or an explicit path), then `MINICOORD__*` environment
//! variables (`MINICOORD__COORDINATOR__REQUEST_TIMEOUT_MS=2000`).

use crate::common::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_CONFIG_FILE: &str = "minicoord";
const ENV_PREFIX: &str = "MINICOORD";

/// Global configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Node ID (unique identifier)
    #[serde(default = "default_node_id")]
    pub node_id: String,

    /// Coordinator-specific config
    #[serde(default)]
    pub coordinator: CoordinatorConfig,

    /// Logging level
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_node_id() -> String {
    "coord-1".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Fsync behaviour of the file-backed operation log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncPolicy {
    /// Fsync after every appended id
    #[default]
    Always,
    /// Fsync on demand and when the log is dropped
    Interval,
    /// Never fsync, leave write-back to the OS
    Never,
}

/// Coordinator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Deadline armed for every in-flight operation
    #[serde(default = "default_request_timeout")]
    pub request_timeout_ms: u64,

    /// Durable operation log; in-memory when unset
    #[serde(default)]
    pub oplog_path: Option<PathBuf>,

    #[serde(default)]
    pub sync_policy: SyncPolicy,
}

fn default_request_timeout() -> u64 {
    1_000
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: default_request_timeout(),
            oplog_path: None,
            sync_policy: SyncPolicy::default(),
        }
    }
}

impl CoordinatorConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn set_request_timeout(&mut self, timeout: Duration) -> Result<()> {
        self.request_timeout_ms = u64::try_from(timeout.as_millis()).map_err(|_| {
            crate::Error::InvalidConfig(format!("request timeout out of range: {:?}", timeout))
        })?;
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            coordinator: CoordinatorConfig::default(),
            log_level: default_log_level(),
        }
    }
}

impl Config {
    /// Load `minicoord.toml` from the working directory if present, then the environment.
    pub fn load() -> Result<Self> {
        Self::build(config::File::with_name(DEFAULT_CONFIG_FILE).required(false))
    }

    /// Load an explicit configuration file, then the environment.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        Self::build(config::File::from(path.as_ref()).required(true))
    }

    /// Parse a TOML document without consulting the environment.
    pub fn from_toml_str(toml: &str) -> Result<Self> {
        let config: Config = config::Config::builder()
            .add_source(config::File::from_str(toml, config::FileFormat::Toml))
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    fn build<S>(file: S) -> Result<Self>
    where
        S: config::Source + Send + Sync + 'static,
    {
        let config: Config = config::Config::builder()
            .add_source(file)
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.node_id.trim().is_empty() {
            return Err(crate::Error::InvalidConfig("node_id cannot be empty".into()));
        }
        if self.coordinator.request_timeout_ms == 0 {
            return Err(crate::Error::InvalidConfig(
                "request_timeout_ms must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}
