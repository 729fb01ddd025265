//! Agent configuration loaded from a JSON file

use remote_agent_shared::intervals;
use serde::Deserialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Default location of the configuration file
pub const DEFAULT_CONFIG_PATH: &str = "config.json";

/// Errors raised while loading configuration. All of them are fatal at startup.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Missing '{0}' in configuration")]
    MissingKey(&'static str),
}

/// On-disk shape; required keys stay optional here so a missing one can be named
#[derive(Debug, Deserialize)]
struct RawConfig {
    azure_iot_hub_host: Option<String>,
    device_id: Option<String>,
    shared_access_key: Option<String>,
    rewst_engine_host: Option<String>,
    rewst_org_id: Option<String>,
    heartbeat_interval_secs: Option<u64>,
    max_concurrent_commands: Option<usize>,
    shutdown_grace_secs: Option<u64>,
    callback_timeout_secs: Option<u64>,
    connect_timeout_secs: Option<u64>,
}

/// Validated agent configuration
#[derive(Clone)]
pub struct AgentConfig {
    /// Message hub host, optionally with `:port`
    pub azure_iot_hub_host: String,
    pub device_id: String,
    pub shared_access_key: String,
    /// Host that receives HTTP result callbacks
    pub rewst_engine_host: String,
    pub rewst_org_id: String,
    pub heartbeat_interval: Duration,
    /// Upper bound on simultaneously running child processes
    pub max_concurrent_commands: usize,
    pub shutdown_grace: Duration,
    pub callback_timeout: Duration,
    pub connect_timeout: Duration,
}

impl AgentConfig {
    /// Load and validate the configuration file at `path`
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&content).map_err(|e| match e {
            ConfigError::Parse { source, .. } => ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            },
            other => other,
        })
    }

    /// Parse and validate configuration from a JSON string
    pub fn from_json(content: &str) -> Result<Self, ConfigError> {
        let raw: RawConfig = serde_json::from_str(content).map_err(|source| ConfigError::Parse {
            path: PathBuf::from("<inline>"),
            source,
        })?;

        Ok(Self {
            azure_iot_hub_host: require(raw.azure_iot_hub_host, "azure_iot_hub_host")?,
            device_id: require(raw.device_id, "device_id")?,
            shared_access_key: require(raw.shared_access_key, "shared_access_key")?,
            rewst_engine_host: require(raw.rewst_engine_host, "rewst_engine_host")?,
            rewst_org_id: require(raw.rewst_org_id, "rewst_org_id")?,
            heartbeat_interval: Duration::from_secs(
                raw.heartbeat_interval_secs
                    .unwrap_or(intervals::HEARTBEAT_INTERVAL_SECS),
            ),
            max_concurrent_commands: raw.max_concurrent_commands.unwrap_or(8).max(1),
            shutdown_grace: Duration::from_secs(raw.shutdown_grace_secs.unwrap_or(30)),
            callback_timeout: Duration::from_secs(raw.callback_timeout_secs.unwrap_or(30)),
            connect_timeout: Duration::from_secs(raw.connect_timeout_secs.unwrap_or(10)),
        })
    }
}

fn require(value: Option<String>, key: &'static str) -> Result<String, ConfigError> {
    match value {
        Some(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(ConfigError::MissingKey(key)),
    }
}

impl fmt::Debug for AgentConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentConfig")
            .field("azure_iot_hub_host", &self.azure_iot_hub_host)
            .field("device_id", &self.device_id)
            .field(
                "shared_access_key",
                &format_args!("<redacted, {} bytes>", self.shared_access_key.len()),
            )
            .field("rewst_engine_host", &self.rewst_engine_host)
            .field("rewst_org_id", &self.rewst_org_id)
            .field("heartbeat_interval", &self.heartbeat_interval)
            .field("max_concurrent_commands", &self.max_concurrent_commands)
            .field("shutdown_grace", &self.shutdown_grace)
            .field("callback_timeout", &self.callback_timeout)
            .field("connect_timeout", &self.connect_timeout)
            .finish()
    }
}
