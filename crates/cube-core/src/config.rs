//! Configuration system for the Cube gateway.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $CUBE_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/cube/dispatcher.toml
//!   3. ~/.config/cube/dispatcher.toml

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::time::Duration;

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    pub node: NodeConfig,
    pub network: NetworkConfig,
    pub performer: PerformerConfig,
    pub daemon: DaemonConfig,
    pub telemetry: TelemetryConfig,
    /// Backend nodes, in registration order.
    pub directors: Vec<DirectorConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Node name stamped on every telemetry report.
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// TCP port for client sessions.
    pub listen_port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PerformerConfig {
    /// Upper bound on a blocking call's wait.
    pub block_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Sweep period.
    pub interval_secs: u64,
    /// Grace window after a device session goes invalid.
    pub device_timeout_secs: u64,
    /// Age after which a tracked relay is dropped.
    pub transmission_timeout_secs: u64,
    /// Process report period.
    pub report_interval_secs: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// JSON-lines file receiving reports. None = reports are discarded.
    pub report_path: Option<PathBuf>,
}

/// One backend node entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectorConfig {
    pub address: String,
    #[serde(default = "default_director_port")]
    pub port: u16,
    /// Comma-delimited service names, e.g. "Auth, Contact, Messaging".
    pub cellets: String,
    #[serde(default = "default_director_weight")]
    pub weight: u32,
}

impl DirectorConfig {
    /// Parse the comma-delimited cellet list.
    pub fn cellet_names(&self) -> Result<BTreeSet<String>, ConfigError> {
        let names: BTreeSet<String> = self
            .cellets
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect();
        if names.is_empty() {
            return Err(ConfigError::InvalidDirector(
                format!("{}:{}", self.address, self.port),
                "empty cellet list".into(),
            ));
        }
        Ok(names)
    }
}

fn default_director_port() -> u16 {
    6000
}

fn default_director_weight() -> u32 {
    5
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            node: NodeConfig::default(),
            network: NetworkConfig::default(),
            performer: PerformerConfig::default(),
            daemon: DaemonConfig::default(),
            telemetry: TelemetryConfig::default(),
            directors: Vec::new(),
        }
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            name: "dispatcher".into(),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self { listen_port: 7000 }
    }
}

impl Default for PerformerConfig {
    fn default() -> Self {
        Self {
            block_timeout_ms: 6000,
        }
    }
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            interval_secs: 10,
            device_timeout_secs: 30,
            transmission_timeout_secs: 10,
            report_interval_secs: 60,
        }
    }
}

impl PerformerConfig {
    pub fn block_timeout(&self) -> Duration {
        Duration::from_millis(self.block_timeout_ms)
    }
}

impl DaemonConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn device_timeout(&self) -> Duration {
        Duration::from_secs(self.device_timeout_secs)
    }

    pub fn transmission_timeout(&self) -> Duration {
        Duration::from_secs(self.transmission_timeout_secs)
    }

    pub fn report_interval(&self) -> Duration {
        Duration::from_secs(self.report_interval_secs)
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".config"))
        .join("cube")
}

fn home_dir() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
    #[error("invalid director {0}: {1}")]
    InvalidDirector(String, String),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl DispatcherConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            Self::from_file(&path)?
        } else {
            DispatcherConfig::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Parse a specific file without env overrides.
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
        toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("CUBE_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("dispatcher.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&DispatcherConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Apply CUBE_* env var overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("CUBE_NODE__NAME") {
            self.node.name = v;
        }
        if let Ok(v) = std::env::var("CUBE_NETWORK__LISTEN_PORT") {
            if let Ok(p) = v.parse() {
                self.network.listen_port = p;
            }
        }
        if let Ok(v) = std::env::var("CUBE_PERFORMER__BLOCK_TIMEOUT_MS") {
            if let Ok(ms) = v.parse() {
                self.performer.block_timeout_ms = ms;
            }
        }
        if let Ok(v) = std::env::var("CUBE_DAEMON__DEVICE_TIMEOUT_SECS") {
            if let Ok(secs) = v.parse() {
                self.daemon.device_timeout_secs = secs;
            }
        }
    }
}
