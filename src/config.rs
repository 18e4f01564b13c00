// src/config.rs
//
// Daemon configuration, read from a TOML file. Every field has a default so a
// missing file or a partial file both load.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::debugger::{CdpConfig, PROTOCOL_VERSION};
use crate::session::ManagerOptions;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub debugger: DebuggerConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// `[debugger]`: where the browser listens and how long calls may take
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DebuggerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_protocol_version")]
    pub protocol_version: String,
    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,
}

/// `[store]`
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Settings file; defaults to the per-user data directory
    #[serde(default)]
    pub path: Option<PathBuf>,
    /// How often the daemon looks for external edits
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

/// `[logging]`
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Write a log file here in addition to stderr
    #[serde(default)]
    pub dir: Option<PathBuf>,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    9222
}
fn default_protocol_version() -> String {
    PROTOCOL_VERSION.to_string()
}
fn default_command_timeout_ms() -> u64 {
    5000
}
fn default_poll_interval_ms() -> u64 {
    1000
}

impl Default for DebuggerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            protocol_version: default_protocol_version(),
            command_timeout_ms: default_command_timeout_ms(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: None,
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

/// `<config dir>/tabmask/config.toml`
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("tabmask").join("config.toml"))
}

impl AppConfig {
    /// Load from `path`. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = match std::fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tlog!("[config] No config at {}, using defaults", path.display());
                return Ok(Self::default());
            }
            Err(source) => {
                return Err(ConfigError::Io {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Settings file location: the configured one, else the per-user data dir.
    pub fn store_path(&self) -> PathBuf {
        self.store.path.clone().unwrap_or_else(|| {
            dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("tabmask")
                .join("settings.json")
        })
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.debugger.command_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        // Zero would spin the reload loop
        Duration::from_millis(self.store.poll_interval_ms.max(50))
    }

    pub fn cdp(&self) -> CdpConfig {
        CdpConfig {
            host: self.debugger.host.clone(),
            port: self.debugger.port,
            ..CdpConfig::default()
        }
    }

    pub fn manager_options(&self) -> ManagerOptions {
        ManagerOptions {
            protocol_version: self.debugger.protocol_version.clone(),
            command_timeout: self.command_timeout(),
        }
    }
}
