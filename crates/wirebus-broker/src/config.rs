//! TOML configuration for the broker binary.
//!
//! The config file location is taken from the `WIREBUS_CONFIG` environment
//! variable, falling back to `wirebus.toml` in the working directory. A
//! missing file is not an error: every field has a default, so the broker
//! runs out of the box.
//!
//! ```toml
//! [listener]
//! bind_address = "0.0.0.0"
//! port = 7800
//!
//! [log]
//! level = "info"
//! ```

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Environment variable overriding the config file path.
pub const CONFIG_PATH_ENV: &str = "WIREBUS_CONFIG";

/// Error type for configuration file operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A file system I/O error occurred.
    #[error("I/O error reading config at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The TOML content could not be parsed.
    #[error("failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Top-level broker configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct BusConfig {
    #[serde(default)]
    pub listener: ListenerConfig,
    #[serde(default)]
    pub log: LogConfig,
}

/// Listener socket settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ListenerConfig {
    /// IP address to bind. `"0.0.0.0"` binds all interfaces.
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    /// TCP port clients connect to.
    #[serde(default = "default_port")]
    pub port: u16,
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LogConfig {
    /// `tracing` log level: `"error"`, `"warn"`, `"info"`, `"debug"`, `"trace"`.
    /// Overridden at runtime by `RUST_LOG`.
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    7800
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_port(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Resolves the config file path from the environment.
pub fn config_path() -> PathBuf {
    std::env::var_os(CONFIG_PATH_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("wirebus.toml"))
}

/// Loads [`BusConfig`] from disk, returning defaults if the file does not
/// exist.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] for file-system errors other than "not found"
/// and [`ConfigError::Parse`] if the TOML is malformed.
pub fn load_config() -> Result<BusConfig, ConfigError> {
    let path = config_path();
    match std::fs::read_to_string(&path) {
        Ok(content) => Ok(toml::from_str(&content)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BusConfig::default()),
        Err(source) => Err(ConfigError::Io { path, source }),
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
