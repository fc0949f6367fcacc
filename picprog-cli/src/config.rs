//! Configuration file support for picprog.
//!
//! Configuration is loaded from multiple sources with the following priority (highest first):
//! 1. Command-line arguments
//! 2. Environment variables (PICPROG_*)
//! 3. Local config file (./picprog.toml)
//! 4. Global config file (~/.config/picprog/config.toml)
//!
//! An explicit `--config PATH` replaces both files.

use directories::ProjectDirs;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::CliError;

/// Name of the per-directory config file.
pub const LOCAL_CONFIG: &str = "picprog.toml";

/// Connection configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Serial port (e.g., "/dev/ttyACM0" or "COM3").
    pub port: Option<String>,
    /// Baud rate.
    pub baud: Option<u32>,
    /// Delay before the handshake, in milliseconds.
    pub settle_ms: Option<u64>,
    /// Read timeout in milliseconds.
    pub timeout_ms: Option<u64>,
}

/// Target configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetConfig {
    /// Device name, skips identification when set.
    pub device: Option<String>,
}

/// Main configuration structure.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// Connection settings.
    #[serde(default)]
    pub connection: ConnectionConfig,
    /// Target settings.
    #[serde(default)]
    pub target: TargetConfig,
}

impl Config {
    /// Load configuration from the global and local files.
    pub fn load() -> Self {
        let global = Self::global_config_path();
        Self::load_layers(global.as_deref(), Path::new(LOCAL_CONFIG))
    }

    /// Load a global file, then merge a local file over it.
    ///
    /// Unreadable or malformed files are skipped with a warning.
    pub fn load_layers(global: Option<&Path>, local: &Path) -> Self {
        let mut config = Self::default();

        if let Some(global_path) = global {
            if let Some(global_config) = Self::load_from_file(global_path) {
                debug!("Loaded global config from {}", global_path.display());
                config.merge(global_config);
            }
        }

        if let Some(local_config) = Self::load_from_file(local) {
            debug!("Loaded local config from {}", local.display());
            config.merge(local_config);
        }

        config
    }

    /// Load configuration from a specific file path (--config flag).
    pub fn load_from_path(path: &Path) -> Result<Self, CliError> {
        let content = fs::read_to_string(path)
            .map_err(|e| CliError::Config(format!("cannot read {}: {e}", path.display())))?;
        let config = toml::from_str(&content)
            .map_err(|e| CliError::Config(format!("invalid config {}: {e}", path.display())))?;
        debug!("Loaded config from {}", path.display());
        Ok(config)
    }

    /// Load configuration from a specific file.
    fn load_from_file(path: &Path) -> Option<Self> {
        if !path.exists() {
            return None;
        }

        match fs::read_to_string(path) {
            Ok(content) => match toml::from_str(&content) {
                Ok(config) => Some(config),
                Err(e) => {
                    warn!("Failed to parse config file {}: {}", path.display(), e);
                    None
                },
            },
            Err(e) => {
                warn!("Failed to read config file {}: {}", path.display(), e);
                None
            },
        }
    }

    /// Get the global configuration directory.
    pub fn global_config_dir() -> Option<PathBuf> {
        ProjectDirs::from("", "", "picprog").map(|dirs| dirs.config_dir().to_path_buf())
    }

    /// Get the global configuration file path.
    pub fn global_config_path() -> Option<PathBuf> {
        Self::global_config_dir().map(|dir| dir.join("config.toml"))
    }

    /// Merge another config into this one.
    fn merge(&mut self, other: Self) {
        let Self { connection, target } = other;
        if connection.port.is_some() {
            self.connection.port = connection.port;
        }
        if connection.baud.is_some() {
            self.connection.baud = connection.baud;
        }
        if connection.settle_ms.is_some() {
            self.connection.settle_ms = connection.settle_ms;
        }
        if connection.timeout_ms.is_some() {
            self.connection.timeout_ms = connection.timeout_ms;
        }
        if target.device.is_some() {
            self.target.device = target.device;
        }
    }
}
