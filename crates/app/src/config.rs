//! Server configuration
//!
//! Loaded from a TOML file. Every field has a default and a missing file
//! yields the defaults, so `livecourse` runs with no configuration at all.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use serde::Deserialize;

use livecourse_core::{LifecycleConfig, MediaConfig, RecordingConfig};

/// Environment variable naming the config file
pub const CONFIG_ENV: &str = "LIVECOURSE_CONFIG";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Could not determine data directory")]
    NoDataDir,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub lifecycle: LifecycleConfig,
    pub media: MediaConfig,
    pub recording: RecordingConfig,
    pub log: LogConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub signaling_addr: SocketAddr,
    pub control_addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            signaling_addr: SocketAddr::from(([0, 0, 0, 0], livecourse_net::DEFAULT_SIGNALING_PORT)),
            control_addr: SocketAddr::from(([127, 0, 0, 1], livecourse_net::DEFAULT_CONTROL_PORT)),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Memory,
    #[default]
    Sqlite,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    /// Database file; defaults to the platform data directory
    pub path: Option<PathBuf>,
}

impl StorageConfig {
    pub fn database_path(&self) -> Result<PathBuf, ConfigError> {
        if let Some(path) = &self.path {
            return Ok(path.clone());
        }
        let dirs =
            ProjectDirs::from("dev", "livecourse", "livecourse").ok_or(ConfigError::NoDataDir)?;
        Ok(dirs.data_dir().join("livecourse.db"))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Default tracing filter; `RUST_LOG` takes precedence
    pub filter: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: "info".into(),
        }
    }
}

impl Config {
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Read a config file, falling back to defaults when it does not exist
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        match std::fs::read_to_string(path) {
            Ok(content) => Self::from_toml(&content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(source) => Err(ConfigError::Io {
                path: path.to_path_buf(),
                source,
            }),
        }
    }
}

/// Config path from `--config <path>`, `--config=<path>` or the environment
pub fn config_path(
    mut args: impl Iterator<Item = String>,
    env: Option<String>,
) -> Option<PathBuf> {
    while let Some(arg) = args.next() {
        if arg == "--config" {
            return args.next().map(PathBuf::from);
        }
        if let Some(path) = arg.strip_prefix("--config=") {
            return Some(PathBuf::from(path));
        }
    }
    env.filter(|v| !v.is_empty()).map(PathBuf::from)
}
