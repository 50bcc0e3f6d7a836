//! Configuration for container-backup.
//!
//! Loads configuration from a TOML file. Every field has a default, so an
//! empty file (or no file at all) is a valid configuration.

use crate::utils::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Environment variable naming a config file when `--config` is absent.
pub const CONFIG_ENV: &str = "CONTAINER_BACKUP_CONFIG";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub log: LogConfig,

    #[serde(default)]
    pub runtime: RuntimeConfig,

    #[serde(default)]
    pub backup: BackupConfig,

    #[serde(default)]
    pub restore: RestoreConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Container CLI to exec
    #[serde(default = "default_docker_bin")]
    pub docker_bin: String,

    /// Docker Engine HTTP endpoint, e.g. `http://127.0.0.1:2375`
    #[serde(default)]
    pub api_url: Option<String>,

    /// Image used to copy data into volumes
    #[serde(default = "default_helper_image")]
    pub helper_image: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupConfig {
    /// Gzip level for the final archive (0-9)
    #[serde(default = "default_compression_level")]
    pub compression_level: u32,

    /// Parent directory for scratch space (system temp dir when unset)
    #[serde(default)]
    pub scratch_dir: Option<PathBuf>,

    /// Mounts archived concurrently
    #[serde(default = "default_archive_workers")]
    pub archive_workers: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestoreConfig {
    /// Health wait timeout in seconds
    #[serde(default = "default_wait_timeout_secs")]
    pub wait_timeout_secs: u64,

    /// Seconds between health polls
    #[serde(default = "default_health_poll_interval_secs")]
    pub health_poll_interval_secs: u64,

    /// Where missing bind sources are recreated when no root is given
    #[serde(default)]
    pub default_bind_restore_root: Option<PathBuf>,
}

// Default values
fn default_log_level() -> String {
    "info".to_string()
}

fn default_docker_bin() -> String {
    "docker".to_string()
}

fn default_helper_image() -> String {
    "alpine:3.19".to_string()
}

fn default_compression_level() -> u32 {
    crate::archive::DEFAULT_COMPRESSION_LEVEL
}

fn default_archive_workers() -> usize {
    4
}

fn default_wait_timeout_secs() -> u64 {
    120
}

fn default_health_poll_interval_secs() -> u64 {
    2
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            docker_bin: default_docker_bin(),
            api_url: None,
            helper_image: default_helper_image(),
        }
    }
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            compression_level: default_compression_level(),
            scratch_dir: None,
            archive_workers: default_archive_workers(),
        }
    }
}

impl Default for RestoreConfig {
    fn default() -> Self {
        Self {
            wait_timeout_secs: default_wait_timeout_secs(),
            health_poll_interval_secs: default_health_poll_interval_secs(),
            default_bind_restore_root: None,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| EngineError::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `path`, else from the file named by [`CONFIG_ENV`], else
    /// use defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        if let Some(path) = path {
            return Self::from_file(path);
        }
        match std::env::var_os(CONFIG_ENV) {
            Some(path) if !path.is_empty() => Self::from_file(Path::new(&path)),
            _ => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.backup.compression_level > 9 {
            return Err(EngineError::Config(format!(
                "backup.compression_level must be 0-9, got {}",
                self.backup.compression_level
            )));
        }
        if self.backup.archive_workers == 0 {
            return Err(EngineError::Config(
                "backup.archive_workers must be at least 1".to_string(),
            ));
        }
        if self.restore.health_poll_interval_secs == 0 {
            return Err(EngineError::Config(
                "restore.health_poll_interval_secs must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
