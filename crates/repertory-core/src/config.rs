//! Engine configuration
//!
//! Supports TOML configuration files with sensible defaults. Configuration
//! is loaded from:
//! - macOS: ~/Library/Application Support/repertory/config.toml
//! - Linux: ~/.config/repertory/config.toml
//! - Windows: %APPDATA%/repertory/config.toml

use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Polling frequencies for `file_manager`'s background sweeps (spec §4.8).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PollingConfig {
    /// High-frequency sweep interval in seconds (e.g. upload retry check).
    pub high_freq_secs: u64,
    /// Medium-frequency sweep interval in seconds (e.g. eviction check).
    pub medium_freq_secs: u64,
    /// Low-frequency sweep interval in seconds (e.g. deleted-file reaper).
    pub low_freq_secs: u64,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            high_freq_secs: 5,
            medium_freq_secs: 30,
            low_freq_secs: 300,
        }
    }
}

/// Engine-wide configuration (spec §2 ambient stack).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Chunk size in bytes used to partition every cached file.
    pub chunk_size: u64,
    /// Seconds the reader thread waits for a chunk before giving up.
    pub chunk_timeout_secs: u64,
    /// Maximum total bytes the local cache may occupy before eviction.
    pub cache_max_bytes: u64,
    /// Maximum number of concurrent upload tasks.
    pub max_upload_count: usize,
    /// Seconds between provider-offline retry attempts at startup.
    pub online_check_retry_secs: u64,
    /// Background sweep intervals.
    pub polling: PollingConfig,
    /// Cache directory (uses the system cache dir if `None`).
    pub cache_dir: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            chunk_size: 8 * 1024 * 1024, // 8MiB
            chunk_timeout_secs: 30,
            cache_max_bytes: 10 * 1024 * 1024 * 1024, // 10GiB
            max_upload_count: 5,
            online_check_retry_secs: 15,
            polling: PollingConfig::default(),
            cache_dir: None,
        }
    }
}

impl EngineConfig {
    /// Load configuration from the default path.
    pub fn load() -> Self {
        match Self::default_path() {
            Some(path) => Self::load_from(&path).unwrap_or_else(|e| {
                warn!("failed to load config from {:?}: {}, using defaults", path, e);
                Self::default()
            }),
            None => {
                debug!("no config directory found, using defaults");
                Self::default()
            }
        }
    }

    /// Load configuration from a specific path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            debug!("config file {:?} not found, using defaults", path);
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io(e.to_string()))?;
        let config: EngineConfig =
            toml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))?;

        info!("loaded config from {:?}", path);
        Ok(config)
    }

    /// Save configuration to the default path.
    pub fn save(&self) -> Result<(), ConfigError> {
        match Self::default_path() {
            Some(path) => self.save_to(&path),
            None => Err(ConfigError::NoConfigDir),
        }
    }

    /// Save configuration to a specific path.
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::Io(e.to_string()))?;
        }

        let content = toml::to_string_pretty(self).map_err(|e| ConfigError::Serialize(e.to_string()))?;
        std::fs::write(path, content).map_err(|e| ConfigError::Io(e.to_string()))?;

        info!("saved config to {:?}", path);
        Ok(())
    }

    /// The default config file path.
    pub fn default_path() -> Option<PathBuf> {
        ProjectDirs::from("com", "repertory", "repertory")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// The default cache directory.
    pub fn default_cache_dir() -> Option<PathBuf> {
        ProjectDirs::from("com", "repertory", "repertory").map(|dirs| dirs.cache_dir().to_path_buf())
    }

    /// The effective cache directory: config override, else system default,
    /// else a fixed fallback.
    pub fn cache_dir(&self) -> PathBuf {
        self.cache_dir
            .clone()
            .or_else(Self::default_cache_dir)
            .unwrap_or_else(|| PathBuf::from("/tmp/repertory"))
    }

    /// Generate a sample configuration file's content.
    pub fn sample() -> String {
        toml::to_string_pretty(&Self::default()).unwrap_or_default()
    }
}

/// Configuration errors.
#[derive(Debug, Clone)]
pub enum ConfigError {
    Io(String),
    Parse(String),
    Serialize(String),
    NoConfigDir,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "I/O error: {e}"),
            ConfigError::Parse(e) => write!(f, "parse error: {e}"),
            ConfigError::Serialize(e) => write!(f, "serialization error: {e}"),
            ConfigError::NoConfigDir => write!(f, "no configuration directory available"),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_expected_values() {
        let config = EngineConfig::default();
        assert_eq!(config.chunk_size, 8 * 1024 * 1024);
        assert_eq!(config.max_upload_count, 5);
        assert_eq!(config.cache_max_bytes, 10 * 1024 * 1024 * 1024);
    }

    #[test]
    fn config_round_trips_through_toml() {
        let config = EngineConfig::default();
        let toml_str = toml::to_string(&config).unwrap();
        let parsed: EngineConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed.chunk_size, config.chunk_size);
    }

    #[test]
    fn partial_toml_fills_in_defaults() {
        let toml_str = r#"
            chunk_size = 1048576
        "#;
        let config: EngineConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.chunk_size, 1048576);
        assert_eq!(config.max_upload_count, 5);
    }

    #[test]
    fn sample_config_contains_known_keys() {
        let sample = EngineConfig::sample();
        assert!(sample.contains("chunk_size"));
        assert!(sample.contains("[polling]"));
    }

    #[test]
    fn load_from_missing_path_uses_defaults() {
        let config = EngineConfig::load_from(Path::new("/nonexistent/config.toml")).unwrap();
        assert_eq!(config.chunk_size, 8 * 1024 * 1024);
    }
}
