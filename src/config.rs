//! Configuration for the selftop daemon.

use crate::collector::SubscriberConfig;
use crate::core::{AggregatorConfig, LookupPolicy, IDLE_TIMEOUT_MS, MOTION_FILTER_MS};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// Main configuration for the daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Capture agent publisher, `tcp://host:port`
    pub source_url: String,

    /// SQLite database holding identities and sessions
    pub database_path: PathBuf,

    /// Directory for ingest statistics
    pub data_path: PathBuf,

    /// Device-clock gap that closes a session (milliseconds)
    pub idle_timeout_ms: u64,

    /// Motion samples closer than this count as one interaction (milliseconds)
    pub motion_filter_ms: u64,

    /// Behaviour when an identity lookup fails
    pub identity_lookup: LookupPolicy,

    /// Largest accepted wire message
    pub max_message_bytes: usize,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("selftop");

        Self {
            source_url: "tcp://127.0.0.1:1234".to_string(),
            database_path: data_dir.join("selftop.db"),
            data_path: data_dir,
            idle_timeout_ms: IDLE_TIMEOUT_MS,
            motion_filter_ms: MOTION_FILTER_MS,
            identity_lookup: LookupPolicy::FailFast,
            max_message_bytes: 64 * 1024,
        }
    }
}

impl Config {
    /// Load configuration from the default location.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(&Self::config_path())
    }

    /// Load configuration from `path`, falling back to defaults if it does
    /// not exist.
    pub fn load_from(path: &std::path::Path) -> Result<Self, ConfigError> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Config = serde_json::from_str(&content).map_err(ConfigError::Parse)?;
            config.validate()?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to the default location.
    pub fn save(&self) -> Result<(), ConfigError> {
        self.save_to(&Self::config_path())
    }

    pub fn save_to(&self, path: &std::path::Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = serde_json::to_string_pretty(self).map_err(ConfigError::Serialize)?;
        std::fs::write(path, content)?;

        Ok(())
    }

    /// Get the path to the configuration file.
    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("selftop")
            .join("config.json")
    }

    /// Path of the persisted ingest statistics.
    pub fn stats_path(&self) -> PathBuf {
        self.data_path.join("stats.json")
    }

    /// Ensure all required directories exist.
    pub fn ensure_directories(&self) -> Result<(), ConfigError> {
        std::fs::create_dir_all(&self.data_path)?;
        if let Some(parent) = self.database_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.idle_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "idle_timeout_ms must be greater than zero".to_string(),
            ));
        }
        if self.max_message_bytes == 0 {
            return Err(ConfigError::Invalid(
                "max_message_bytes must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn aggregator(&self) -> AggregatorConfig {
        AggregatorConfig {
            idle_timeout_ms: self.idle_timeout_ms,
            motion_filter_ms: self.motion_filter_ms,
            identity_lookup: self.identity_lookup,
        }
    }

    pub fn subscriber(&self) -> SubscriberConfig {
        SubscriberConfig {
            url: self.source_url.clone(),
            max_message_bytes: self.max_message_bytes,
        }
    }
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Parse error: {0}")]
    Parse(#[source] serde_json::Error),
    #[error("Serialize error: {0}")]
    Serialize(#[source] serde_json::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
