//! Configuration management for cove
//!
//! This module provides environment-based configuration management with
//! support for defaults, validation, and TOML config files.

use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;
use std::time::Duration;

mod error;

pub use error::ConfigError;

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Group session configuration
    pub session: SessionConfig,

    /// Message deduplication configuration
    pub dedup: DedupConfig,

    /// Welcome staging configuration
    pub staging: StagingConfig,

    /// Storage configuration
    pub storage: StorageConfig,

    /// Logging configuration
    pub logging: LoggingConfig,

    /// Metrics configuration
    pub metrics: MetricsConfig,
}

/// Group session configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Maximum group size (0 = unlimited)
    pub max_group_size: usize,

    /// Timeout for network-bound key-package fetches.
    /// A timeout degrades to "no keys for this member", it never
    /// aborts the whole group operation.
    #[serde(with = "humantime_serde")]
    pub key_package_timeout: Duration,

    /// Event channel capacity (buffered session events)
    pub event_buffer: usize,

    /// Graceful shutdown timeout
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,
}

/// Message deduplication configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DedupConfig {
    /// Record count that triggers eviction
    pub max_entries: usize,

    /// Record count kept after eviction (most recent by timestamp)
    pub keep_entries: usize,
}

/// Welcome staging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StagingConfig {
    /// Age after which a pending staged welcome is eligible for
    /// garbage collection via `purge_stale`
    #[serde(with = "humantime_serde")]
    pub stale_after: Duration,
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Data directory for persisted blobs
    pub data_dir: PathBuf,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Enable JSON formatting
    pub json_format: bool,

    /// Include timestamps
    pub with_timestamp: bool,

    /// Include target module
    pub with_target: bool,
}

/// Metrics configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable metrics collection
    pub enabled: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            session: SessionConfig::default(),
            dedup: DedupConfig::default(),
            staging: StagingConfig::default(),
            storage: StorageConfig::default(),
            logging: LoggingConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_group_size: 1000,
            key_package_timeout: Duration::from_secs(10),
            event_buffer: 100,
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            max_entries: 2000,
            keep_entries: 1000,
        }
    }
}

impl Default for StagingConfig {
    fn default() -> Self {
        Self {
            stale_after: Duration::from_secs(7 * 24 * 3600),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_format: false,
            with_timestamp: true,
            with_target: true,
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

impl Config {
    /// Load configuration from environment variables
    ///
    /// Environment variables follow the pattern: COVE_<SECTION>_<KEY>
    /// Example: COVE_DEDUP_MAX_ENTRIES=4000
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        // Session config
        if let Ok(max_size) = env::var("COVE_SESSION_MAX_GROUP_SIZE") {
            config.session.max_group_size = max_size.parse().map_err(|e| {
                ConfigError::BadEnvValue(format!("COVE_SESSION_MAX_GROUP_SIZE: {}", e))
            })?;
        }
        if let Ok(buffer) = env::var("COVE_SESSION_EVENT_BUFFER") {
            config.session.event_buffer = buffer
                .parse()
                .map_err(|e| ConfigError::BadEnvValue(format!("COVE_SESSION_EVENT_BUFFER: {}", e)))?;
        }

        // Dedup config
        if let Ok(max_entries) = env::var("COVE_DEDUP_MAX_ENTRIES") {
            config.dedup.max_entries = max_entries
                .parse()
                .map_err(|e| ConfigError::BadEnvValue(format!("COVE_DEDUP_MAX_ENTRIES: {}", e)))?;
        }
        if let Ok(keep_entries) = env::var("COVE_DEDUP_KEEP_ENTRIES") {
            config.dedup.keep_entries = keep_entries
                .parse()
                .map_err(|e| ConfigError::BadEnvValue(format!("COVE_DEDUP_KEEP_ENTRIES: {}", e)))?;
        }

        // Storage config
        if let Ok(data_dir) = env::var("COVE_STORAGE_DATA_DIR") {
            config.storage.data_dir = PathBuf::from(data_dir);
        }

        // Logging config
        if let Ok(level) = env::var("COVE_LOG_LEVEL") {
            config.logging.level = level;
        }
        if let Ok(json) = env::var("COVE_LOG_JSON") {
            config.logging.json_format = json
                .parse()
                .map_err(|e| ConfigError::BadEnvValue(format!("COVE_LOG_JSON: {}", e)))?;
        }

        // Metrics config
        if let Ok(enabled) = env::var("COVE_METRICS_ENABLED") {
            config.metrics.enabled = enabled
                .parse()
                .map_err(|e| ConfigError::BadEnvValue(format!("COVE_METRICS_ENABLED: {}", e)))?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self, ConfigError> {
        let contents =
            std::fs::read_to_string(path).map_err(|e| ConfigError::Read(e.to_string()))?;

        let config: Self =
            toml::from_str(&contents).map_err(|e| ConfigError::Malformed(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.dedup.max_entries == 0 {
            return Err(ConfigError::Invalid(
                "dedup.max_entries must be greater than 0".to_string(),
            ));
        }

        if self.dedup.keep_entries > self.dedup.max_entries {
            return Err(ConfigError::Invalid(
                "dedup.keep_entries must not exceed dedup.max_entries".to_string(),
            ));
        }

        if self.session.event_buffer == 0 {
            return Err(ConfigError::Invalid(
                "session.event_buffer must be greater than 0".to_string(),
            ));
        }

        if crate::logging::LogLevel::parse(&self.logging.level).is_none() {
            return Err(ConfigError::Invalid(format!(
                "unknown log level: {}",
                self.logging.level
            )));
        }

        Ok(())
    }

    /// Save configuration to file
    pub fn save_to_file(&self, path: impl AsRef<std::path::Path>) -> Result<(), ConfigError> {
        let contents =
            toml::to_string_pretty(self).map_err(|e| ConfigError::Render(e.to_string()))?;

        std::fs::write(path, contents).map_err(|e| ConfigError::Write(e.to_string()))?;

        Ok(())
    }
}
