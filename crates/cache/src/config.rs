//! Cache configuration for resource cache limits and deduplication windows.
//!
//! Configuration can be loaded from a TOML file, environment variables,
//! or created programmatically.

use std::fs;
use std::io;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::dedup::{DedupPolicy, DEFAULT_MAX_RECORDS};
use crate::ram::DEFAULT_MAX_ENTRIES;

/// Configuration for the decoded resource cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Maximum number of cached decoded pages
    pub max_entries: usize,
    /// Optional byte budget in megabytes
    pub max_bytes_mb: Option<usize>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: DEFAULT_MAX_ENTRIES,
            max_bytes_mb: None,
        }
    }
}

impl CacheConfig {
    /// Sets the entry cap.
    pub fn with_max_entries(mut self, max_entries: usize) -> Self {
        self.max_entries = max_entries;
        self
    }

    /// Sets the byte budget in megabytes.
    pub fn with_max_mb(mut self, mb: usize) -> Self {
        self.max_bytes_mb = Some(mb);
        self
    }

    /// Returns the byte budget in bytes, if any.
    pub fn max_bytes(&self) -> Option<usize> {
        self.max_bytes_mb.map(|mb| mb * 1024 * 1024)
    }

    /// Loads configuration from environment variables.
    ///
    /// Environment variables:
    /// - `PAGEVIEW_CACHE_MAX_ENTRIES`: entry cap (default: 100)
    /// - `PAGEVIEW_CACHE_MAX_MB`: byte budget in MB (default: unbounded)
    ///
    /// # Errors
    /// Returns an error if any environment variable contains an invalid value.
    pub fn from_env() -> Result<Self, CacheConfigError> {
        let mut config = Self::default();

        if let Some(value) = env_usize("PAGEVIEW_CACHE_MAX_ENTRIES")? {
            config.max_entries = value;
        }
        if let Some(value) = env_usize("PAGEVIEW_CACHE_MAX_MB")? {
            config.max_bytes_mb = Some(value);
        }

        config.validate()?;
        Ok(config)
    }

    /// Loads configuration from a TOML file.
    ///
    /// Expected file format:
    /// ```toml
    /// max_entries = 100
    /// max_bytes_mb = 512
    /// ```
    ///
    /// Missing keys fall back to defaults.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, CacheConfigError> {
        let contents = fs::read_to_string(path.as_ref())?;
        let config: Self = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Saves configuration to a TOML file.
    ///
    /// # Errors
    /// Returns an error if the file cannot be written.
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), CacheConfigError> {
        let contents = toml::to_string_pretty(self)?;
        fs::write(path.as_ref(), contents)?;
        Ok(())
    }

    /// Checks that limits are usable.
    pub fn validate(&self) -> Result<(), CacheConfigError> {
        if self.max_entries == 0 {
            return Err(CacheConfigError::InvalidValue("max_entries".to_string()));
        }
        if self.max_bytes_mb == Some(0) {
            return Err(CacheConfigError::InvalidValue("max_bytes_mb".to_string()));
        }
        Ok(())
    }
}

/// Deduplication windows for navigation and decode requests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupConfig {
    /// Window for repeated navigation requests in milliseconds
    pub navigation_ttl_ms: u64,
    /// Window for duplicate decode requests in milliseconds
    pub decode_ttl_ms: u64,
    /// Bound on live records per deduplicator
    pub max_records: usize,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            navigation_ttl_ms: DedupPolicy::Navigation.ttl().as_millis() as u64,
            decode_ttl_ms: DedupPolicy::Decode.ttl().as_millis() as u64,
            max_records: DEFAULT_MAX_RECORDS,
        }
    }
}

impl DedupConfig {
    /// Sets the navigation window.
    pub fn with_navigation_ttl(mut self, ttl: Duration) -> Self {
        self.navigation_ttl_ms = ttl.as_millis() as u64;
        self
    }

    /// Sets the decode window.
    pub fn with_decode_ttl(mut self, ttl: Duration) -> Self {
        self.decode_ttl_ms = ttl.as_millis() as u64;
        self
    }

    /// Resolves a policy against the configured windows.
    ///
    /// `Custom` policies keep their own window.
    pub fn ttl_for(&self, policy: DedupPolicy) -> Duration {
        match policy {
            DedupPolicy::Navigation => Duration::from_millis(self.navigation_ttl_ms),
            DedupPolicy::Decode => Duration::from_millis(self.decode_ttl_ms),
            DedupPolicy::Custom(ttl) => ttl,
        }
    }

    /// Loads configuration from environment variables.
    ///
    /// Environment variables:
    /// - `PAGEVIEW_DEDUP_NAVIGATION_MS` (default: 100)
    /// - `PAGEVIEW_DEDUP_DECODE_MS` (default: 30000)
    /// - `PAGEVIEW_DEDUP_MAX_RECORDS` (default: 1024)
    pub fn from_env() -> Result<Self, CacheConfigError> {
        let mut config = Self::default();

        if let Some(value) = env_u64("PAGEVIEW_DEDUP_NAVIGATION_MS")? {
            config.navigation_ttl_ms = value;
        }
        if let Some(value) = env_u64("PAGEVIEW_DEDUP_DECODE_MS")? {
            config.decode_ttl_ms = value;
        }
        if let Some(value) = env_usize("PAGEVIEW_DEDUP_MAX_RECORDS")? {
            config.max_records = value;
        }

        Ok(config)
    }
}

fn env_usize(name: &str) -> Result<Option<usize>, CacheConfigError> {
    match std::env::var(name) {
        Ok(value) => value
            .trim()
            .parse::<usize>()
            .map(Some)
            .map_err(|_| CacheConfigError::InvalidValue(name.to_string())),
        Err(_) => Ok(None),
    }
}

fn env_u64(name: &str) -> Result<Option<u64>, CacheConfigError> {
    match std::env::var(name) {
        Ok(value) => value
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|_| CacheConfigError::InvalidValue(name.to_string())),
        Err(_) => Ok(None),
    }
}

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum CacheConfigError {
    /// Invalid value for a configuration parameter
    #[error("Invalid value for configuration key: {0}")]
    InvalidValue(String),

    /// I/O error reading or writing configuration file
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Malformed TOML
    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// Configuration could not be serialized
    #[error("Serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),
}
