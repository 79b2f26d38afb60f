//! Aggregate prefetch configuration
//!
//! One TOML document with a section per component:
//!
//! ```toml
//! [cache]
//! max_entries = 100
//!
//! [dedup]
//! navigation_ttl_ms = 100
//! decode_ttl_ms = 30000
//!
//! [preload]
//! decode_timeout_ms = 5000
//! inter_task_delay_ms = 100
//!
//! [batch]
//! max_pending = 512
//! batch_size = 64
//! flush_delay_ms = 16
//!
//! [velocity]
//! smoothing_factor = 0.3
//! min_velocity = 0.1
//! prediction_multiplier = 2.0
//!
//! [loader]
//! look_ahead = 5
//! scroll_threshold = 50.0
//! ```
//!
//! Every section and key is optional.

use std::fs;
use std::io;
use std::path::Path;

use pageview_cache::{CacheConfig, CacheConfigError, DedupConfig};
use pageview_scheduler::{BatchConfig, LoaderConfig, PreloadConfig, VelocityConfig};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration for every prefetch component
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PrefetchConfig {
    /// Resource cache limits
    pub cache: CacheConfig,
    /// Claim windows for navigation and decode
    pub dedup: DedupConfig,
    /// Decode timeout and pacing
    pub preload: PreloadConfig,
    /// Thumbnail batch sizing
    pub batch: BatchConfig,
    /// Scroll velocity smoothing
    pub velocity: VelocityConfig,
    /// Index look-ahead
    pub loader: LoaderConfig,
}

impl PrefetchConfig {
    /// Sets the cache section.
    pub fn with_cache(mut self, cache: CacheConfig) -> Self {
        self.cache = cache;
        self
    }

    /// Sets the preload section.
    pub fn with_preload(mut self, preload: PreloadConfig) -> Self {
        self.preload = preload;
        self
    }

    /// Sets the batch section.
    pub fn with_batch(mut self, batch: BatchConfig) -> Self {
        self.batch = batch;
        self
    }

    /// Loads configuration from environment variables.
    ///
    /// In addition to the `PAGEVIEW_CACHE_*` and `PAGEVIEW_DEDUP_*` variables
    /// read by the cache crate:
    /// - `PAGEVIEW_DECODE_TIMEOUT_MS` (default: 5000)
    /// - `PAGEVIEW_INTER_TASK_DELAY_MS` (default: 100)
    /// - `PAGEVIEW_BATCH_MAX_PENDING` (default: 512)
    /// - `PAGEVIEW_BATCH_SIZE` (default: 64)
    /// - `PAGEVIEW_BATCH_FLUSH_MS` (default: 16)
    /// - `PAGEVIEW_LOOK_AHEAD` (default: 5)
    ///
    /// # Errors
    /// Returns an error if any environment variable contains an invalid value.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self {
            cache: CacheConfig::from_env()?,
            dedup: DedupConfig::from_env()?,
            ..Self::default()
        };

        if let Some(value) = env_parse("PAGEVIEW_DECODE_TIMEOUT_MS")? {
            config.preload.decode_timeout_ms = value;
        }
        if let Some(value) = env_parse("PAGEVIEW_INTER_TASK_DELAY_MS")? {
            config.preload.inter_task_delay_ms = value;
        }
        if let Some(value) = env_parse("PAGEVIEW_BATCH_MAX_PENDING")? {
            config.batch.max_pending = value;
        }
        if let Some(value) = env_parse("PAGEVIEW_BATCH_SIZE")? {
            config.batch.batch_size = value;
        }
        if let Some(value) = env_parse("PAGEVIEW_BATCH_FLUSH_MS")? {
            config.batch.flush_delay_ms = value;
        }
        if let Some(value) = env_parse("PAGEVIEW_LOOK_AHEAD")? {
            config.loader.look_ahead = value;
        }

        config.validate()?;
        Ok(config)
    }

    /// Loads configuration from a TOML file.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path.as_ref())?;
        let config: Self = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Saves configuration to a TOML file.
    ///
    /// # Errors
    /// Returns an error if the file cannot be written.
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let contents = toml::to_string_pretty(self)?;
        fs::write(path.as_ref(), contents)?;
        Ok(())
    }

    /// Checks that every section is usable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.cache.validate()?;

        if self.batch.batch_size == 0 {
            return Err(ConfigError::InvalidValue("batch.batch_size".to_string()));
        }
        if self.batch.max_pending < self.batch.batch_size {
            return Err(ConfigError::InvalidValue("batch.max_pending".to_string()));
        }
        if self.preload.decode_timeout_ms == 0 {
            return Err(ConfigError::InvalidValue("preload.decode_timeout_ms".to_string()));
        }
        if !(0.0..=1.0).contains(&self.velocity.smoothing_factor) {
            return Err(ConfigError::InvalidValue("velocity.smoothing_factor".to_string()));
        }
        if self.loader.look_ahead > self.loader.max_look_ahead {
            return Err(ConfigError::InvalidValue("loader.look_ahead".to_string()));
        }
        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Result<Option<T>, ConfigError> {
    match std::env::var(name) {
        Ok(value) => value
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue(name.to_string())),
        Err(_) => Ok(None),
    }
}

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Invalid cache section
    #[error(transparent)]
    Cache(#[from] CacheConfigError),

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
