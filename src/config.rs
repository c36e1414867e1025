//! YAML configuration for catalog enrichment.
//!
//! Every section is optional; a missing file means all defaults. CLI flags are
//! applied on top of the file by the binary, and secrets only ever come from the
//! environment (optionally via a `.env` file).
//!
//! ## Example YAML Configuration
//!
//! ```yaml
//! version: "1"
//!
//! upstream:
//!   api_base: "https://api.spotify.com/v1"
//!   token_url: "https://accounts.spotify.com/api/token"
//!   timeout: 30000
//!
//! client:
//!   search_retry: { max_attempts: 3 }
//!   entity_retry: { max_attempts: 5 }
//!   rate_limited: { default_wait: 60000, max_wait: 300000 }
//!
//! rate_limit:
//!   initial_rate_per_minute: 80
//!   min_rate_per_minute: 20
//!   max_rate_per_minute: 90
//!
//! circuit_breaker:
//!   failure_threshold: 5
//!   reset_timeout: 300000
//!   success_threshold: 3
//!
//! batch:
//!   batch_size: 25
//!   max_workers: 2
//!   inter_batch_delay: 500
//!   cache_flush_every: 50
//!   cache_flush_interval: 300000
//!
//! state_dir: "./state"
//!
//! sink:
//!   backend: "redb"
//!   path: "./state/catalog.redb"
//! ```

use resilience::{CircuitBreakerConfig, RateLimitConfig};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use store::SinkConfig;
use thiserror::Error;
use upstream::{ClientConfig, Credentials, HttpConfig};

pub const ENV_CLIENT_ID: &str = "ENRICH_CLIENT_ID";
pub const ENV_CLIENT_SECRET: &str = "ENRICH_CLIENT_SECRET";
pub const ENV_DATABASE_URL: &str = "ENRICH_DATABASE_URL";

/// Errors that can occur when loading configuration files
#[derive(Debug, Error)]
pub enum ConfigLoadError {
    #[error("failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),

    #[error("failed to parse YAML: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("unsupported config version: {0}")]
    UnsupportedVersion(String),
}

/// Batch scan settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Width of one scan window in ids.
    pub batch_size: i64,
    /// Concurrent items per window.
    pub max_workers: usize,
    /// Pause between windows, in milliseconds.
    #[serde(with = "resilience::serde_millis")]
    pub inter_batch_delay: Duration,
    /// Flush caches after this many finished items.
    pub cache_flush_every: u64,
    /// ...or after this long, in milliseconds, whichever comes first.
    #[serde(with = "resilience::serde_millis")]
    pub cache_flush_interval: Duration,
    /// Log a progress line every this many finished items.
    pub progress_every: u64,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            batch_size: 25,
            max_workers: 2,
            inter_batch_delay: Duration::from_millis(500),
            cache_flush_every: 50,
            cache_flush_interval: Duration::from_secs(300),
            progress_every: 10,
        }
    }
}

impl BatchConfig {
    pub fn with_batch_size(mut self, batch_size: i64) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_max_workers(mut self, max_workers: usize) -> Self {
        self.max_workers = max_workers;
        self
    }

    pub fn with_inter_batch_delay(mut self, delay: Duration) -> Self {
        self.inter_batch_delay = delay;
        self
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichConfig {
    /// Configuration format version
    #[serde(default = "default_version")]
    pub version: String,

    #[serde(default)]
    pub upstream: HttpConfig,

    #[serde(default)]
    pub client: ClientConfig,

    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,

    #[serde(default)]
    pub batch: BatchConfig,

    /// Directory holding per-shard checkpoint and cache files.
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,

    /// Defaults to the in-process memory sink. Concurrent shards need `postgres`.
    #[serde(default)]
    pub sink: SinkConfig,
}

fn default_version() -> String {
    "1".to_string()
}

fn default_state_dir() -> PathBuf {
    PathBuf::from("state")
}

impl Default for EnrichConfig {
    fn default() -> Self {
        Self {
            version: default_version(),
            upstream: HttpConfig::default(),
            client: ClientConfig::default(),
            rate_limit: RateLimitConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            batch: BatchConfig::default(),
            state_dir: default_state_dir(),
            sink: SinkConfig::default(),
        }
    }
}

impl EnrichConfig {
    /// Load a YAML configuration file from the given path
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigLoadError> {
        let content = fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parse YAML configuration from a string
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigLoadError> {
        let config: EnrichConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// File if given, defaults otherwise, then environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigLoadError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Apply environment overrides through `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(database_url) = lookup(ENV_DATABASE_URL).filter(|v| !v.is_empty()) {
            match &mut self.sink {
                SinkConfig::Postgres { url, .. } => *url = database_url,
                other => {
                    tracing::debug!(
                        sink = other.backend_name(),
                        "{ENV_DATABASE_URL} set but sink is not postgres, ignoring"
                    );
                }
            }
        }
    }

    /// Client credentials from the environment, if both halves are set.
    pub fn credentials(&self) -> Option<Credentials> {
        credentials_from(|key| std::env::var(key).ok())
    }

    /// Override the per-shard rate ceiling, keeping the other bounds consistent.
    pub fn set_max_rate(&mut self, per_minute: f64) {
        let limits = &mut self.rate_limit;
        limits.max_rate_per_minute = per_minute;
        limits.min_rate_per_minute = limits.min_rate_per_minute.min(per_minute);
        limits.initial_rate_per_minute = limits.initial_rate_per_minute.min(per_minute);
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigLoadError> {
        match self.version.as_str() {
            "1" | "1.0" => {}
            v => return Err(ConfigLoadError::UnsupportedVersion(v.to_string())),
        }

        if self.batch.batch_size <= 0 {
            return Err(ConfigLoadError::Validation(
                "batch.batch_size must be positive".to_string(),
            ));
        }
        if self.batch.max_workers == 0 {
            return Err(ConfigLoadError::Validation(
                "batch.max_workers must be at least 1".to_string(),
            ));
        }

        let rate = &self.rate_limit;
        if !(rate.min_rate_per_minute > 0.0) || rate.min_rate_per_minute > rate.max_rate_per_minute {
            return Err(ConfigLoadError::Validation(format!(
                "rate_limit bounds invalid: min {} / max {}",
                rate.min_rate_per_minute, rate.max_rate_per_minute
            )));
        }
        if rate.window.is_zero() {
            return Err(ConfigLoadError::Validation(
                "rate_limit.window must be non-zero".to_string(),
            ));
        }

        if self.circuit_breaker.failure_threshold == 0 || self.circuit_breaker.success_threshold == 0 {
            return Err(ConfigLoadError::Validation(
                "circuit_breaker thresholds must be at least 1".to_string(),
            ));
        }

        if self.client.search_retry.max_attempts == 0 || self.client.entity_retry.max_attempts == 0 {
            return Err(ConfigLoadError::Validation(
                "client retry policies need at least one attempt".to_string(),
            ));
        }

        Ok(())
    }
}

fn credentials_from<F>(lookup: F) -> Option<Credentials>
where
    F: Fn(&str) -> Option<String>,
{
    let id = lookup(ENV_CLIENT_ID).filter(|v| !v.is_empty())?;
    let secret = lookup(ENV_CLIENT_SECRET).filter(|v| !v.is_empty())?;
    Some(Credentials::new(id, secret))
}
