//! Engine configuration
//!
//! All tunables for the sync engine live in [`EngineConfig`]. Defaults are
//! suitable for a ward tablet; every field can be overridden from the
//! environment (`MEDSYNC_*`, optionally via a `.env` file).

use crate::sync::models::ConflictStrategy;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

const ENV_PREFIX: &str = "MEDSYNC_";

// ============================================================================
// Retry Policy
// ============================================================================

/// Backoff policy applied by the retry queue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Delay before the first retry
    pub initial_backoff_ms: u64,

    /// Growth factor applied on every failure
    pub multiplier: f64,

    /// Ceiling for any single delay
    pub max_backoff_ms: u64,

    /// Attempts after which an item is abandoned
    pub max_retries: u32,

    /// Width of the downward jitter band (0.3 = up to 30% shorter)
    pub jitter_ratio: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_backoff_ms: 1_000,
            multiplier: 2.0,
            max_backoff_ms: 5 * 60 * 1_000,
            max_retries: 8,
            jitter_ratio: 0.3,
        }
    }
}

impl RetryPolicy {
    /// Fast policy for tests: tiny delays, few attempts
    pub fn testing() -> Self {
        Self {
            initial_backoff_ms: 10,
            multiplier: 2.0,
            max_backoff_ms: 1_000,
            max_retries: 5,
            jitter_ratio: 0.3,
        }
    }
}

// ============================================================================
// Network
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Offline drops shorter than this are swallowed
    pub debounce_ms: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self { debounce_ms: 1_000 }
    }
}

// ============================================================================
// Engine Configuration
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// SQLite file holding records, conflicts and operations
    pub database_path: PathBuf,

    /// Base URL of the FHIR resource server
    pub server_url: String,

    /// Bounded wait per network attempt
    pub request_timeout_secs: u64,

    /// Resources requested per pull page
    pub pull_page_size: u32,

    /// Periodic pull timer
    pub pull_interval_secs: u64,

    /// How often the background scheduler drains the retry queue
    pub drain_interval_secs: u64,

    /// PBKDF2 rounds for the per-user key
    pub kdf_iterations: u32,

    pub conflict_strategy: ConflictStrategy,

    pub retry: RetryPolicy,

    pub network: NetworkConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            server_url: "http://localhost:8080/fhir".to_string(),
            request_timeout_secs: 30,
            pull_page_size: 100,
            pull_interval_secs: 300,
            drain_interval_secs: 5,
            kdf_iterations: 100_000,
            conflict_strategy: ConflictStrategy::Manual,
            retry: RetryPolicy::default(),
            network: NetworkConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Load defaults, then apply `.env` and `MEDSYNC_*` overrides
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let mut config = Self::default();

        if let Some(path) = env_var("DATABASE_PATH") {
            config.database_path = PathBuf::from(path);
        }
        if let Some(url) = env_var("SERVER_URL") {
            config.server_url = url;
        }
        config.request_timeout_secs = env_parse("REQUEST_TIMEOUT_SECS", config.request_timeout_secs)?;
        config.pull_page_size = env_parse("PULL_PAGE_SIZE", config.pull_page_size)?;
        config.pull_interval_secs = env_parse("PULL_INTERVAL_SECS", config.pull_interval_secs)?;
        config.drain_interval_secs = env_parse("DRAIN_INTERVAL_SECS", config.drain_interval_secs)?;
        config.kdf_iterations = env_parse("KDF_ITERATIONS", config.kdf_iterations)?;
        config.retry.initial_backoff_ms = env_parse("RETRY_INITIAL_MS", config.retry.initial_backoff_ms)?;
        config.retry.multiplier = env_parse("RETRY_MULTIPLIER", config.retry.multiplier)?;
        config.retry.max_backoff_ms = env_parse("RETRY_MAX_MS", config.retry.max_backoff_ms)?;
        config.retry.max_retries = env_parse("RETRY_MAX_ATTEMPTS", config.retry.max_retries)?;
        config.network.debounce_ms = env_parse("NETWORK_DEBOUNCE_MS", config.network.debounce_ms)?;

        if let Some(strategy) = env_var("CONFLICT_STRATEGY") {
            config.conflict_strategy = match strategy.as_str() {
                "manual" => ConflictStrategy::Manual,
                "last_writer_wins" => ConflictStrategy::LastWriterWins,
                other => {
                    return Err(ConfigError::InvalidValue(format!(
                        "{}CONFLICT_STRATEGY must be manual or last_writer_wins, got {}",
                        ENV_PREFIX, other
                    )))
                }
            };
        }

        config.validate()?;
        log::info!("Engine config loaded (server: {}, db: {:?})", config.server_url, config.database_path);
        Ok(config)
    }

    /// Reject values the engine cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server_url.is_empty() {
            return Err(ConfigError::InvalidValue("server_url cannot be empty".to_string()));
        }
        if url::Url::parse(&self.server_url).is_err() {
            return Err(ConfigError::InvalidValue(format!("server_url is not a URL: {}", self.server_url)));
        }
        if self.request_timeout_secs == 0 {
            return Err(ConfigError::InvalidValue("request_timeout_secs must be positive".to_string()));
        }
        if self.pull_page_size == 0 || self.pull_page_size > 1_000 {
            return Err(ConfigError::InvalidValue(format!(
                "pull_page_size must be 1-1000, got {}",
                self.pull_page_size
            )));
        }
        if self.pull_interval_secs < 60 || self.pull_interval_secs > 86_400 {
            return Err(ConfigError::InvalidValue(format!(
                "pull_interval_secs must be 60-86400, got {}",
                self.pull_interval_secs
            )));
        }
        if self.drain_interval_secs == 0 {
            return Err(ConfigError::InvalidValue("drain_interval_secs must be positive".to_string()));
        }
        if self.kdf_iterations == 0 {
            return Err(ConfigError::InvalidValue("kdf_iterations must be positive".to_string()));
        }
        if self.retry.multiplier < 1.0 {
            return Err(ConfigError::InvalidValue(format!(
                "retry multiplier must be >= 1.0, got {}",
                self.retry.multiplier
            )));
        }
        if self.retry.jitter_ratio <= 0.0 || self.retry.jitter_ratio > 0.3 {
            return Err(ConfigError::InvalidValue(format!(
                "jitter_ratio must be in (0, 0.3], got {}",
                self.retry.jitter_ratio
            )));
        }
        if self.retry.initial_backoff_ms == 0 || self.retry.initial_backoff_ms > self.retry.max_backoff_ms {
            return Err(ConfigError::InvalidValue(
                "initial_backoff_ms must be positive and <= max_backoff_ms".to_string(),
            ));
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn pull_interval(&self) -> Duration {
        Duration::from_secs(self.pull_interval_secs)
    }

    pub fn drain_interval(&self) -> Duration {
        Duration::from_secs(self.drain_interval_secs)
    }
}

/// `<data dir>/medsync.db`, or the working directory if no home is known
fn default_database_path() -> PathBuf {
    directories::ProjectDirs::from("org", "medsync", "medsync")
        .map(|dirs| dirs.data_dir().join("medsync.db"))
        .unwrap_or_else(|| PathBuf::from("medsync.db"))
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(format!("{}{}", ENV_PREFIX, name))
        .ok()
        .filter(|v| !v.is_empty())
}

fn env_parse<T: FromStr>(name: &str, default: T) -> Result<T, ConfigError> {
    match env_var(name) {
        Some(raw) => raw
            .parse::<T>()
            .map_err(|_| ConfigError::InvalidEnv(format!("{}{}", ENV_PREFIX, name), raw)),
        None => Ok(default),
    }
}

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    InvalidValue(String),

    #[error("Cannot parse {0}={1}")]
    InvalidEnv(String, String),
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.conflict_strategy, ConflictStrategy::Manual);
        assert_eq!(config.network.debounce_ms, 1_000);
        assert!(config.database_path.ends_with("medsync.db"));
    }

    #[test]
    fn test_invalid_multiplier_rejected() {
        let mut config = EngineConfig::default();
        config.retry.multiplier = 0.5;
        assert!(matches!(config.validate(), Err(ConfigError::InvalidValue(_))));
    }

    #[test]
    fn test_invalid_jitter_rejected() {
        let mut config = EngineConfig::default();
        config.retry.jitter_ratio = 0.5;
        assert!(config.validate().is_err());

        config.retry.jitter_ratio = 0.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_pull_interval_bounds() {
        let mut config = EngineConfig::default();
        config.pull_interval_secs = 10;
        assert!(config.validate().is_err());

        config.pull_interval_secs = 100_000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_bad_server_url_rejected() {
        let mut config = EngineConfig::default();
        config.server_url = "not a url".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_serialization() {
        let config = EngineConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let back: EngineConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);
    }
}
