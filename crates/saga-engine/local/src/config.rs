//! Configuration loader
//!
//! Builds a [`SagaEngineConfig`] from an optional `.env` file and `SAGA_*`
//! environment variables. Unset variables keep their defaults.
//!
//! | Variable | Field |
//! |---|---|
//! | `SAGA_RETRY_INTERVAL_MS` | `retry.retry_interval_ms` |
//! | `SAGA_RETRY_MAX_RETRIES` | `retry.max_retry_count` |
//! | `SAGA_RETRY_BACKOFF` | `retry.backoff` (`interval` or `exponential`) |
//! | `SAGA_RETRY_MAX_INTERVAL_MS` | `retry.max_interval_ms` |
//! | `SAGA_RETRY_RETRYABLE_KINDS` | `retry.retryable_kinds` (comma separated) |
//! | `SAGA_DEADLINE_OUTCOME_CAPACITY` | `deadlines.outcome_channel_capacity` |
//! | `SAGA_LOG_LEVEL` | telemetry log level |

use saga_engine_core::config::{BackoffStrategy, SagaEngineConfig};
use saga_engine_core::error::ConfigError;
use saga_engine_core::telemetry::TelemetryConfig;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

pub const RETRY_INTERVAL_MS: &str = "SAGA_RETRY_INTERVAL_MS";
pub const RETRY_MAX_RETRIES: &str = "SAGA_RETRY_MAX_RETRIES";
pub const RETRY_BACKOFF: &str = "SAGA_RETRY_BACKOFF";
pub const RETRY_MAX_INTERVAL_MS: &str = "SAGA_RETRY_MAX_INTERVAL_MS";
pub const RETRY_RETRYABLE_KINDS: &str = "SAGA_RETRY_RETRYABLE_KINDS";
pub const DEADLINE_OUTCOME_CAPACITY: &str = "SAGA_DEADLINE_OUTCOME_CAPACITY";
pub const LOG_LEVEL: &str = "SAGA_LOG_LEVEL";

/// Errors from configuration loading.
#[derive(Debug, Error)]
pub enum ConfigLoadError {
    #[error("Failed to load env file {path}: {source}")]
    EnvFileLoad {
        path: PathBuf,
        #[source]
        source: dotenv::Error,
    },

    #[error(transparent)]
    Invalid(#[from] ConfigError),
}

/// Configuration of a local runtime.
#[derive(Debug, Clone, Default)]
pub struct LocalRuntimeConfig {
    pub engine: SagaEngineConfig,
    pub telemetry: TelemetryConfig,
}

/// Loads configuration from a `.env` file and the environment.
///
/// # Example
///
/// ```ignore
/// use saga_engine_local::config::ConfigLoader;
///
/// let config = ConfigLoader::new(Some(".env".into())).load()?;
/// ```
#[derive(Debug, Clone, Default)]
pub struct ConfigLoader {
    env_file_path: Option<PathBuf>,
}

impl ConfigLoader {
    /// * `env_file_path` - Optional path to a `.env` file, loaded before
    ///   reading environment variables. A missing file is an error.
    pub fn new(env_file_path: Option<PathBuf>) -> Self {
        Self { env_file_path }
    }

    /// Load from the process environment.
    pub fn load(&self) -> Result<LocalRuntimeConfig, ConfigLoadError> {
        if let Some(path) = &self.env_file_path {
            load_env_file(path)?;
        }
        Ok(Self::from_lookup(|key| std::env::var(key).ok())?)
    }

    /// Build configuration from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<LocalRuntimeConfig, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = LocalRuntimeConfig::default();
        let retry = &mut config.engine.retry;

        if let Some(value) = parse(&lookup, RETRY_INTERVAL_MS)? {
            retry.retry_interval_ms = value;
        }
        if let Some(value) = parse(&lookup, RETRY_MAX_RETRIES)? {
            retry.max_retry_count = value;
        }
        if let Some(value) = parse::<BackoffStrategy, _>(&lookup, RETRY_BACKOFF)? {
            retry.backoff = value;
        }
        if let Some(value) = parse(&lookup, RETRY_MAX_INTERVAL_MS)? {
            retry.max_interval_ms = Some(value);
        }
        if let Some(kinds) = lookup(RETRY_RETRYABLE_KINDS) {
            retry.retryable_kinds = kinds
                .split(',')
                .map(str::trim)
                .filter(|kind| !kind.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Some(value) = parse(&lookup, DEADLINE_OUTCOME_CAPACITY)? {
            config.engine.deadlines.outcome_channel_capacity = value;
        }
        if let Some(level) = lookup(LOG_LEVEL) {
            config.telemetry.log_level = level;
        }

        config.engine.validate()?;
        Ok(config)
    }
}

fn load_env_file(path: &Path) -> Result<(), ConfigLoadError> {
    if !path.exists() {
        return Err(ConfigLoadError::EnvFileLoad {
            path: path.to_path_buf(),
            source: dotenv::Error::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("File not found: {}", path.display()),
            )),
        });
    }
    dotenv::from_path(path).map_err(|e| ConfigLoadError::EnvFileLoad {
        path: path.to_path_buf(),
        source: e,
    })
}

fn parse<T, F>(lookup: &F, key: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .map(|raw| {
            raw.trim()
                .parse::<T>()
                .map_err(|_| ConfigError::invalid(key, raw.trim()))
        })
        .transpose()
}
