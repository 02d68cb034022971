//! # Saga Engine Configuration
//!
//! Configuration types for the retry scheduler and the deadline manager.
//! All types deserialize with defaults for missing fields, so partial
//! configuration files are accepted.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Delay growth between consecutive retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Constant delay of one retry interval.
    #[default]
    Interval,
    /// Doubling delay, capped by `max_interval_ms`.
    Exponential,
}

impl std::str::FromStr for BackoffStrategy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "interval" | "fixed" => Ok(BackoffStrategy::Interval),
            "exponential" => Ok(BackoffStrategy::Exponential),
            other => Err(ConfigError::invalid("backoff", other)),
        }
    }
}

/// Configuration for the retry scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Base delay between retries, in milliseconds.
    pub retry_interval_ms: u64,
    /// Maximum number of retries per dispatch attempt.
    pub max_retry_count: u32,
    pub backoff: BackoffStrategy,
    /// Upper bound for exponential backoff, in milliseconds.
    pub max_interval_ms: Option<u64>,
    /// Failure kinds that are considered transient.
    pub retryable_kinds: Vec<String>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            retry_interval_ms: 1000,
            max_retry_count: 3,
            backoff: BackoffStrategy::Interval,
            max_interval_ms: None,
            retryable_kinds: Vec::new(),
        }
    }
}

impl RetryConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval_ms = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn with_max_retry_count(mut self, count: u32) -> Self {
        self.max_retry_count = count;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffStrategy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_max_interval(mut self, interval: Duration) -> Self {
        self.max_interval_ms = Some(u64::try_from(interval.as_millis()).unwrap_or(u64::MAX));
        self
    }

    /// Add a transient failure kind.
    pub fn with_retryable_kind(mut self, kind: impl Into<String>) -> Self {
        self.retryable_kinds.push(kind.into());
        self
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    pub fn max_interval(&self) -> Option<Duration> {
        self.max_interval_ms.map(Duration::from_millis)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.retry_interval_ms == 0 {
            return Err(ConfigError::invalid("retry_interval_ms", 0));
        }
        if let Some(max) = self.max_interval_ms {
            if max < self.retry_interval_ms {
                return Err(ConfigError::Validation(format!(
                    "max_interval_ms ({}) must not be lower than retry_interval_ms ({})",
                    max, self.retry_interval_ms
                )));
            }
        }
        Ok(())
    }
}

/// Configuration for the deadline manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeadlineConfig {
    /// Buffered outcomes per subscriber before the slowest one lags.
    pub outcome_channel_capacity: usize,
}

impl Default for DeadlineConfig {
    fn default() -> Self {
        Self {
            outcome_channel_capacity: 256,
        }
    }
}

impl DeadlineConfig {
    pub fn with_outcome_channel_capacity(mut self, capacity: usize) -> Self {
        self.outcome_channel_capacity = capacity;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.outcome_channel_capacity == 0 {
            return Err(ConfigError::invalid("outcome_channel_capacity", 0));
        }
        Ok(())
    }
}

/// Configuration for the saga engine.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SagaEngineConfig {
    pub retry: RetryConfig,
    pub deadlines: DeadlineConfig,
}

impl SagaEngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_deadlines(mut self, deadlines: DeadlineConfig) -> Self {
        self.deadlines = deadlines;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.retry.validate()?;
        self.deadlines.validate()
    }
}
