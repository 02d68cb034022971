//! # Retry Scheduler
//!
//! Decides whether a failed command dispatch is retried and, if so, arranges
//! for the command to be redelivered after a delay.
//!
//! The caller owns the failure history of a dispatch attempt (see
//! [`DispatchAttempt`]); the scheduler itself keeps no per-attempt state, so
//! concurrent attempts never interfere. A call to
//! [`RetryScheduler::schedule_retry`] never blocks: redelivery runs on the
//! injected [`TaskScheduler`] and its result is signalled through a oneshot
//! completion sink.
//!
//! History counting: `history` contains every failure of the attempt so far,
//! including the one being reported. A retry is granted while
//! `history.len() <= max_retry_count`, so a policy with `max_retry_count = 5`
//! dispatches a command at most six times.

pub mod gateway;

use crate::config::{BackoffStrategy, RetryConfig};
use crate::error::ConfigError;
use crate::error::classification::{FailureClassifier, FailureRecord, RetryableKinds};
use crate::event::Payload;
use crate::port::command_bus::{CommandDispatcher, CommandMessage, DispatchError};
use crate::port::task_scheduler::{SchedulerError, TaskScheduler};
use crate::telemetry;
use chrono::{DateTime, Utc};
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{Instrument, debug, info, warn};

pub use gateway::{CommandGatewayError, RetryingCommandGateway};

/// Result of one redelivery.
#[derive(Debug)]
pub struct RedeliveryOutcome {
    /// When the command was handed to the dispatcher again.
    pub redelivered_at: DateTime<Utc>,
    pub result: Result<Payload, DispatchError>,
}

/// Signalled exactly once per scheduled retry.
pub type CompletionSink = oneshot::Sender<RedeliveryOutcome>;

/// Why a retry is or is not scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry { delay: Duration, attempt: usize },
    /// The failure is not transient.
    NonRetryable,
    /// The attempt already failed too often.
    Exhausted { failures: usize },
}

impl RetryDecision {
    pub fn is_retry(&self) -> bool {
        matches!(self, RetryDecision::Retry { .. })
    }
}

/// Errors from scheduling a retry. Distinct from "no retry".
#[derive(Debug, Error)]
pub enum SchedulingError {
    #[error("Retry of command '{command_name}' was rejected by the executor")]
    Rejected {
        command_name: String,
        #[source]
        source: SchedulerError,
    },
}

/// Retry decision and redelivery for failed command dispatches.
pub trait RetryScheduler: Send + Sync + Debug {
    /// Decide without scheduling anything.
    fn evaluate(&self, failure: &FailureRecord, history: &[FailureRecord]) -> RetryDecision;

    /// Schedule a redelivery of `command` if the policy allows it.
    ///
    /// Returns `Ok(false)` when the failure is not retryable or retries are
    /// exhausted; `sink` is then dropped without a value.
    fn schedule_retry(
        &self,
        command: CommandMessage,
        failure: &FailureRecord,
        history: &[FailureRecord],
        sink: CompletionSink,
    ) -> Result<bool, SchedulingError>;
}

/// Delay curve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Backoff {
    /// Every retry waits the base interval.
    #[default]
    Interval,
    /// Retry `n` waits `base * 2^(n-1)`, capped by `max_interval`.
    Exponential { max_interval: Option<Duration> },
}

impl Backoff {
    /// Delay before retry number `attempt` (1-based). Never below `base`.
    pub fn delay(&self, base: Duration, attempt: usize) -> Duration {
        match self {
            Backoff::Interval => base,
            Backoff::Exponential { max_interval } => {
                let exponent = attempt.saturating_sub(1).min(31) as u32;
                let delay = base.checked_mul(1u32 << exponent).unwrap_or(Duration::MAX);
                match max_interval {
                    Some(max) => delay.min((*max).max(base)),
                    None => delay,
                }
            }
        }
    }
}

/// Retry parameters, fixed for the scheduler's lifetime.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub base_interval: Duration,
    pub max_retry_count: u32,
    pub classifier: Arc<dyn FailureClassifier>,
    pub backoff: Backoff,
}

impl RetryPolicy {
    pub fn decide(&self, failure: &FailureRecord, history: &[FailureRecord]) -> RetryDecision {
        if !self.classifier.is_retryable(failure) {
            return RetryDecision::NonRetryable;
        }
        let failures = history.len();
        if failures > self.max_retry_count as usize {
            return RetryDecision::Exhausted { failures };
        }
        let attempt = failures.max(1);
        RetryDecision::Retry {
            delay: self.backoff.delay(self.base_interval, attempt),
            attempt,
        }
    }
}

/// One logical command dispatch and the failures it accumulated.
#[derive(Debug, Clone)]
pub struct DispatchAttempt {
    command: CommandMessage,
    failures: Vec<FailureRecord>,
}

impl DispatchAttempt {
    pub fn new(command: CommandMessage) -> Self {
        Self {
            command,
            failures: Vec::new(),
        }
    }

    pub fn command(&self) -> &CommandMessage {
        &self.command
    }

    pub fn record(&mut self, failure: FailureRecord) {
        self.failures.push(failure);
    }

    /// Failures so far, oldest first.
    pub fn failures(&self) -> &[FailureRecord] {
        &self.failures
    }
}

/// Retry scheduler redelivering commands after a policy-defined delay.
#[derive(Debug)]
pub struct DelayedRetryScheduler {
    executor: Arc<dyn TaskScheduler>,
    dispatcher: Arc<dyn CommandDispatcher>,
    policy: RetryPolicy,
}

impl DelayedRetryScheduler {
    pub fn builder() -> DelayedRetrySchedulerBuilder {
        DelayedRetrySchedulerBuilder::default()
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }
}

impl RetryScheduler for DelayedRetryScheduler {
    fn evaluate(&self, failure: &FailureRecord, history: &[FailureRecord]) -> RetryDecision {
        self.policy.decide(failure, history)
    }

    fn schedule_retry(
        &self,
        command: CommandMessage,
        failure: &FailureRecord,
        history: &[FailureRecord],
        sink: CompletionSink,
    ) -> Result<bool, SchedulingError> {
        let (delay, attempt) = match self.evaluate(failure, history) {
            RetryDecision::Retry { delay, attempt } => (delay, attempt),
            RetryDecision::NonRetryable => {
                info!(
                    command = %command.command_name,
                    failure = %failure,
                    "Failure is not retryable, giving up"
                );
                return Ok(false);
            }
            RetryDecision::Exhausted { failures } => {
                warn!(
                    command = %command.command_name,
                    failures,
                    max_retry_count = self.policy.max_retry_count,
                    "Retries exhausted, giving up"
                );
                return Ok(false);
            }
        };

        let command_name = command.command_name.clone();
        let span = telemetry::retry_span(&command, attempt);
        let clock = Arc::downgrade(&self.executor);
        let dispatcher = Arc::clone(&self.dispatcher);
        let task = async move {
            let redelivered_at = clock
                .upgrade()
                .map(|clock| clock.now())
                .unwrap_or_else(Utc::now);
            debug!("Redelivering command");
            let result = dispatcher.dispatch(command).await;
            if sink
                .send(RedeliveryOutcome {
                    redelivered_at,
                    result,
                })
                .is_err()
            {
                debug!("Redelivery outcome discarded, nobody is waiting");
            }
        }
        .instrument(span);

        self.executor
            .schedule(delay, Box::pin(task))
            .map_err(|source| SchedulingError::Rejected {
                command_name: command_name.clone(),
                source,
            })?;

        debug!(
            command = %command_name,
            attempt,
            delay_ms = delay.as_millis() as u64,
            "Retry scheduled"
        );
        Ok(true)
    }
}

/// Builder for [`DelayedRetryScheduler`].
#[derive(Debug, Default)]
pub struct DelayedRetrySchedulerBuilder {
    executor: Option<Arc<dyn TaskScheduler>>,
    dispatcher: Option<Arc<dyn CommandDispatcher>>,
    retry_interval: Option<Duration>,
    max_retry_count: Option<u32>,
    classifier: Option<Arc<dyn FailureClassifier>>,
    backoff: Backoff,
}

impl DelayedRetrySchedulerBuilder {
    /// Execution facility running redeliveries.
    pub fn retry_executor(mut self, executor: Arc<dyn TaskScheduler>) -> Self {
        self.executor = Some(executor);
        self
    }

    pub fn dispatcher(mut self, dispatcher: Arc<dyn CommandDispatcher>) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    pub fn retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = Some(interval);
        self
    }

    pub fn max_retry_count(mut self, count: u32) -> Self {
        self.max_retry_count = Some(count);
        self
    }

    pub fn classifier(mut self, classifier: Arc<dyn FailureClassifier>) -> Self {
        self.classifier = Some(classifier);
        self
    }

    /// Use a safelist of transient failure kinds.
    pub fn retryable_kinds(self, kinds: RetryableKinds) -> Self {
        self.classifier(Arc::new(kinds))
    }

    pub fn backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Apply interval, retry count, backoff and retryable kinds from config.
    pub fn from_config(self, config: &RetryConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let backoff = match config.backoff {
            BackoffStrategy::Interval => Backoff::Interval,
            BackoffStrategy::Exponential => Backoff::Exponential {
                max_interval: config.max_interval(),
            },
        };
        Ok(self
            .retry_interval(config.retry_interval())
            .max_retry_count(config.max_retry_count)
            .backoff(backoff)
            .retryable_kinds(RetryableKinds::new(config.retryable_kinds.iter().cloned())))
    }

    pub fn build(self) -> Result<DelayedRetryScheduler, ConfigError> {
        let executor = self
            .executor
            .ok_or_else(|| ConfigError::missing("retry_executor"))?;
        let dispatcher = self
            .dispatcher
            .ok_or_else(|| ConfigError::missing("dispatcher"))?;
        let defaults = RetryConfig::default();
        let base_interval = self
            .retry_interval
            .unwrap_or_else(|| defaults.retry_interval());
        if base_interval.is_zero() {
            return Err(ConfigError::invalid("retry_interval", "0ms"));
        }
        let classifier = match self.classifier {
            Some(classifier) => classifier,
            None => {
                warn!("No retryable failure kinds configured, failures will not be retried");
                Arc::new(RetryableKinds::default())
            }
        };

        Ok(DelayedRetryScheduler {
            executor,
            dispatcher,
            policy: RetryPolicy {
                base_interval,
                max_retry_count: self.max_retry_count.unwrap_or(defaults.max_retry_count),
                classifier,
                backoff: self.backoff,
            },
        })
    }
}
