//! Command gateway with retries.
//!
//! Drives a [`DispatchAttempt`] to completion: dispatch, record the failure,
//! ask the retry scheduler, wait for the redelivery, repeat. At most one
//! redelivery of an attempt is in flight at any time.

use super::{DispatchAttempt, RetryScheduler, SchedulingError};
use crate::event::Payload;
use crate::port::command_bus::{CommandDispatcher, CommandMessage, DispatchError};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// Errors surfaced to the sender of a command.
#[derive(Debug, Error)]
pub enum CommandGatewayError {
    /// The last dispatch failed and no further retry was granted.
    #[error("Command '{command_name}' failed after {attempts} attempt(s)")]
    Failed {
        command_name: String,
        attempts: usize,
        #[source]
        source: DispatchError,
    },

    #[error(transparent)]
    Scheduling(#[from] SchedulingError),

    /// The scheduled redelivery was dropped before it ran.
    #[error("Redelivery of command '{command_name}' was dropped")]
    RedeliveryDropped { command_name: String },
}

/// Sends commands and retries transient failures.
#[derive(Debug, Clone)]
pub struct RetryingCommandGateway {
    dispatcher: Arc<dyn CommandDispatcher>,
    retry_scheduler: Option<Arc<dyn RetryScheduler>>,
}

impl RetryingCommandGateway {
    /// Gateway without retries.
    pub fn new(dispatcher: Arc<dyn CommandDispatcher>) -> Self {
        Self {
            dispatcher,
            retry_scheduler: None,
        }
    }

    pub fn with_retry_scheduler(mut self, retry_scheduler: Arc<dyn RetryScheduler>) -> Self {
        self.retry_scheduler = Some(retry_scheduler);
        self
    }

    /// Dispatch `command`, retrying as long as the retry scheduler allows.
    pub async fn send(&self, command: CommandMessage) -> Result<Payload, CommandGatewayError> {
        let command_name = command.command_name.clone();
        let mut attempt = DispatchAttempt::new(command.clone());
        let mut result = self.dispatcher.dispatch(command).await;

        loop {
            let error = match result {
                Ok(payload) => return Ok(payload),
                Err(error) => error,
            };
            let failure = error.failure_record();
            attempt.record(failure.clone());

            let Some(retry_scheduler) = &self.retry_scheduler else {
                return Err(Self::failed(&attempt, error));
            };

            let (sink, redelivered) = oneshot::channel();
            let scheduled = retry_scheduler.schedule_retry(
                attempt.command().clone(),
                &failure,
                attempt.failures(),
                sink,
            )?;
            if !scheduled {
                warn!(
                    command = %command_name,
                    failures = attempt.failures().len(),
                    "Command failed permanently"
                );
                return Err(Self::failed(&attempt, error));
            }

            debug!(
                command = %command_name,
                failure = %failure,
                "Waiting for redelivery"
            );
            let outcome = redelivered
                .await
                .map_err(|_| CommandGatewayError::RedeliveryDropped {
                    command_name: command_name.clone(),
                })?;
            result = outcome.result;
        }
    }

    fn failed(attempt: &DispatchAttempt, source: DispatchError) -> CommandGatewayError {
        CommandGatewayError::Failed {
            command_name: attempt.command().command_name.clone(),
            attempts: attempt.failures().len(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::classification::RetryableKinds;
    use crate::port::task_scheduler::manual::ManualScheduler;
    use crate::retry::DelayedRetryScheduler;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Debug, Default)]
    struct FailingDispatcher {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl CommandDispatcher for FailingDispatcher {
        async fn dispatch(&self, _command: CommandMessage) -> Result<Payload, DispatchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(DispatchError::new("ValidationFailed", "quantity must be positive"))
        }
    }

    #[tokio::test]
    async fn test_without_retry_scheduler_fails_immediately() {
        let dispatcher = Arc::new(FailingDispatcher::default());
        let gateway = RetryingCommandGateway::new(dispatcher.clone());

        let error = gateway
            .send(CommandMessage::new("reserve".to_string()))
            .await
            .unwrap_err();
        assert!(matches!(error, CommandGatewayError::Failed { attempts: 1, .. }));
        assert_eq!(dispatcher.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_non_retryable_failure_is_not_retried() {
        let dispatcher = Arc::new(FailingDispatcher::default());
        let executor = ManualScheduler::new();
        let retry = DelayedRetryScheduler::builder()
            .retry_executor(Arc::new(executor.clone()))
            .dispatcher(dispatcher.clone())
            .retry_interval(Duration::from_millis(100))
            .max_retry_count(5)
            .retryable_kinds(RetryableKinds::new(["ConnectionReset"]))
            .build()
            .unwrap();
        let gateway = RetryingCommandGateway::new(dispatcher.clone()).with_retry_scheduler(Arc::new(retry));

        let error = gateway
            .send(CommandMessage::new("reserve".to_string()))
            .await
            .unwrap_err();
        match error {
            CommandGatewayError::Failed { source, .. } => {
                assert_eq!(source.kind().as_str(), "ValidationFailed")
            }
            other => panic!("unexpected error {:?}", other),
        }
        assert_eq!(executor.pending(), 0);
        assert_eq!(dispatcher.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_rejected_retry_surfaces_scheduling_error() {
        let dispatcher = Arc::new(FailingDispatcher::default());
        let retry = DelayedRetryScheduler::builder()
            .retry_executor(Arc::new(ManualScheduler::rejecting()))
            .dispatcher(dispatcher.clone())
            .retryable_kinds(RetryableKinds::new(["ValidationFailed"]))
            .build()
            .unwrap();
        let gateway = RetryingCommandGateway::new(dispatcher).with_retry_scheduler(Arc::new(retry));

        let error = gateway
            .send(CommandMessage::new("reserve".to_string()))
            .await
            .unwrap_err();
        assert!(matches!(error, CommandGatewayError::Scheduling(_)));
    }
}
