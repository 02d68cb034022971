//! Retry scheduling on the tokio scheduler, with tokio's clock paused so
//! redelivery delays are deterministic.

use async_trait::async_trait;
use saga_engine_core::error::classification::{FailureRecord, RetryableKinds};
use saga_engine_core::event::Payload;
use saga_engine_core::port::command_bus::{CommandDispatcher, CommandMessage, DispatchError};
use saga_engine_core::port::task_scheduler::TaskScheduler;
use saga_engine_core::retry::{
    Backoff, CommandGatewayError, DelayedRetryScheduler, RetryScheduler, RetryingCommandGateway,
};
use saga_engine_local::TokioTaskScheduler;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::oneshot;

const RETRY_INTERVAL: Duration = Duration::from_millis(100);
const MAX_RETRIES: u32 = 5;

#[derive(Debug, Default)]
struct CountingDispatcher {
    calls: AtomicUsize,
}

#[async_trait]
impl CommandDispatcher for CountingDispatcher {
    async fn dispatch(&self, command: CommandMessage) -> Result<Payload, DispatchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(command.payload)
    }
}

/// Fails with a transient JDBC error until `failures` calls have been made.
#[derive(Debug)]
struct FlakyDispatcher {
    failures: usize,
    calls: AtomicUsize,
}

#[async_trait]
impl CommandDispatcher for FlakyDispatcher {
    async fn dispatch(&self, _command: CommandMessage) -> Result<Payload, DispatchError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call <= self.failures {
            return Err(jdbc_failure());
        }
        Ok(Payload::new(format!("stored after {call} calls")))
    }
}

fn jdbc_failure() -> DispatchError {
    DispatchError::new("JdbcException", "Exception")
        .caused_by(DispatchError::new("NullPointerException", "null"))
}

fn retry_scheduler(
    scheduler: &TokioTaskScheduler,
    dispatcher: Arc<dyn CommandDispatcher>,
) -> DelayedRetryScheduler {
    DelayedRetryScheduler::builder()
        .retry_executor(Arc::new(scheduler.clone()))
        .dispatcher(dispatcher)
        .retry_interval(RETRY_INTERVAL)
        .max_retry_count(MAX_RETRIES)
        .retryable_kinds(RetryableKinds::new(["JdbcException"]))
        .build()
        .unwrap()
}

/// Schedule a retry after `failures` transient failures and return the
/// delay until redelivery, or `None` if no retry was scheduled.
async fn schedule_after_failures(
    scheduler: &TokioTaskScheduler,
    retry: &DelayedRetryScheduler,
    failures: usize,
) -> Option<Duration> {
    let failure = jdbc_failure().failure_record();
    let history: Vec<FailureRecord> = (0..failures).map(|_| failure.clone()).collect();
    let (sink, outcome) = oneshot::channel();
    let before = scheduler.now();

    let scheduled = retry
        .schedule_retry(
            CommandMessage::new("Hello world".to_string()),
            &failure,
            &history,
            sink,
        )
        .unwrap();
    if !scheduled {
        assert!(outcome.await.is_err(), "sink must not be signalled");
        return None;
    }

    let outcome = outcome.await.unwrap();
    assert!(outcome.result.is_ok());
    Some((outcome.redelivered_at - before).to_std().unwrap())
}

#[tokio::test(start_paused = true)]
async fn test_retries_wait_the_interval_until_max_retries() {
    let scheduler = TokioTaskScheduler::new();
    let dispatcher = Arc::new(CountingDispatcher::default());
    let retry = retry_scheduler(&scheduler, dispatcher.clone());

    for failures in 1..=MAX_RETRIES as usize {
        let delay = schedule_after_failures(&scheduler, &retry, failures)
            .await
            .expect("retry should be scheduled");
        assert!(
            delay >= RETRY_INTERVAL,
            "delay {delay:?} after {failures} failure(s)"
        );
    }

    let past_max = schedule_after_failures(&scheduler, &retry, MAX_RETRIES as usize + 1).await;
    assert_eq!(past_max, None);
    assert_eq!(dispatcher.calls.load(Ordering::SeqCst), MAX_RETRIES as usize);
}

#[tokio::test(start_paused = true)]
async fn test_exponential_backoff_delays() {
    let scheduler = TokioTaskScheduler::new();
    let dispatcher = Arc::new(CountingDispatcher::default());
    let retry = DelayedRetryScheduler::builder()
        .retry_executor(Arc::new(scheduler.clone()))
        .dispatcher(dispatcher)
        .retry_interval(RETRY_INTERVAL)
        .max_retry_count(MAX_RETRIES)
        .retryable_kinds(RetryableKinds::new(["NullPointerException"]))
        .backoff(Backoff::Exponential {
            max_interval: Some(Duration::from_millis(300)),
        })
        .build()
        .unwrap();

    let mut delays = Vec::new();
    for failures in 1..=4 {
        delays.push(schedule_after_failures(&scheduler, &retry, failures).await.unwrap());
    }
    // Timer granularity may add up to a millisecond.
    let expected = [100, 200, 300, 300].map(Duration::from_millis);
    for (delay, expected) in delays.iter().zip(expected) {
        assert!(
            *delay >= expected && *delay < expected + Duration::from_millis(5),
            "delay {delay:?}, expected {expected:?}"
        );
    }
}

#[tokio::test(start_paused = true)]
async fn test_gateway_retries_until_success() {
    let scheduler = TokioTaskScheduler::new();
    let dispatcher = Arc::new(FlakyDispatcher {
        failures: 3,
        calls: AtomicUsize::new(0),
    });
    let retry = Arc::new(retry_scheduler(&scheduler, dispatcher.clone()));
    let gateway = RetryingCommandGateway::new(dispatcher.clone()).with_retry_scheduler(retry);
    let start = scheduler.now();

    let reply = gateway
        .send(CommandMessage::new("Hello world".to_string()))
        .await
        .unwrap();

    assert_eq!(
        reply.downcast_ref::<String>().map(String::as_str),
        Some("stored after 4 calls")
    );
    assert_eq!(dispatcher.calls.load(Ordering::SeqCst), 4);
    let elapsed = (scheduler.now() - start).to_std().unwrap();
    assert!(elapsed >= RETRY_INTERVAL * 3);
}

#[tokio::test(start_paused = true)]
async fn test_gateway_gives_up_after_max_retries() {
    let scheduler = TokioTaskScheduler::new();
    let dispatcher = Arc::new(FlakyDispatcher {
        failures: usize::MAX,
        calls: AtomicUsize::new(0),
    });
    let retry = Arc::new(retry_scheduler(&scheduler, dispatcher.clone()));
    let gateway = RetryingCommandGateway::new(dispatcher.clone()).with_retry_scheduler(retry);

    let error = gateway
        .send(CommandMessage::new("Hello world".to_string()))
        .await
        .unwrap_err();

    match error {
        CommandGatewayError::Failed {
            attempts, source, ..
        } => {
            assert_eq!(attempts, MAX_RETRIES as usize + 1);
            assert_eq!(source.kind().as_str(), "JdbcException");
        }
        other => panic!("unexpected error {other:?}"),
    }
    assert_eq!(
        dispatcher.calls.load(Ordering::SeqCst),
        MAX_RETRIES as usize + 1
    );
}
