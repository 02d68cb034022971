//! # Tokio TaskScheduler Implementation
//!
//! This module provides [`TokioTaskScheduler`], which runs scheduled work as
//! tokio tasks after a `tokio::time::sleep`.
//!
//! The scheduler's clock is anchored to tokio's clock, so tests running with
//! a paused runtime (`#[tokio::test(start_paused = true)]`) see scheduled
//! instants and [`TaskScheduler::now`] advance together.

use chrono::{DateTime, Utc};
use saga_engine_core::port::task_scheduler::{
    ScheduledTask, SchedulerError, TaskHandle, TaskScheduler, saturating_add,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::debug;

/// Tokio-based [`TaskScheduler`].
///
/// # Examples
///
/// ```ignore
/// use saga_engine_local::task_scheduler::TokioTaskScheduler;
///
/// #[tokio::main]
/// async fn main() {
///     let scheduler = TokioTaskScheduler::new();
/// }
/// ```
#[derive(Debug, Clone)]
pub struct TokioTaskScheduler {
    state: Arc<TokioTaskSchedulerState>,
}

#[derive(Debug)]
struct TokioTaskSchedulerState {
    runtime: Option<Handle>,
    origin: Instant,
    origin_utc: DateTime<Utc>,
    in_flight: AtomicUsize,
    terminated: AtomicBool,
}

impl TokioTaskScheduler {
    /// Scheduler bound to the current runtime, if any.
    ///
    /// Without a runtime every `schedule` call is rejected.
    pub fn new() -> Self {
        Self::build(Handle::try_current().ok())
    }

    /// Scheduler spawning onto the given runtime.
    pub fn with_handle(handle: Handle) -> Self {
        Self::build(Some(handle))
    }

    fn build(runtime: Option<Handle>) -> Self {
        Self {
            state: Arc::new(TokioTaskSchedulerState {
                runtime,
                origin: Instant::now(),
                origin_utc: Utc::now(),
                in_flight: AtomicUsize::new(0),
                terminated: AtomicBool::new(false),
            }),
        }
    }

    /// Number of scheduled tasks that have not finished or been cancelled.
    pub fn in_flight(&self) -> usize {
        self.state.in_flight.load(Ordering::SeqCst)
    }

    /// Reject all further tasks. Already scheduled tasks still run.
    pub fn shutdown(&self) {
        self.state.terminated.store(true, Ordering::SeqCst);
        debug!("Task scheduler shut down");
    }

    pub fn is_shutdown(&self) -> bool {
        self.state.terminated.load(Ordering::SeqCst)
    }
}

impl Default for TokioTaskScheduler {
    fn default() -> Self {
        Self::new()
    }
}

/// Decrements the in-flight counter exactly once, whether the task ran to
/// completion or was aborted.
struct InFlightGuard(Arc<TokioTaskSchedulerState>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Debug)]
struct TokioTaskHandle {
    abort: AbortHandle,
    started: Arc<AtomicBool>,
}

impl TaskHandle for TokioTaskHandle {
    fn cancel(&self) -> bool {
        if self.started.load(Ordering::SeqCst) || self.abort.is_finished() {
            return false;
        }
        self.abort.abort();
        true
    }
}

impl TaskScheduler for TokioTaskScheduler {
    fn now(&self) -> DateTime<Utc> {
        saturating_add(self.state.origin_utc, self.state.origin.elapsed())
    }

    fn schedule(
        &self,
        delay: Duration,
        task: ScheduledTask,
    ) -> Result<Box<dyn TaskHandle>, SchedulerError> {
        if self.is_shutdown() {
            return Err(SchedulerError::Shutdown);
        }
        let runtime = self
            .state
            .runtime
            .clone()
            .or_else(|| Handle::try_current().ok())
            .ok_or_else(|| SchedulerError::Rejected("no tokio runtime available".to_string()))?;

        let started = Arc::new(AtomicBool::new(false));
        let started_flag = Arc::clone(&started);
        self.state.in_flight.fetch_add(1, Ordering::SeqCst);
        let guard = InFlightGuard(Arc::clone(&self.state));

        let join = runtime.spawn(async move {
            let _guard = guard;
            tokio::time::sleep(delay).await;
            started_flag.store(true, Ordering::SeqCst);
            task.await;
        });

        Ok(Box::new(TokioTaskHandle {
            abort: join.abort_handle(),
            started,
        }))
    }
}
