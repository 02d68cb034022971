//! TaskScheduler port: the time-based execution facility.
//!
//! Retry redelivery and deadline firing never run on the caller's thread.
//! They are handed to a [`TaskScheduler`], which runs each task once its
//! delay has elapsed. Implementations decide *how* (tokio timers, a virtual
//! clock in tests, ...); callers only rely on two guarantees:
//!
//! - a scheduled task runs no earlier than its delay,
//! - a task cancelled through its [`TaskHandle`] before it started never runs.

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use std::fmt::Debug;
use std::time::Duration;
use thiserror::Error;

/// Unit of work handed to a scheduler.
pub type ScheduledTask = BoxFuture<'static, ()>;

/// Errors from scheduling operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchedulerError {
    #[error("Task rejected by scheduler: {0}")]
    Rejected(String),

    #[error("Scheduler has been shut down")]
    Shutdown,
}

/// Handle to a scheduled task.
pub trait TaskHandle: Send + Sync + Debug {
    /// Prevent the task from running.
    ///
    /// Returns `true` if the task had not started yet.
    fn cancel(&self) -> bool;
}

/// Time-based task runner.
pub trait TaskScheduler: Send + Sync + Debug {
    /// Current time as seen by this scheduler.
    fn now(&self) -> DateTime<Utc>;

    /// Run `task` once `delay` has elapsed.
    fn schedule(
        &self,
        delay: Duration,
        task: ScheduledTask,
    ) -> Result<Box<dyn TaskHandle>, SchedulerError>;
}

/// `instant + delay`, clamped to the largest representable instant.
pub fn saturating_add(instant: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|delta| instant.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Time left from `now` until `instant`; zero when `instant` is in the past.
pub fn delay_until(now: DateTime<Utc>, instant: DateTime<Utc>) -> Duration {
    (instant - now).to_std().unwrap_or(Duration::ZERO)
}
