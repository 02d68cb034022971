//! # VirtualTimeScheduler
//!
//! A [`TaskScheduler`] whose clock only moves when a test says so. Scheduled
//! tasks are queued by due time and run inline, in due order, while the clock
//! is advanced past them. Tasks due at the same instant run in scheduling
//! order.
//!
//! ```rust,ignore
//! use saga_engine_testing::VirtualTimeScheduler;
//!
//! let clock = VirtualTimeScheduler::new();
//! let deadlines = DeadlineManager::new(Arc::new(clock.clone()));
//! // ... schedule a 10 minute deadline ...
//! clock.advance(Duration::from_secs(600)).await;
//! ```

use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use saga_engine_core::port::task_scheduler::{
    ScheduledTask, SchedulerError, TaskHandle, TaskScheduler, saturating_add,
};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::trace;

type TaskKey = (DateTime<Utc>, u64);

#[derive(Default)]
struct VirtualClock {
    now: Mutex<DateTime<Utc>>,
    queue: Mutex<BTreeMap<TaskKey, ScheduledTask>>,
    sequence: AtomicU64,
    executed: AtomicUsize,
    rejecting: AtomicBool,
}

/// Deterministic scheduler driven by the test.
#[derive(Clone)]
pub struct VirtualTimeScheduler {
    clock: Arc<VirtualClock>,
}

impl fmt::Debug for VirtualTimeScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VirtualTimeScheduler")
            .field("now", &self.current_time())
            .field("pending", &self.pending_tasks())
            .field("executed", &self.executed_tasks())
            .finish()
    }
}

impl Default for VirtualTimeScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl VirtualTimeScheduler {
    /// Starts at a fixed instant (2024-01-01T00:00:00Z) so timestamps in
    /// assertions are reproducible.
    pub fn new() -> Self {
        let epoch = Utc
            .with_ymd_and_hms(2024, 1, 1, 0, 0, 0)
            .single()
            .unwrap_or_else(Utc::now);
        Self::starting_at(epoch)
    }

    pub fn starting_at(start: DateTime<Utc>) -> Self {
        let clock = VirtualClock {
            now: Mutex::new(start),
            ..VirtualClock::default()
        };
        Self {
            clock: Arc::new(clock),
        }
    }

    pub fn current_time(&self) -> DateTime<Utc> {
        *self.clock.now.lock()
    }

    /// Tasks scheduled but neither run nor cancelled.
    pub fn pending_tasks(&self) -> usize {
        self.clock.queue.lock().len()
    }

    /// Tasks run so far.
    pub fn executed_tasks(&self) -> usize {
        self.clock.executed.load(Ordering::SeqCst)
    }

    /// Due time of the earliest pending task.
    pub fn next_due(&self) -> Option<DateTime<Utc>> {
        self.clock.queue.lock().keys().next().map(|(due, _)| *due)
    }

    /// Refuse (`true`) or accept (`false`) new tasks.
    pub fn set_rejecting(&self, rejecting: bool) {
        self.clock.rejecting.store(rejecting, Ordering::SeqCst);
    }

    /// Move the clock forward by `by`, running every task that becomes due.
    ///
    /// Returns the number of tasks run. Tasks scheduled by running tasks are
    /// run too if they fall due before the target instant.
    pub async fn advance(&self, by: Duration) -> usize {
        let target = saturating_add(self.current_time(), by);
        self.advance_to(target).await
    }

    /// Move the clock to `target`. The clock never moves backwards.
    pub async fn advance_to(&self, target: DateTime<Utc>) -> usize {
        let mut ran = 0;
        while let Some((due, task)) = self.pop_due(target) {
            self.move_clock(due);
            trace!(due = %due, "Running virtual task");
            task.await;
            self.clock.executed.fetch_add(1, Ordering::SeqCst);
            ran += 1;
        }
        self.move_clock(target);
        ran
    }

    /// Run tasks due at the current instant without moving the clock.
    pub async fn run_due(&self) -> usize {
        self.advance_to(self.current_time()).await
    }

    /// Advance to each pending task in turn until the queue is empty.
    pub async fn run_until_idle(&self) -> usize {
        let mut ran = 0;
        while let Some(due) = self.next_due() {
            ran += self.advance_to(due).await;
        }
        ran
    }

    fn pop_due(&self, target: DateTime<Utc>) -> Option<(DateTime<Utc>, ScheduledTask)> {
        let mut queue = self.clock.queue.lock();
        let (&(due, _), _) = queue.first_key_value()?;
        if due > target {
            return None;
        }
        queue.pop_first().map(|((due, _), task)| (due, task))
    }

    fn move_clock(&self, to: DateTime<Utc>) {
        let mut now = self.clock.now.lock();
        if to > *now {
            *now = to;
        }
    }
}

struct VirtualTaskHandle {
    clock: Weak<VirtualClock>,
    key: TaskKey,
}

impl fmt::Debug for VirtualTaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VirtualTaskHandle")
            .field("due", &self.key.0)
            .finish()
    }
}

impl TaskHandle for VirtualTaskHandle {
    fn cancel(&self) -> bool {
        self.clock
            .upgrade()
            .is_some_and(|clock| clock.queue.lock().remove(&self.key).is_some())
    }
}

impl TaskScheduler for VirtualTimeScheduler {
    fn now(&self) -> DateTime<Utc> {
        self.current_time()
    }

    fn schedule(
        &self,
        delay: Duration,
        task: ScheduledTask,
    ) -> Result<Box<dyn TaskHandle>, SchedulerError> {
        if self.clock.rejecting.load(Ordering::SeqCst) {
            return Err(SchedulerError::Rejected(
                "virtual scheduler is rejecting tasks".to_string(),
            ));
        }
        let due = saturating_add(self.current_time(), delay);
        let key = (due, self.clock.sequence.fetch_add(1, Ordering::SeqCst));
        self.clock.queue.lock().insert(key, task);
        Ok(Box::new(VirtualTaskHandle {
            clock: Arc::downgrade(&self.clock),
            key,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recording_task(log: &Arc<Mutex<Vec<&'static str>>>, label: &'static str) -> ScheduledTask {
        let log = Arc::clone(log);
        Box::pin(async move {
            log.lock().push(label);
        })
    }

    #[tokio::test]
    async fn test_tasks_run_in_due_order() {
        let scheduler = VirtualTimeScheduler::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        scheduler
            .schedule(Duration::from_secs(30), recording_task(&log, "late"))
            .unwrap();
        scheduler
            .schedule(Duration::from_secs(10), recording_task(&log, "early"))
            .unwrap();
        scheduler
            .schedule(Duration::from_secs(10), recording_task(&log, "early-second"))
            .unwrap();

        assert_eq!(scheduler.advance(Duration::from_secs(15)).await, 2);
        assert_eq!(*log.lock(), vec!["early", "early-second"]);
        assert_eq!(scheduler.pending_tasks(), 1);

        assert_eq!(scheduler.run_until_idle().await, 1);
        assert_eq!(*log.lock(), vec!["early", "early-second", "late"]);
        assert_eq!(scheduler.executed_tasks(), 3);
    }

    #[tokio::test]
    async fn test_clock_moves_to_target() {
        let scheduler = VirtualTimeScheduler::new();
        let start = scheduler.current_time();

        scheduler.advance(Duration::from_secs(90)).await;
        assert_eq!(scheduler.now() - start, chrono::Duration::seconds(90));

        // Never backwards
        scheduler.advance_to(start).await;
        assert_eq!(scheduler.now() - start, chrono::Duration::seconds(90));
    }

    #[tokio::test]
    async fn test_cancelled_task_never_runs() {
        let scheduler = VirtualTimeScheduler::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        let handle = scheduler
            .schedule(Duration::from_secs(1), recording_task(&log, "cancelled"))
            .unwrap();
        assert_eq!(scheduler.next_due(), Some(scheduler.now() + chrono::Duration::seconds(1)));
        assert!(handle.cancel());
        assert!(!handle.cancel());

        scheduler.advance(Duration::from_secs(5)).await;
        assert!(log.lock().is_empty());
        assert_eq!(scheduler.next_due(), None);
    }

    #[tokio::test]
    async fn test_rejecting_scheduler() {
        let scheduler = VirtualTimeScheduler::new();
        scheduler.set_rejecting(true);
        let result = scheduler.schedule(Duration::ZERO, Box::pin(async {}));
        assert!(matches!(result, Err(SchedulerError::Rejected(_))));

        scheduler.set_rejecting(false);
        assert!(scheduler.schedule(Duration::ZERO, Box::pin(async {})).is_ok());
        assert_eq!(scheduler.run_due().await, 1);
    }
}
