//! # Saga Deadline Manager
//!
//! Schedules deadlines on behalf of saga instances and fires them back into
//! the saga's deadline handlers once they are due.
//!
//! The manager exclusively owns every pending [`Deadline`]; sagas only hold
//! the [`ScheduleToken`] returned at scheduling time. Both the cancel path and
//! the fire path remove the deadline from the pending set under one lock, so
//! exactly one of them wins and a token is inert afterwards.
//!
//! ```text
//! schedule ──► pending ──(due)──► fire ──► target.deliver_deadline()
//!                 │                              │
//!                 └──(cancel)──► removed         └──► DeadlineOutcome broadcast
//! ```
//!
//! Work is executed on an injected [`TaskScheduler`]; nothing here blocks.

pub mod handler;

use crate::config::DeadlineConfig;
use crate::error::{ConfigError, StructuredError};
use crate::event::{Payload, SagaId};
use crate::port::deadline_store::{DeadlineRecord, DeadlineStore};
use crate::port::task_scheduler::{
    SchedulerError, TaskHandle, TaskScheduler, delay_until, saturating_add,
};
use crate::telemetry;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub use handler::{DeadlineHandlerFn, DeadlineHandlers, PayloadMatcher, Specificity};

/// Opaque handle identifying one scheduled deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ScheduleToken(Uuid);

impl ScheduleToken {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for ScheduleToken {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ScheduleToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Deadline lifecycle. `Fired` and `Cancelled` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeadlineStatus {
    Scheduled,
    Fired,
    Cancelled,
}

impl DeadlineStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, DeadlineStatus::Scheduled)
    }

    pub fn can_transition_to(&self, next: DeadlineStatus) -> bool {
        matches!(
            (self, next),
            (
                DeadlineStatus::Scheduled,
                DeadlineStatus::Fired | DeadlineStatus::Cancelled
            )
        )
    }
}

impl fmt::Display for DeadlineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeadlineStatus::Scheduled => write!(f, "SCHEDULED"),
            DeadlineStatus::Fired => write!(f, "FIRED"),
            DeadlineStatus::Cancelled => write!(f, "CANCELLED"),
        }
    }
}

/// A deadline owned by the manager.
#[derive(Debug, Clone)]
pub struct Deadline {
    pub token: ScheduleToken,
    pub saga_id: SagaId,
    pub saga_type: String,
    pub name: String,
    pub payload: Payload,
    pub fire_at: DateTime<Utc>,
    pub scheduled_at: DateTime<Utc>,
}

impl Deadline {
    fn to_record(&self, status: DeadlineStatus) -> DeadlineRecord {
        DeadlineRecord {
            token: self.token,
            saga_id: self.saga_id.clone(),
            saga_type: self.saga_type.clone(),
            deadline_name: self.name.clone(),
            payload_type: self.payload.type_name().to_string(),
            fire_at: self.fire_at,
            scheduled_at: self.scheduled_at,
            status,
        }
    }
}

/// What happened when a deadline fired.
#[derive(Debug, Clone, PartialEq)]
pub enum DeadlineResult {
    /// A deadline handler ran and succeeded.
    Handled,
    /// The saga instance is no longer active; the deadline was discarded.
    SagaNotFound,
    /// The saga is active but has no handler for this deadline.
    NoMatchingHandler,
    /// The handler ran and failed. The deadline stays fired.
    HandlerFailed(StructuredError),
    /// No saga manager is registered for the deadline's saga type.
    TargetUnavailable,
}

/// Published for every fired deadline.
#[derive(Debug, Clone)]
pub struct DeadlineOutcome {
    pub deadline: Deadline,
    pub result: DeadlineResult,
    pub fired_at: DateTime<Utc>,
}

/// Receiver of fired deadlines for one saga type.
pub trait DeadlineTarget: Send + Sync {
    fn saga_type(&self) -> &str;

    fn deliver_deadline(&self, deadline: &Deadline) -> DeadlineResult;
}

/// Errors from deadline scheduling.
#[derive(Debug, Error)]
pub enum DeadlineError {
    #[error("Failed to schedule deadline '{name}' for saga {saga_id}")]
    Scheduling {
        name: String,
        saga_id: SagaId,
        #[source]
        source: SchedulerError,
    },
}

struct PendingDeadline {
    deadline: Deadline,
    handle: Option<Box<dyn TaskHandle>>,
}

enum StoreCommand {
    Save(DeadlineRecord),
    UpdateStatus {
        token: ScheduleToken,
        status: DeadlineStatus,
    },
    Flush(oneshot::Sender<()>),
}

/// Schedules, cancels and fires saga deadlines.
pub struct DeadlineManager {
    scheduler: Arc<dyn TaskScheduler>,
    pending: Mutex<HashMap<ScheduleToken, PendingDeadline>>,
    targets: RwLock<HashMap<String, Weak<dyn DeadlineTarget>>>,
    outcomes: broadcast::Sender<DeadlineOutcome>,
    store: Option<mpsc::UnboundedSender<StoreCommand>>,
    self_ref: Weak<DeadlineManager>,
}

impl fmt::Debug for DeadlineManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeadlineManager")
            .field("scheduler", &self.scheduler)
            .field("pending", &self.pending.lock().len())
            .field("targets", &self.targets.read().keys().collect::<Vec<_>>())
            .field("mirrored", &self.store.is_some())
            .finish()
    }
}

impl DeadlineManager {
    /// Manager with default configuration and no store.
    pub fn new(scheduler: Arc<dyn TaskScheduler>) -> Arc<Self> {
        Self::assemble(
            scheduler,
            None,
            DeadlineConfig::default().outcome_channel_capacity,
        )
    }

    pub fn builder() -> DeadlineManagerBuilder {
        DeadlineManagerBuilder::default()
    }

    fn assemble(
        scheduler: Arc<dyn TaskScheduler>,
        store: Option<mpsc::UnboundedSender<StoreCommand>>,
        capacity: usize,
    ) -> Arc<Self> {
        let (outcomes, _) = broadcast::channel(capacity);
        Arc::new_cyclic(|self_ref| Self {
            scheduler,
            pending: Mutex::new(HashMap::new()),
            targets: RwLock::new(HashMap::new()),
            outcomes,
            store,
            self_ref: self_ref.clone(),
        })
    }

    /// Current time of the underlying scheduler.
    pub fn now(&self) -> DateTime<Utc> {
        self.scheduler.now()
    }

    /// Register the receiver for fired deadlines of `target.saga_type()`.
    ///
    /// The manager only keeps a weak reference; dropping the target makes
    /// later deadlines of that type resolve to
    /// [`DeadlineResult::TargetUnavailable`].
    pub fn register_target<T: DeadlineTarget + 'static>(&self, target: &Arc<T>) {
        let saga_type = target.saga_type().to_string();
        let weak: Weak<dyn DeadlineTarget> = Arc::downgrade(target) as Weak<dyn DeadlineTarget>;
        if self
            .targets
            .write()
            .insert(saga_type.clone(), weak)
            .is_some()
        {
            warn!(saga_type = %saga_type, "Replacing deadline target");
        }
    }

    /// Subscribe to fire outcomes.
    pub fn subscribe(&self) -> broadcast::Receiver<DeadlineOutcome> {
        self.outcomes.subscribe()
    }

    /// Schedule a deadline `delay` from now.
    pub fn schedule_deadline(
        &self,
        saga_id: &SagaId,
        saga_type: &str,
        delay: Duration,
        name: impl Into<String>,
        payload: Payload,
    ) -> Result<ScheduleToken, DeadlineError> {
        let fire_at = saturating_add(self.now(), delay);
        self.schedule_internal(saga_id, saga_type, name.into(), payload, delay, fire_at)
    }

    /// Schedule a deadline at an absolute instant. Past instants fire as soon
    /// as the scheduler gets to them.
    pub fn schedule_deadline_at(
        &self,
        saga_id: &SagaId,
        saga_type: &str,
        instant: DateTime<Utc>,
        name: impl Into<String>,
        payload: Payload,
    ) -> Result<ScheduleToken, DeadlineError> {
        let delay = delay_until(self.now(), instant);
        self.schedule_internal(saga_id, saga_type, name.into(), payload, delay, instant)
    }

    fn schedule_internal(
        &self,
        saga_id: &SagaId,
        saga_type: &str,
        name: String,
        payload: Payload,
        delay: Duration,
        fire_at: DateTime<Utc>,
    ) -> Result<ScheduleToken, DeadlineError> {
        let token = ScheduleToken::new();
        let deadline = Deadline {
            token,
            saga_id: saga_id.clone(),
            saga_type: saga_type.to_string(),
            name,
            payload,
            fire_at,
            scheduled_at: self.now(),
        };
        self.mirror(StoreCommand::Save(
            deadline.to_record(DeadlineStatus::Scheduled),
        ));

        let name = deadline.name.clone();
        self.pending.lock().insert(
            token,
            PendingDeadline {
                deadline,
                handle: None,
            },
        );

        let manager = self.self_ref.clone();
        let task = Box::pin(async move {
            if let Some(manager) = manager.upgrade() {
                manager.fire(token);
            }
        });

        match self.scheduler.schedule(delay, task) {
            Ok(handle) => {
                // The task may already have fired; then the handle is moot.
                if let Some(entry) = self.pending.lock().get_mut(&token) {
                    entry.handle = Some(handle);
                }
                debug!(
                    saga_id = %saga_id,
                    saga_type = %saga_type,
                    deadline = %name,
                    token = %token,
                    fire_at = %fire_at,
                    "Deadline scheduled"
                );
                Ok(token)
            }
            Err(source) => {
                if self.pending.lock().remove(&token).is_some() {
                    self.mirror(StoreCommand::UpdateStatus {
                        token,
                        status: DeadlineStatus::Cancelled,
                    });
                }
                warn!(
                    saga_id = %saga_id,
                    deadline = %name,
                    error = %source,
                    "Deadline rejected by scheduler"
                );
                Err(DeadlineError::Scheduling {
                    name,
                    saga_id: saga_id.clone(),
                    source,
                })
            }
        }
    }

    /// Cancel one deadline.
    ///
    /// Returns `true` if it was still pending. Unknown, fired or already
    /// cancelled tokens are a no-op.
    pub fn cancel_deadline(&self, token: &ScheduleToken) -> bool {
        let Some(entry) = self.pending.lock().remove(token) else {
            debug!(token = %token, "Cancel ignored, deadline not pending");
            return false;
        };
        self.finish_cancel(entry);
        true
    }

    /// Cancel one deadline of `saga_id`. Tokens of other sagas are left
    /// untouched and return `false`.
    pub fn cancel_deadline_for(&self, saga_id: &SagaId, token: &ScheduleToken) -> bool {
        let entry = {
            let mut pending = self.pending.lock();
            match pending.get(token).map(|entry| entry.deadline.saga_id == *saga_id) {
                Some(true) => pending.remove(token),
                Some(false) => {
                    warn!(
                        saga_id = %saga_id,
                        token = %token,
                        "Cancel ignored, deadline belongs to another saga"
                    );
                    None
                }
                None => None,
            }
        };
        let Some(entry) = entry else {
            return false;
        };
        self.finish_cancel(entry);
        true
    }

    /// Cancel every pending deadline of a saga, optionally only those with
    /// the given name. Returns how many were cancelled.
    pub fn cancel_all_deadlines(&self, saga_id: &SagaId, name: Option<&str>) -> usize {
        let removed: Vec<PendingDeadline> = {
            let mut pending = self.pending.lock();
            let tokens: Vec<ScheduleToken> = pending
                .values()
                .filter(|entry| {
                    entry.deadline.saga_id == *saga_id
                        && name.is_none_or(|name| entry.deadline.name == name)
                })
                .map(|entry| entry.deadline.token)
                .collect();
            tokens
                .iter()
                .filter_map(|token| pending.remove(token))
                .collect()
        };
        let count = removed.len();
        for entry in removed {
            self.finish_cancel(entry);
        }
        count
    }

    fn finish_cancel(&self, entry: PendingDeadline) {
        if let Some(handle) = &entry.handle {
            handle.cancel();
        }
        let deadline = entry.deadline;
        self.mirror(StoreCommand::UpdateStatus {
            token: deadline.token,
            status: DeadlineStatus::Cancelled,
        });
        debug!(
            saga_id = %deadline.saga_id,
            deadline = %deadline.name,
            token = %deadline.token,
            "Deadline cancelled"
        );
    }

    fn fire(&self, token: ScheduleToken) {
        let Some(entry) = self.pending.lock().remove(&token) else {
            debug!(token = %token, "Deadline already cancelled");
            return;
        };
        let deadline = entry.deadline;
        let _span = telemetry::deadline_span(&deadline).entered();

        self.mirror(StoreCommand::UpdateStatus {
            token,
            status: DeadlineStatus::Fired,
        });

        let target = self
            .targets
            .read()
            .get(&deadline.saga_type)
            .and_then(Weak::upgrade);
        let result = match target {
            Some(target) => target.deliver_deadline(&deadline),
            None => DeadlineResult::TargetUnavailable,
        };

        match &result {
            DeadlineResult::Handled => debug!("Deadline handled"),
            DeadlineResult::SagaNotFound => info!("Deadline discarded, saga no longer active"),
            DeadlineResult::NoMatchingHandler => warn!("No deadline handler matched"),
            DeadlineResult::HandlerFailed(failure) => {
                error!(error = %failure.message, "Deadline handler failed")
            }
            DeadlineResult::TargetUnavailable => {
                warn!("No saga manager registered for deadline")
            }
        }

        let _ = self.outcomes.send(DeadlineOutcome {
            deadline,
            result,
            fired_at: self.now(),
        });
    }

    /// Whether the token refers to a pending deadline.
    pub fn is_scheduled(&self, token: &ScheduleToken) -> bool {
        self.pending.lock().contains_key(token)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Snapshot of all pending deadlines, earliest first.
    pub fn pending_deadlines(&self) -> Vec<Deadline> {
        let mut deadlines: Vec<Deadline> = self
            .pending
            .lock()
            .values()
            .map(|entry| entry.deadline.clone())
            .collect();
        deadlines.sort_by_key(|deadline| (deadline.fire_at, deadline.scheduled_at));
        deadlines
    }

    /// Pending deadlines of one saga, earliest first.
    pub fn pending_for_saga(&self, saga_id: &SagaId) -> Vec<Deadline> {
        self.pending_deadlines()
            .into_iter()
            .filter(|deadline| deadline.saga_id == *saga_id)
            .collect()
    }

    /// Wait until every store update issued so far has been applied.
    pub async fn sync_store(&self) {
        let Some(store) = &self.store else {
            return;
        };
        let (done, applied) = oneshot::channel();
        if store.send(StoreCommand::Flush(done)).is_ok() {
            let _ = applied.await;
        }
    }

    fn mirror(&self, command: StoreCommand) {
        if let Some(store) = &self.store {
            if store.send(command).is_err() {
                warn!("Deadline store mirror has stopped");
            }
        }
    }
}

async fn run_store_mirror(
    store: Arc<dyn DeadlineStore>,
    mut commands: mpsc::UnboundedReceiver<StoreCommand>,
) {
    while let Some(command) = commands.recv().await {
        match command {
            StoreCommand::Save(record) => {
                if let Err(e) = store.save(&record).await {
                    warn!(token = %record.token, error = %e, "Failed to persist deadline");
                }
            }
            StoreCommand::UpdateStatus { token, status } => {
                if let Err(e) = store.update_status(&token, status).await {
                    warn!(token = %token, status = %status, error = %e, "Failed to update deadline status");
                }
            }
            StoreCommand::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
    debug!("Deadline store mirror stopped");
}

/// Builder for [`DeadlineManager`].
#[derive(Default)]
pub struct DeadlineManagerBuilder {
    scheduler: Option<Arc<dyn TaskScheduler>>,
    store: Option<Arc<dyn DeadlineStore>>,
    config: DeadlineConfig,
}

impl DeadlineManagerBuilder {
    pub fn scheduler(mut self, scheduler: Arc<dyn TaskScheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    /// Mirror deadline state changes to a store. Requires a tokio runtime at
    /// build time.
    pub fn store(mut self, store: Arc<dyn DeadlineStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn config(mut self, config: DeadlineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> Result<Arc<DeadlineManager>, ConfigError> {
        let scheduler = self
            .scheduler
            .ok_or_else(|| ConfigError::missing("scheduler"))?;
        self.config.validate()?;

        let store = match self.store {
            Some(store) => {
                let runtime = tokio::runtime::Handle::try_current().map_err(|_| {
                    ConfigError::Validation(
                        "deadline store mirroring requires a tokio runtime".to_string(),
                    )
                })?;
                let (sender, receiver) = mpsc::unbounded_channel();
                runtime.spawn(run_store_mirror(store, receiver));
                Some(sender)
            }
            None => None,
        };

        Ok(DeadlineManager::assemble(
            scheduler,
            store,
            self.config.outcome_channel_capacity,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::task_scheduler::manual::ManualScheduler;
    use crate::{Error, ErrorKind};

    const SAGA_TYPE: &str = "OrderSaga";

    #[derive(Debug, Clone, Copy)]
    enum Behaviour {
        Handle,
        Missing,
        Fail,
    }

    struct FixedTarget {
        behaviour: Behaviour,
        delivered: Mutex<Vec<String>>,
    }

    impl FixedTarget {
        fn new(behaviour: Behaviour) -> Arc<Self> {
            Arc::new(Self {
                behaviour,
                delivered: Mutex::new(Vec::new()),
            })
        }
    }

    impl DeadlineTarget for FixedTarget {
        fn saga_type(&self) -> &str {
            SAGA_TYPE
        }

        fn deliver_deadline(&self, deadline: &Deadline) -> DeadlineResult {
            self.delivered.lock().push(deadline.name.clone());
            match self.behaviour {
                Behaviour::Handle => DeadlineResult::Handled,
                Behaviour::Missing => DeadlineResult::SagaNotFound,
                Behaviour::Fail => DeadlineResult::HandlerFailed(
                    Error::new("boom".to_string(), ErrorKind::Handler).to_structured(),
                ),
            }
        }
    }

    fn setup(behaviour: Behaviour) -> (ManualScheduler, Arc<DeadlineManager>, Arc<FixedTarget>) {
        let scheduler = ManualScheduler::new();
        let manager = DeadlineManager::new(Arc::new(scheduler.clone()));
        let target = FixedTarget::new(behaviour);
        manager.register_target(&target);
        (scheduler, manager, target)
    }

    fn schedule(manager: &DeadlineManager, saga_id: &SagaId, secs: u64, name: &str) -> ScheduleToken {
        manager
            .schedule_deadline(
                saga_id,
                SAGA_TYPE,
                Duration::from_secs(secs),
                name,
                Payload::new(name.to_string()),
            )
            .unwrap()
    }

    #[test]
    fn test_status_transitions() {
        assert!(DeadlineStatus::Scheduled.can_transition_to(DeadlineStatus::Fired));
        assert!(DeadlineStatus::Scheduled.can_transition_to(DeadlineStatus::Cancelled));
        assert!(!DeadlineStatus::Fired.can_transition_to(DeadlineStatus::Cancelled));
        assert!(!DeadlineStatus::Cancelled.can_transition_to(DeadlineStatus::Scheduled));
        assert!(DeadlineStatus::Fired.is_terminal());
        assert!(!DeadlineStatus::Scheduled.is_terminal());
    }

    #[tokio::test]
    async fn test_deadline_fires_once_when_due() {
        let (scheduler, manager, target) = setup(Behaviour::Handle);
        let saga_id = SagaId::new();
        let mut outcomes = manager.subscribe();

        let token = schedule(&manager, &saga_id, 60, "payment-timeout");
        assert!(manager.is_scheduled(&token));

        scheduler.advance(Duration::from_secs(59)).await;
        assert!(target.delivered.lock().is_empty());

        scheduler.advance(Duration::from_secs(1)).await;
        assert_eq!(*target.delivered.lock(), vec!["payment-timeout".to_string()]);
        assert!(!manager.is_scheduled(&token));

        let outcome = outcomes.try_recv().unwrap();
        assert_eq!(outcome.deadline.token, token);
        assert_eq!(outcome.result, DeadlineResult::Handled);

        // Inert after firing.
        assert!(!manager.cancel_deadline(&token));
    }

    #[tokio::test]
    async fn test_cancelled_deadline_never_fires() {
        let (scheduler, manager, target) = setup(Behaviour::Handle);
        let saga_id = SagaId::new();

        let token = schedule(&manager, &saga_id, 10, "reminder");
        assert!(manager.cancel_deadline(&token));
        assert!(!manager.cancel_deadline(&token));
        assert_eq!(scheduler.pending(), 0);

        scheduler.advance(Duration::from_secs(30)).await;
        assert!(target.delivered.lock().is_empty());
    }

    #[test]
    fn test_cancel_unknown_token_is_noop() {
        let (_scheduler, manager, _target) = setup(Behaviour::Handle);
        assert!(!manager.cancel_deadline(&ScheduleToken::new()));
    }

    #[test]
    fn test_cancel_for_saga_ignores_foreign_tokens() {
        let (_scheduler, manager, _target) = setup(Behaviour::Handle);
        let owner = SagaId::new();
        let intruder = SagaId::new();
        let token = schedule(&manager, &owner, 10, "reminder");

        assert!(!manager.cancel_deadline_for(&intruder, &token));
        assert!(manager.is_scheduled(&token));
        assert!(manager.cancel_deadline_for(&owner, &token));
        assert!(!manager.cancel_deadline_for(&owner, &token));
    }

    #[tokio::test]
    async fn test_cancel_all_with_name_filter() {
        let (scheduler, manager, target) = setup(Behaviour::Handle);
        let saga_id = SagaId::new();
        let other = SagaId::new();

        schedule(&manager, &saga_id, 10, "reminder");
        schedule(&manager, &saga_id, 20, "reminder");
        schedule(&manager, &saga_id, 30, "expiry");
        schedule(&manager, &other, 10, "reminder");

        assert_eq!(manager.cancel_all_deadlines(&saga_id, Some("reminder")), 2);
        assert_eq!(manager.pending_for_saga(&saga_id).len(), 1);
        assert_eq!(manager.cancel_all_deadlines(&saga_id, None), 1);
        assert_eq!(manager.cancel_all_deadlines(&saga_id, None), 0);
        assert_eq!(manager.pending_count(), 1);

        scheduler.advance(Duration::from_secs(60)).await;
        assert_eq!(*target.delivered.lock(), vec!["reminder".to_string()]);
    }

    #[tokio::test]
    async fn test_schedule_at_past_instant_fires_on_next_tick() {
        let (scheduler, manager, target) = setup(Behaviour::Handle);
        let saga_id = SagaId::new();
        let past = manager.now() - chrono::Duration::minutes(5);

        manager
            .schedule_deadline_at(&saga_id, SAGA_TYPE, past, "overdue", Payload::empty())
            .unwrap();
        scheduler.advance(Duration::ZERO).await;
        assert_eq!(*target.delivered.lock(), vec!["overdue".to_string()]);
    }

    #[tokio::test]
    async fn test_outcomes_report_missing_saga_and_failures() {
        for (behaviour, expected_failure) in [(Behaviour::Missing, false), (Behaviour::Fail, true)] {
            let (scheduler, manager, _target) = setup(behaviour);
            let mut outcomes = manager.subscribe();
            schedule(&manager, &SagaId::new(), 1, "check");
            scheduler.advance(Duration::from_secs(1)).await;

            let outcome = outcomes.try_recv().unwrap();
            match outcome.result {
                DeadlineResult::HandlerFailed(failure) => {
                    assert!(expected_failure);
                    assert_eq!(failure.message, "boom");
                }
                DeadlineResult::SagaNotFound => assert!(!expected_failure),
                other => panic!("unexpected result {:?}", other),
            }
            assert_eq!(manager.pending_count(), 0);
        }
    }

    #[tokio::test]
    async fn test_dropped_target_is_unavailable() {
        let (scheduler, manager, target) = setup(Behaviour::Handle);
        let mut outcomes = manager.subscribe();
        schedule(&manager, &SagaId::new(), 1, "check");
        drop(target);

        scheduler.advance(Duration::from_secs(1)).await;
        assert_eq!(
            outcomes.try_recv().unwrap().result,
            DeadlineResult::TargetUnavailable
        );
    }

    #[test]
    fn test_rejected_schedule_leaves_nothing_pending() {
        let manager = DeadlineManager::new(Arc::new(ManualScheduler::rejecting()));
        let result = manager.schedule_deadline(
            &SagaId::new(),
            SAGA_TYPE,
            Duration::from_secs(1),
            "check",
            Payload::empty(),
        );
        assert!(matches!(result, Err(DeadlineError::Scheduling { .. })));
        assert_eq!(manager.pending_count(), 0);
    }

    #[test]
    fn test_pending_deadlines_sorted_by_fire_time() {
        let (_scheduler, manager, _target) = setup(Behaviour::Handle);
        let saga_id = SagaId::new();
        schedule(&manager, &saga_id, 30, "late");
        schedule(&manager, &saga_id, 10, "early");

        let names: Vec<String> = manager
            .pending_deadlines()
            .into_iter()
            .map(|deadline| deadline.name)
            .collect();
        assert_eq!(names, vec!["early".to_string(), "late".to_string()]);
    }

    #[test]
    fn test_builder_requires_scheduler() {
        assert_eq!(
            DeadlineManager::builder().build().unwrap_err(),
            ConfigError::missing("scheduler")
        );
        let zero = DeadlineConfig::default().with_outcome_channel_capacity(0);
        assert!(
            DeadlineManager::builder()
                .scheduler(Arc::new(ManualScheduler::new()))
                .config(zero)
                .build()
                .is_err()
        );
    }
}
