//! # Saga Manager
//!
//! Routes events to saga instances by association value, creates and ends
//! instances, and receives fired deadlines for its saga type.
//!
//! A saga type is declared once as a [`SagaModel`]: a factory for the saga's
//! state plus explicit tables of event and deadline handlers. Handlers get
//! the instance state and a [`SagaLifecycle`] for the duration of one
//! invocation.
//!
//! Invocations on the same instance are serialized by a per-instance mutex;
//! distinct instances are handled in parallel.

pub mod lifecycle;

use crate::deadline::{
    Deadline, DeadlineHandlers, DeadlineManager, DeadlineResult, DeadlineTarget,
};
use crate::error::Result;
use crate::event::{EventMessage, Payload, SagaId};
use crate::{Error, ErrorKind};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::any::{Any, TypeId};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, warn};

pub use lifecycle::SagaLifecycle;

/// Handler invoked with the saga's state, the event and the lifecycle
/// context of the invocation.
pub type EventHandlerFn<S> =
    Arc<dyn Fn(&mut S, &EventMessage, &mut SagaLifecycle<'_>) -> Result<()> + Send + Sync>;

/// A `key = value` pair routing events to saga instances.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AssociationValue {
    key: String,
    value: String,
}

impl AssociationValue {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn value(&self) -> &str {
        &self.value
    }
}

impl fmt::Display for AssociationValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.key, self.value)
    }
}

/// The association values of one saga instance.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AssociationValues(BTreeSet<AssociationValue>);

impl AssociationValues {
    pub fn add(&mut self, value: AssociationValue) -> bool {
        self.0.insert(value)
    }

    pub fn remove(&mut self, value: &AssociationValue) -> bool {
        self.0.remove(value)
    }

    pub fn contains(&self, value: &AssociationValue) -> bool {
        self.0.contains(value)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &AssociationValue> {
        self.0.iter()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SagaLifecycleState {
    Active,
    Ended,
}

/// One running saga.
#[derive(Debug)]
pub struct SagaInstance<S> {
    id: SagaId,
    saga_type: String,
    associations: AssociationValues,
    state: SagaLifecycleState,
    data: S,
    started_at: DateTime<Utc>,
}

impl<S> SagaInstance<S> {
    pub fn id(&self) -> &SagaId {
        &self.id
    }

    pub fn saga_type(&self) -> &str {
        &self.saga_type
    }

    pub fn associations(&self) -> &AssociationValues {
        &self.associations
    }

    pub fn state(&self) -> SagaLifecycleState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        self.state == SagaLifecycleState::Active
    }

    /// The user-defined saga state.
    pub fn data(&self) -> &S {
        &self.data
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }
}

/// Whether an event may create a new saga instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SagaCreationPolicy {
    /// Only existing instances handle the event.
    Never,
    /// Create an instance when none is associated with the event.
    IfNoneFound,
    /// Always create a new instance, in addition to invoking existing ones.
    Always,
}

struct EventRegistration<S> {
    event_type: TypeId,
    event_name: &'static str,
    association_key: String,
    resolve: Arc<dyn Fn(&Payload) -> Option<String> + Send + Sync>,
    policy: SagaCreationPolicy,
    ends_saga: bool,
    handler: EventHandlerFn<S>,
}

/// Declaration of one saga type.
pub struct SagaModel<S> {
    saga_type: String,
    factory: Arc<dyn Fn() -> S + Send + Sync>,
    events: Vec<EventRegistration<S>>,
    deadlines: DeadlineHandlers<S>,
}

impl<S: 'static> SagaModel<S> {
    pub fn builder<F>(saga_type: impl Into<String>, factory: F) -> SagaModelBuilder<S>
    where
        F: Fn() -> S + Send + Sync + 'static,
    {
        SagaModelBuilder {
            model: SagaModel {
                saga_type: saga_type.into(),
                factory: Arc::new(factory),
                events: Vec::new(),
                deadlines: DeadlineHandlers::new(),
            },
        }
    }

    pub fn saga_type(&self) -> &str {
        &self.saga_type
    }

    pub fn deadline_handlers(&self) -> &DeadlineHandlers<S> {
        &self.deadlines
    }

    fn registration_for(&self, payload: &Payload) -> Option<&EventRegistration<S>> {
        let event_type = payload.type_id();
        self.events.iter().find(|r| r.event_type == event_type)
    }
}

impl<S> fmt::Debug for SagaModel<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SagaModel")
            .field("saga_type", &self.saga_type)
            .field(
                "events",
                &self.events.iter().map(|r| r.event_name).collect::<Vec<_>>(),
            )
            .field("deadlines", &self.deadlines)
            .finish()
    }
}

/// Builder for [`SagaModel`].
pub struct SagaModelBuilder<S> {
    model: SagaModel<S>,
}

impl<S: 'static> SagaModelBuilder<S> {
    /// Handle `E` on instances associated with `key = resolve(event)`.
    pub fn on_event<E, K, H>(self, key: impl Into<String>, resolve: K, handler: H) -> Self
    where
        E: Any,
        K: Fn(&E) -> String + Send + Sync + 'static,
        H: Fn(&mut S, &E, &mut SagaLifecycle<'_>) -> Result<()> + Send + Sync + 'static,
    {
        self.register(key, resolve, handler, SagaCreationPolicy::Never, false)
    }

    /// Like [`on_event`](Self::on_event), creating an instance if none is
    /// associated yet.
    pub fn start_on<E, K, H>(self, key: impl Into<String>, resolve: K, handler: H) -> Self
    where
        E: Any,
        K: Fn(&E) -> String + Send + Sync + 'static,
        H: Fn(&mut S, &E, &mut SagaLifecycle<'_>) -> Result<()> + Send + Sync + 'static,
    {
        self.register(key, resolve, handler, SagaCreationPolicy::IfNoneFound, false)
    }

    /// Always start a new instance for `E`.
    pub fn start_new_on<E, K, H>(self, key: impl Into<String>, resolve: K, handler: H) -> Self
    where
        E: Any,
        K: Fn(&E) -> String + Send + Sync + 'static,
        H: Fn(&mut S, &E, &mut SagaLifecycle<'_>) -> Result<()> + Send + Sync + 'static,
    {
        self.register(key, resolve, handler, SagaCreationPolicy::Always, false)
    }

    /// Handle `E` and end the instance afterwards.
    pub fn end_on<E, K, H>(self, key: impl Into<String>, resolve: K, handler: H) -> Self
    where
        E: Any,
        K: Fn(&E) -> String + Send + Sync + 'static,
        H: Fn(&mut S, &E, &mut SagaLifecycle<'_>) -> Result<()> + Send + Sync + 'static,
    {
        self.register(key, resolve, handler, SagaCreationPolicy::Never, true)
    }

    fn register<E, K, H>(
        mut self,
        key: impl Into<String>,
        resolve: K,
        handler: H,
        policy: SagaCreationPolicy,
        ends_saga: bool,
    ) -> Self
    where
        E: Any,
        K: Fn(&E) -> String + Send + Sync + 'static,
        H: Fn(&mut S, &E, &mut SagaLifecycle<'_>) -> Result<()> + Send + Sync + 'static,
    {
        let event_name = std::any::type_name::<E>();
        if self
            .model
            .events
            .iter()
            .any(|r| r.event_type == TypeId::of::<E>())
        {
            warn!(
                saga_type = %self.model.saga_type,
                event = event_name,
                "Event already has a handler; the first registration wins"
            );
        }
        let resolve = Arc::new(move |payload: &Payload| payload.downcast_ref::<E>().map(&resolve));
        self.model.events.push(EventRegistration {
            event_type: TypeId::of::<E>(),
            event_name,
            association_key: key.into(),
            resolve,
            policy,
            ends_saga,
            handler: typed_event_handler(handler),
        });
        self
    }

    pub fn on_deadline<T, F>(mut self, handler: F) -> Self
    where
        T: Any,
        F: Fn(&mut S, &T, &mut SagaLifecycle<'_>) -> Result<()> + Send + Sync + 'static,
    {
        self.model.deadlines = self.model.deadlines.on::<T, F>(handler);
        self
    }

    pub fn on_named_deadline<T, F>(mut self, name: impl Into<String>, handler: F) -> Self
    where
        T: Any,
        F: Fn(&mut S, &T, &mut SagaLifecycle<'_>) -> Result<()> + Send + Sync + 'static,
    {
        self.model.deadlines = self.model.deadlines.on_named::<T, F>(name, handler);
        self
    }

    pub fn on_deadline_family<P, F>(
        mut self,
        label: impl Into<String>,
        rank: u8,
        predicate: P,
        handler: F,
    ) -> Self
    where
        P: Fn(&Payload) -> bool + Send + Sync + 'static,
        F: Fn(&mut S, &Deadline, &mut SagaLifecycle<'_>) -> Result<()> + Send + Sync + 'static,
    {
        self.model.deadlines = self.model.deadlines.on_family(label, rank, predicate, handler);
        self
    }

    pub fn on_deadline_name<F>(mut self, name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(&mut S, &Deadline, &mut SagaLifecycle<'_>) -> Result<()> + Send + Sync + 'static,
    {
        self.model.deadlines = self.model.deadlines.on_deadline_name(name, handler);
        self
    }

    pub fn on_any_deadline<F>(mut self, handler: F) -> Self
    where
        F: Fn(&mut S, &Deadline, &mut SagaLifecycle<'_>) -> Result<()> + Send + Sync + 'static,
    {
        self.model.deadlines = self.model.deadlines.on_any(handler);
        self
    }

    pub fn build(self) -> SagaModel<S> {
        self.model
    }
}

fn typed_event_handler<S, E, H>(handler: H) -> EventHandlerFn<S>
where
    S: 'static,
    E: Any,
    H: Fn(&mut S, &E, &mut SagaLifecycle<'_>) -> Result<()> + Send + Sync + 'static,
{
    fn erase<S, F>(handler: F) -> EventHandlerFn<S>
    where
        F: Fn(&mut S, &EventMessage, &mut SagaLifecycle<'_>) -> Result<()> + Send + Sync + 'static,
    {
        Arc::new(handler)
    }

    erase(move |state, message, lifecycle| match message.payload.downcast_ref::<E>() {
        Some(event) => handler(state, event, lifecycle),
        None => Err(Error::new(
            format!(
                "Event payload {} is not a {}",
                message.payload.type_name(),
                std::any::type_name::<E>()
            ),
            ErrorKind::Handler,
        )),
    })
}

/// Errors reported by saga handlers.
#[derive(Debug, Error)]
pub enum SagaError {
    #[error("Saga {saga_id} failed to handle {event_type}")]
    Handler {
        saga_id: SagaId,
        event_type: String,
        #[source]
        source: Error,
    },
}

/// What happened when an event was published to a saga manager.
#[derive(Debug, Default)]
pub struct SagaDispatch {
    /// Instances whose handler ran, in invocation order.
    pub invoked: Vec<SagaId>,
    /// Instances created by this event.
    pub created: Vec<SagaId>,
    /// Instances ended by this event.
    pub ended: Vec<SagaId>,
    pub failures: Vec<SagaError>,
}

impl SagaDispatch {
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }
}

type SharedInstance<S> = Arc<Mutex<SagaInstance<S>>>;

/// Runs the instances of one saga type.
pub struct SagaManager<S> {
    model: SagaModel<S>,
    deadlines: Arc<DeadlineManager>,
    instances: DashMap<SagaId, SharedInstance<S>>,
    associations: RwLock<HashMap<AssociationValue, BTreeSet<SagaId>>>,
    creation_lock: Mutex<()>,
}

impl<S> fmt::Debug for SagaManager<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SagaManager")
            .field("saga_type", &self.model.saga_type)
            .field("active", &self.instances.len())
            .finish()
    }
}

impl<S: Send + 'static> SagaManager<S> {
    /// Create a manager and register it as the deadline target for its saga
    /// type.
    pub fn new(model: SagaModel<S>, deadlines: Arc<DeadlineManager>) -> Arc<Self> {
        let manager = Arc::new(Self {
            model,
            deadlines,
            instances: DashMap::new(),
            associations: RwLock::new(HashMap::new()),
            creation_lock: Mutex::new(()),
        });
        manager.deadlines.register_target(&manager);
        manager
    }

    pub fn saga_type(&self) -> &str {
        &self.model.saga_type
    }

    pub fn deadline_manager(&self) -> &Arc<DeadlineManager> {
        &self.deadlines
    }

    /// Publish an event to the instances it is associated with.
    pub fn handle(&self, event: &EventMessage) -> SagaDispatch {
        let mut dispatch = SagaDispatch::default();
        let Some(registration) = self.model.registration_for(&event.payload) else {
            debug!(
                saga_type = %self.model.saga_type,
                event = event.payload.simple_type_name(),
                "No saga handler for event"
            );
            return dispatch;
        };
        let Some(value) = (registration.resolve)(&event.payload) else {
            return dispatch;
        };
        let association = AssociationValue::new(registration.association_key.clone(), value);

        let (created, existing) = match registration.policy {
            SagaCreationPolicy::Never => (None, self.sagas_associated_with(&association)),
            policy => {
                let creation = self.creation_lock.lock();
                let existing = self.sagas_associated_with(&association);
                if policy == SagaCreationPolicy::Always || existing.is_empty() {
                    let instance = self.new_instance(&association);
                    // Locked before it becomes visible, so no other event or
                    // deadline reaches it ahead of the creating handler.
                    let mut guard = instance.lock();
                    self.publish_instance(&guard, &instance);
                    drop(creation);
                    let outcome =
                        self.run_handler(&mut guard, registration.ends_saga, |state, lifecycle| {
                            (registration.handler)(state, event, lifecycle)
                        });
                    (Some((guard.id.clone(), outcome)), existing)
                } else {
                    (None, existing)
                }
            }
        };

        if let Some((saga_id, outcome)) = created {
            dispatch.created.push(saga_id.clone());
            self.record(&mut dispatch, registration, saga_id, outcome);
        }
        for saga_id in existing {
            let Some(instance) = self.instance(&saga_id) else {
                continue;
            };
            let outcome = self.invoke(&instance, registration.ends_saga, |state, lifecycle| {
                (registration.handler)(state, event, lifecycle)
            });
            if let Some(outcome) = outcome {
                self.record(&mut dispatch, registration, saga_id, outcome);
            }
        }
        dispatch
    }

    fn record(
        &self,
        dispatch: &mut SagaDispatch,
        registration: &EventRegistration<S>,
        saga_id: SagaId,
        (result, ended): (Result<()>, bool),
    ) {
        dispatch.invoked.push(saga_id.clone());
        if ended {
            dispatch.ended.push(saga_id.clone());
        }
        if let Err(source) = result {
            error!(
                saga_id = %saga_id,
                saga_type = %self.model.saga_type,
                event = registration.event_name,
                error = %source,
                "Saga event handler failed"
            );
            dispatch.failures.push(SagaError::Handler {
                saga_id,
                event_type: registration.event_name.to_string(),
                source,
            });
        }
    }

    fn new_instance(&self, association: &AssociationValue) -> SharedInstance<S> {
        let mut associations = AssociationValues::default();
        associations.add(association.clone());
        Arc::new(Mutex::new(SagaInstance {
            id: SagaId::new(),
            saga_type: self.model.saga_type.clone(),
            associations,
            state: SagaLifecycleState::Active,
            data: (self.model.factory)(),
            started_at: self.deadlines.now(),
        }))
    }

    fn publish_instance(&self, instance: &SagaInstance<S>, shared: &SharedInstance<S>) {
        self.instances.insert(instance.id.clone(), Arc::clone(shared));
        let mut index = self.associations.write();
        for association in instance.associations.iter() {
            index
                .entry(association.clone())
                .or_default()
                .insert(instance.id.clone());
        }
        info!(
            saga_id = %instance.id,
            saga_type = %self.model.saga_type,
            associations = instance.associations.len(),
            "Saga started"
        );
    }

    /// Run `call` against an active instance and apply its lifecycle effects.
    ///
    /// Returns `None` if the instance ended before the lock was acquired,
    /// otherwise the handler's result and whether the instance ended.
    fn invoke<F>(
        &self,
        instance: &SharedInstance<S>,
        end_after: bool,
        call: F,
    ) -> Option<(Result<()>, bool)>
    where
        F: FnOnce(&mut S, &mut SagaLifecycle<'_>) -> Result<()>,
    {
        let mut guard = instance.lock();
        if !guard.is_active() {
            return None;
        }
        Some(self.run_handler(&mut guard, end_after, call))
    }

    /// A panicking handler is reported as a failed one; association changes
    /// it made before panicking are still indexed.
    fn run_handler<F>(
        &self,
        instance: &mut SagaInstance<S>,
        end_after: bool,
        call: F,
    ) -> (Result<()>, bool)
    where
        F: FnOnce(&mut S, &mut SagaLifecycle<'_>) -> Result<()>,
    {
        let before = instance.associations.clone();
        let SagaInstance {
            id,
            data,
            associations,
            ..
        } = &mut *instance;
        let mut lifecycle =
            SagaLifecycle::new(id, &self.model.saga_type, &self.deadlines, associations);
        let result = catch_unwind(AssertUnwindSafe(|| call(data, &mut lifecycle)))
            .unwrap_or_else(|panic| Err(Error::handler_panic(panic.as_ref())));
        let end_requested = lifecycle.is_end_requested();

        self.reindex(&instance.id, &before, &instance.associations);
        let ended = end_after || end_requested || instance.associations.is_empty();
        if ended {
            self.finish(instance);
        }
        (result, ended)
    }

    fn reindex(&self, id: &SagaId, before: &AssociationValues, after: &AssociationValues) {
        if before == after {
            return;
        }
        let mut index = self.associations.write();
        for removed in before.iter().filter(|value| !after.contains(value)) {
            if let Some(ids) = index.get_mut(removed) {
                ids.remove(id);
                if ids.is_empty() {
                    index.remove(removed);
                }
            }
        }
        for added in after.iter().filter(|value| !before.contains(value)) {
            index.entry(added.clone()).or_default().insert(id.clone());
        }
    }

    fn finish(&self, instance: &mut SagaInstance<S>) {
        instance.state = SagaLifecycleState::Ended;
        let associations = std::mem::take(&mut instance.associations);
        self.reindex(&instance.id, &associations, &AssociationValues::default());
        self.instances.remove(&instance.id);
        info!(
            saga_id = %instance.id,
            saga_type = %self.model.saga_type,
            "Saga ended"
        );
    }

    fn instance(&self, id: &SagaId) -> Option<SharedInstance<S>> {
        self.instances.get(id).map(|entry| Arc::clone(entry.value()))
    }

    fn sagas_associated_with(&self, association: &AssociationValue) -> Vec<SagaId> {
        self.associations
            .read()
            .get(association)
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Ids of active instances associated with `association`, sorted.
    pub fn find_sagas(&self, association: &AssociationValue) -> Vec<SagaId> {
        self.sagas_associated_with(association)
    }

    pub fn active_saga_count(&self) -> usize {
        self.instances.len()
    }

    /// Ids of all active instances, sorted.
    pub fn active_saga_ids(&self) -> Vec<SagaId> {
        let mut ids: Vec<SagaId> = self.instances.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn is_active(&self, id: &SagaId) -> bool {
        self.instances.contains_key(id)
    }

    /// Inspect an active instance.
    pub fn with_saga<R>(&self, id: &SagaId, inspect: impl FnOnce(&SagaInstance<S>) -> R) -> Option<R> {
        let instance = self.instance(id)?;
        let guard = instance.lock();
        guard.is_active().then(|| inspect(&*guard))
    }

    /// End an instance from outside a handler. Its pending deadlines are
    /// left in place and are discarded when they fire.
    pub fn end_saga(&self, id: &SagaId) -> bool {
        let Some(instance) = self.instance(id) else {
            return false;
        };
        let mut guard = instance.lock();
        if !guard.is_active() {
            return false;
        }
        self.finish(&mut guard);
        true
    }
}

impl<S: Send + 'static> DeadlineTarget for SagaManager<S> {
    fn saga_type(&self) -> &str {
        &self.model.saga_type
    }

    fn deliver_deadline(&self, deadline: &Deadline) -> DeadlineResult {
        let Some(instance) = self.instance(&deadline.saga_id) else {
            return DeadlineResult::SagaNotFound;
        };
        let Some(handler) = self.model.deadlines.resolve(deadline) else {
            return DeadlineResult::NoMatchingHandler;
        };
        match self.invoke(&instance, false, |state, lifecycle| {
            handler(state, deadline, lifecycle)
        }) {
            None => DeadlineResult::SagaNotFound,
            Some((Ok(()), _)) => DeadlineResult::Handled,
            Some((Err(e), _)) => DeadlineResult::HandlerFailed(
                e.with_context("saga_id", deadline.saga_id.to_string())
                    .with_context("deadline", deadline.name.clone())
                    .to_structured(),
            ),
        }
    }
}
