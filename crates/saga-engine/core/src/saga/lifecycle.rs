//! Per-invocation saga lifecycle context.
//!
//! Every event or deadline handler receives a [`SagaLifecycle`] bound to the
//! saga instance being invoked. It is the only way a handler reaches the
//! deadline manager or changes the instance's associations, and it cannot
//! outlive the invocation.

use super::{AssociationValue, AssociationValues};
use crate::deadline::{DeadlineError, DeadlineManager, ScheduleToken};
use crate::event::{Payload, SagaId, simple_name};
use chrono::{DateTime, Utc};
use std::any::Any;
use std::time::Duration;

/// Lifecycle operations available to the saga instance currently handling a
/// message.
pub struct SagaLifecycle<'a> {
    saga_id: &'a SagaId,
    saga_type: &'a str,
    deadlines: &'a DeadlineManager,
    associations: &'a mut AssociationValues,
    end_requested: bool,
}

impl<'a> SagaLifecycle<'a> {
    pub(crate) fn new(
        saga_id: &'a SagaId,
        saga_type: &'a str,
        deadlines: &'a DeadlineManager,
        associations: &'a mut AssociationValues,
    ) -> Self {
        Self {
            saga_id,
            saga_type,
            deadlines,
            associations,
            end_requested: false,
        }
    }

    pub fn saga_id(&self) -> &SagaId {
        self.saga_id
    }

    pub fn saga_type(&self) -> &str {
        self.saga_type
    }

    /// Current time of the deadline scheduler.
    pub fn now(&self) -> DateTime<Utc> {
        self.deadlines.now()
    }

    /// Schedule a deadline named after the payload's type.
    pub fn schedule_deadline<T: Any + Send + Sync>(
        &self,
        delay: Duration,
        payload: T,
    ) -> Result<ScheduleToken, DeadlineError> {
        let name = simple_name(std::any::type_name::<T>());
        self.schedule_named_deadline(delay, name, payload)
    }

    pub fn schedule_named_deadline<T: Any + Send + Sync>(
        &self,
        delay: Duration,
        name: impl Into<String>,
        payload: T,
    ) -> Result<ScheduleToken, DeadlineError> {
        self.deadlines.schedule_deadline(
            self.saga_id,
            self.saga_type,
            delay,
            name,
            Payload::new(payload),
        )
    }

    /// Schedule a deadline at an absolute instant.
    pub fn schedule_deadline_at<T: Any + Send + Sync>(
        &self,
        instant: DateTime<Utc>,
        name: impl Into<String>,
        payload: T,
    ) -> Result<ScheduleToken, DeadlineError> {
        self.deadlines.schedule_deadline_at(
            self.saga_id,
            self.saga_type,
            instant,
            name,
            Payload::new(payload),
        )
    }

    /// Cancel one of this saga's deadlines. Unknown or already terminal
    /// tokens, and tokens of other sagas, are ignored.
    pub fn cancel_deadline(&self, token: &ScheduleToken) -> bool {
        self.deadlines.cancel_deadline_for(self.saga_id, token)
    }

    /// Cancel all of this saga's pending deadlines, optionally only those
    /// with the given name.
    pub fn cancel_all_deadlines(&self, name: Option<&str>) -> usize {
        self.deadlines.cancel_all_deadlines(self.saga_id, name)
    }

    /// Route future events carrying `key = value` to this saga.
    pub fn associate_with(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.associations.add(AssociationValue::new(key, value));
    }

    /// Stop routing `key = value` to this saga. Removing the last
    /// association ends the saga once the handler returns.
    pub fn remove_association(&mut self, key: &str, value: &str) -> bool {
        self.associations.remove(&AssociationValue::new(key, value))
    }

    pub fn associations(&self) -> &AssociationValues {
        self.associations
    }

    /// End the saga once the handler returns.
    pub fn end(&mut self) {
        self.end_requested = true;
    }

    pub fn is_end_requested(&self) -> bool {
        self.end_requested
    }
}
