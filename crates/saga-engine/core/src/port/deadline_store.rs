//! DeadlineStore port for durable deadline bookkeeping.
//!
//! The [`DeadlineManager`](crate::deadline::DeadlineManager) keeps the
//! authoritative pending set in memory. When a store is configured, every
//! state change is mirrored to it, in order, so a durable backend can track
//! which deadlines are outstanding. Payload persistence is left to the
//! backend; records only carry the payload's type name.

use crate::deadline::{DeadlineStatus, ScheduleToken};
use crate::event::SagaId;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use thiserror::Error;

/// Errors from deadline store operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeadlineStoreError {
    #[error("Deadline write failed: {0}")]
    Write(String),

    #[error("Deadline retrieval failed: {0}")]
    Retrieve(String),

    #[error("Deadline not found: {0}")]
    NotFound(String),
}

impl DeadlineStoreError {
    pub fn not_found(token: &ScheduleToken) -> Self {
        Self::NotFound(token.to_string())
    }
}

/// Stored view of a deadline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadlineRecord {
    pub token: ScheduleToken,
    pub saga_id: SagaId,
    pub saga_type: String,
    pub deadline_name: String,
    /// Fully qualified type name of the payload.
    pub payload_type: String,
    pub fire_at: DateTime<Utc>,
    pub scheduled_at: DateTime<Utc>,
    pub status: DeadlineStatus,
}

/// Trait for durable deadline storage.
#[async_trait]
pub trait DeadlineStore: Send + Sync + Debug {
    /// Persist a newly scheduled deadline.
    async fn save(&self, record: &DeadlineRecord) -> Result<(), DeadlineStoreError>;

    /// Move a deadline to a terminal status.
    async fn update_status(
        &self,
        token: &ScheduleToken,
        status: DeadlineStatus,
    ) -> Result<(), DeadlineStoreError>;

    async fn get(&self, token: &ScheduleToken) -> Result<Option<DeadlineRecord>, DeadlineStoreError>;

    /// Deadlines of one saga, ordered by fire time.
    ///
    /// * `include_terminal` - also return fired and cancelled deadlines.
    async fn records_for_saga(
        &self,
        saga_id: &SagaId,
        include_terminal: bool,
    ) -> Result<Vec<DeadlineRecord>, DeadlineStoreError>;
}
