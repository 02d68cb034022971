//! # In-Memory DeadlineStore Implementation
//!
//! This module provides [`InMemoryDeadlineStore`], a [`DeadlineStore`] for
//! local applications and tests that want to inspect which deadlines the
//! [`DeadlineManager`](saga_engine_core::DeadlineManager) has scheduled,
//! fired or cancelled.

use async_trait::async_trait;
use saga_engine_core::deadline::{DeadlineStatus, ScheduleToken};
use saga_engine_core::event::SagaId;
use saga_engine_core::port::deadline_store::{DeadlineRecord, DeadlineStore, DeadlineStoreError};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

/// Configuration for [`InMemoryDeadlineStore`].
#[derive(Debug, Clone)]
pub struct InMemoryDeadlineStoreConfig {
    /// Keep fired and cancelled records instead of dropping them.
    pub retain_terminal: bool,
}

impl Default for InMemoryDeadlineStoreConfig {
    fn default() -> Self {
        Self {
            retain_terminal: true,
        }
    }
}

/// In-memory DeadlineStore implementation.
///
/// # Examples
///
/// ```rust
/// use saga_engine_local::deadline_store::InMemoryDeadlineStore;
///
/// let store = InMemoryDeadlineStore::builder()
///     .retain_terminal(false)
///     .build();
/// ```
#[derive(Debug, Clone, Default)]
pub struct InMemoryDeadlineStore {
    records: Arc<Mutex<BTreeMap<ScheduleToken, DeadlineRecord>>>,
    config: InMemoryDeadlineStoreConfig,
}

impl InMemoryDeadlineStore {
    pub fn builder() -> InMemoryDeadlineStoreBuilder {
        InMemoryDeadlineStoreBuilder::new()
    }

    #[must_use]
    pub fn new() -> Self {
        Self::with_config(InMemoryDeadlineStoreConfig::default())
    }

    #[must_use]
    pub fn with_config(config: InMemoryDeadlineStoreConfig) -> Self {
        Self {
            records: Arc::new(Mutex::new(BTreeMap::new())),
            config,
        }
    }

    /// Number of stored records, terminal ones included.
    pub async fn len(&self) -> usize {
        self.records.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.lock().await.is_empty()
    }

    /// All records currently in the given status, ordered by fire time.
    pub async fn records_with_status(&self, status: DeadlineStatus) -> Vec<DeadlineRecord> {
        let records = self.records.lock().await;
        let mut matching: Vec<DeadlineRecord> = records
            .values()
            .filter(|record| record.status == status)
            .cloned()
            .collect();
        matching.sort_by_key(|record| record.fire_at);
        matching
    }
}

#[async_trait]
impl DeadlineStore for InMemoryDeadlineStore {
    async fn save(&self, record: &DeadlineRecord) -> Result<(), DeadlineStoreError> {
        let mut records = self.records.lock().await;
        if records.contains_key(&record.token) {
            return Err(DeadlineStoreError::Write(format!(
                "deadline {} already stored",
                record.token
            )));
        }
        records.insert(record.token, record.clone());
        Ok(())
    }

    async fn update_status(
        &self,
        token: &ScheduleToken,
        status: DeadlineStatus,
    ) -> Result<(), DeadlineStoreError> {
        let mut records = self.records.lock().await;
        let record = records
            .get_mut(token)
            .ok_or_else(|| DeadlineStoreError::not_found(token))?;

        if !record.status.can_transition_to(status) {
            return Err(DeadlineStoreError::Write(format!(
                "deadline {} cannot move from {} to {}",
                token, record.status, status
            )));
        }
        record.status = status;

        if status.is_terminal() && !self.config.retain_terminal {
            records.remove(token);
            debug!(token = %token, status = %status, "Dropped terminal deadline record");
        }
        Ok(())
    }

    async fn get(&self, token: &ScheduleToken) -> Result<Option<DeadlineRecord>, DeadlineStoreError> {
        let records = self.records.lock().await;
        Ok(records.get(token).cloned())
    }

    async fn records_for_saga(
        &self,
        saga_id: &SagaId,
        include_terminal: bool,
    ) -> Result<Vec<DeadlineRecord>, DeadlineStoreError> {
        let records = self.records.lock().await;

        let mut saga_records: Vec<DeadlineRecord> = records
            .values()
            .filter(|record| record.saga_id == *saga_id)
            .filter(|record| include_terminal || !record.status.is_terminal())
            .cloned()
            .collect();
        saga_records.sort_by_key(|record| (record.fire_at, record.scheduled_at));

        Ok(saga_records)
    }
}

/// Builder for [`InMemoryDeadlineStore`].
#[derive(Debug, Default)]
pub struct InMemoryDeadlineStoreBuilder {
    config: InMemoryDeadlineStoreConfig,
}

impl InMemoryDeadlineStoreBuilder {
    pub fn new() -> Self {
        Self {
            config: InMemoryDeadlineStoreConfig::default(),
        }
    }

    pub fn retain_terminal(mut self, retain: bool) -> Self {
        self.config.retain_terminal = retain;
        self
    }

    #[must_use]
    pub fn build(self) -> InMemoryDeadlineStore {
        InMemoryDeadlineStore::with_config(self.config)
    }
}
