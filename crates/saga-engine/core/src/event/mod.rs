//! Message types shared by aggregates, sagas and deadlines.
//!
//! Payloads are opaque to the engine: they are carried as [`Payload`], a
//! type-erased, cheaply clonable value that handlers downcast to the concrete
//! type they registered for.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

/// Saga identifier type.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SagaId(pub String);

impl SagaId {
    /// Create a new saga ID from a UUID.
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid.to_string())
    }

    /// Generate a new random saga ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl Default for SagaId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SagaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Type-erased message payload.
///
/// Cloning a payload clones the `Arc`, never the value.
#[derive(Clone)]
pub struct Payload {
    value: Arc<dyn Any + Send + Sync>,
    type_name: &'static str,
}

impl Payload {
    /// Wrap a value.
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self {
            value: Arc::new(value),
            type_name: std::any::type_name::<T>(),
        }
    }

    /// Payload carrying no information.
    pub fn empty() -> Self {
        Self::new(())
    }

    /// Fully qualified name of the wrapped type.
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    /// Last path segment of [`Payload::type_name`].
    pub fn simple_type_name(&self) -> &'static str {
        simple_name(self.type_name)
    }

    /// Runtime type of the wrapped value.
    pub fn type_id(&self) -> TypeId {
        self.value.as_ref().type_id()
    }

    pub fn is<T: Any>(&self) -> bool {
        self.value.as_ref().is::<T>()
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.value.as_ref().downcast_ref::<T>()
    }

    /// Borrow the erased value.
    pub fn as_any(&self) -> &(dyn Any + Send + Sync) {
        self.value.as_ref()
    }
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Payload")
            .field("type", &self.type_name)
            .finish_non_exhaustive()
    }
}

/// Strip the module path (and generic arguments) from a type name.
pub(crate) fn simple_name(type_name: &'static str) -> &'static str {
    let without_generics = type_name.split('<').next().unwrap_or(type_name);
    without_generics
        .rsplit("::")
        .next()
        .unwrap_or(without_generics)
}

/// An event published on the event bus.
#[derive(Debug, Clone)]
pub struct EventMessage {
    /// Unique message identifier.
    pub identifier: Uuid,
    /// Event payload.
    pub payload: Payload,
    /// When the event was published.
    pub timestamp: DateTime<Utc>,
    /// Correlation data.
    pub metadata: HashMap<String, String>,
}

impl EventMessage {
    /// Create a new event message stamped with the current time.
    pub fn new<T: Any + Send + Sync>(payload: T) -> Self {
        Self::from_payload(Payload::new(payload))
    }

    pub fn from_payload(payload: Payload) -> Self {
        Self {
            identifier: Uuid::new_v4(),
            payload,
            timestamp: Utc::now(),
            metadata: HashMap::new(),
        }
    }

    /// Override the timestamp.
    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Add a metadata entry.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// An event that belongs to an aggregate's stream.
///
/// `aggregate_type` is the type tag used by the aggregate factory to decide
/// which concrete aggregate to instantiate for the first event of a stream.
#[derive(Debug, Clone)]
pub struct DomainEventMessage {
    /// Type tag of the aggregate that emitted the event.
    pub aggregate_type: String,
    /// Identifier of the aggregate instance.
    pub aggregate_id: String,
    /// Position in the aggregate's stream.
    pub sequence_number: u64,
    /// The underlying event.
    pub event: EventMessage,
}

impl DomainEventMessage {
    pub fn new<T: Any + Send + Sync>(
        aggregate_type: impl Into<String>,
        aggregate_id: impl Into<String>,
        sequence_number: u64,
        payload: T,
    ) -> Self {
        Self {
            aggregate_type: aggregate_type.into(),
            aggregate_id: aggregate_id.into(),
            sequence_number,
            event: EventMessage::new(payload),
        }
    }

    /// Type tag of the aggregate.
    pub fn aggregate_type(&self) -> &str {
        &self.aggregate_type
    }

    pub fn payload(&self) -> &Payload {
        &self.event.payload
    }
}
