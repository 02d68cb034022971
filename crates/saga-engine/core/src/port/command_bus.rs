//! # CommandDispatcher Port
//!
//! This module defines the [`CommandDispatcher`] trait the retry machinery
//! redelivers commands to. Commands are opaque to the engine: a
//! [`CommandMessage`] only carries a name, a payload and metadata.
//!
//! # Example
//!
//! ```ignore
//! use async_trait::async_trait;
//!
//! #[derive(Debug)]
//! struct InventoryBus;
//!
//! #[async_trait]
//! impl CommandDispatcher for InventoryBus {
//!     async fn dispatch(&self, command: CommandMessage) -> Result<Payload, DispatchError> {
//!         // route to the handler for command.command_name
//!         Ok(Payload::empty())
//!     }
//! }
//! ```

use crate::error::classification::{FailureKind, FailureRecord};
use crate::event::Payload;
use async_trait::async_trait;
use std::any::Any;
use std::collections::HashMap;
use std::fmt::Debug;
use thiserror::Error;
use uuid::Uuid;

/// A command on its way to a handler.
#[derive(Debug, Clone)]
pub struct CommandMessage {
    /// Unique message identifier, kept across redeliveries.
    pub identifier: Uuid,
    /// Routing name of the command.
    pub command_name: String,
    /// Command payload.
    pub payload: Payload,
    /// Correlation data.
    pub metadata: HashMap<String, String>,
}

impl CommandMessage {
    /// Wrap a payload; the command name defaults to the payload's type name.
    pub fn new<T: Any + Send + Sync>(payload: T) -> Self {
        let payload = Payload::new(payload);
        Self {
            identifier: Uuid::new_v4(),
            command_name: payload.simple_type_name().to_string(),
            payload,
            metadata: HashMap::new(),
        }
    }

    /// Override the routing name.
    pub fn with_name(mut self, command_name: impl Into<String>) -> Self {
        self.command_name = command_name.into();
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Failure reported by a command dispatcher.
///
/// Failures form a chain (`cause`), outermost first, which is what
/// [`DispatchError::failure_record`] captures for retry classification.
#[derive(Debug, Clone, Error)]
#[error("{kind}: {message}")]
pub struct DispatchError {
    kind: FailureKind,
    message: String,
    #[source]
    cause: Option<Box<DispatchError>>,
}

impl DispatchError {
    pub fn new(kind: impl Into<FailureKind>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            cause: None,
        }
    }

    /// Attach the failure that caused this one.
    pub fn caused_by(mut self, cause: DispatchError) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    pub fn kind(&self) -> &FailureKind {
        &self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn cause(&self) -> Option<&DispatchError> {
        self.cause.as_deref()
    }

    /// Snapshot of the kind chain, outermost first.
    pub fn failure_record(&self) -> FailureRecord {
        let mut kinds = Vec::new();
        let mut current = Some(self);
        while let Some(error) = current {
            kinds.push(error.kind.clone());
            current = error.cause.as_deref();
        }
        FailureRecord::new(kinds)
    }
}

/// Delivers commands to their handlers.
#[async_trait]
pub trait CommandDispatcher: Send + Sync + Debug {
    /// Dispatch a command and return its result payload.
    async fn dispatch(&self, command: CommandMessage) -> Result<Payload, DispatchError>;
}
