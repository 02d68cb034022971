//! # Aggregate Reconstructor
//!
//! Creates a fresh aggregate instance from the first event of its stream
//! when no snapshot exists. The caller then replays the remaining history
//! onto the returned instance.
//!
//! Aggregate types are registered up front as [`AggregateTypeDescriptor`]s,
//! each with an explicit zero-argument constructor. For polymorphic
//! aggregates the descriptors of one [`AggregateModel`] usually construct
//! different variants of the same enum.
//!
//! Selection is driven by the first event's aggregate type tag:
//!
//! 1. the first descriptor (registration order) with an explicit type tag
//!    equal to it,
//! 2. else the first descriptor whose simple type name equals it,
//! 3. else [`IncompatibleAggregateError::UnknownType`].
//!
//! The first event only selects the descriptor; it never populates the
//! instance.

use crate::error::panic_message;
use crate::event::{DomainEventMessage, simple_name};
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error};

/// Failure reported by a registered constructor.
#[derive(Debug)]
pub enum ConstructorError {
    /// The constructor may not be used in this context.
    Inaccessible(String),
    /// The constructor ran and failed.
    Failed(Box<dyn std::error::Error + Send + Sync>),
}

/// The aggregate type cannot be instantiated from the given event.
#[derive(Debug, Error)]
pub enum IncompatibleAggregateError {
    #[error("The [{0}] aggregate does not exist.")]
    UnknownType(String),

    #[error("The aggregate [{type_name}] doesn't provide a no-arg constructor.")]
    MissingConstructor { type_name: String },

    #[error("The aggregate no-arg constructor of the aggregate [{type_name}] is not accessible: {reason}")]
    InaccessibleConstructor { type_name: String, reason: String },

    #[error("The no-arg constructor of [{type_name}] threw an exception on invocation.")]
    ConstructorFailed {
        type_name: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("The aggregate [{type_name}] does not have a suitable no-arg constructor.")]
    NotInstantiable { type_name: String },

    #[error("Given aggregate type may not be abstract: [{type_name}]")]
    AbstractType { type_name: String },
}

#[derive(Debug, Error)]
#[error("constructor panicked: {0}")]
struct ConstructorPanic(String);

type Constructor<A> = Arc<dyn Fn() -> Result<A, ConstructorError> + Send + Sync>;

/// Registration of one concrete (or abstract) aggregate type.
pub struct AggregateTypeDescriptor<A> {
    type_name: String,
    type_tag: Option<String>,
    constructor: Option<Constructor<A>>,
    is_abstract: bool,
}

impl<A> Clone for AggregateTypeDescriptor<A> {
    fn clone(&self) -> Self {
        Self {
            type_name: self.type_name.clone(),
            type_tag: self.type_tag.clone(),
            constructor: self.constructor.clone(),
            is_abstract: self.is_abstract,
        }
    }
}

impl<A> fmt::Debug for AggregateTypeDescriptor<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AggregateTypeDescriptor")
            .field("type_name", &self.type_name)
            .field("type_tag", &self.type_tag)
            .field("has_constructor", &self.constructor.is_some())
            .field("is_abstract", &self.is_abstract)
            .finish()
    }
}

impl<A: 'static> AggregateTypeDescriptor<A> {
    /// Concrete type with an infallible constructor.
    pub fn new<F>(type_name: impl Into<String>, constructor: F) -> Self
    where
        F: Fn() -> A + Send + Sync + 'static,
    {
        Self::fallible(type_name, move || Ok(constructor()))
    }

    /// Concrete type whose constructor may fail.
    pub fn fallible<F>(type_name: impl Into<String>, constructor: F) -> Self
    where
        F: Fn() -> Result<A, ConstructorError> + Send + Sync + 'static,
    {
        Self {
            type_name: type_name.into(),
            type_tag: None,
            constructor: Some(Arc::new(constructor)),
            is_abstract: false,
        }
    }

    /// Descriptor named after `A`, constructed with `A::default()`.
    pub fn from_default() -> Self
    where
        A: Default,
    {
        Self::new(simple_name(std::any::type_name::<A>()), A::default)
    }

    /// Concrete type that registered no constructor.
    pub fn without_constructor(type_name: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            type_tag: None,
            constructor: None,
            is_abstract: false,
        }
    }

    /// Abstract type; it can take part in a model but never be instantiated.
    pub fn abstract_type(type_name: impl Into<String>) -> Self {
        Self {
            is_abstract: true,
            ..Self::without_constructor(type_name)
        }
    }

    /// Explicit type tag, matched before simple type names.
    pub fn with_type_tag(mut self, type_tag: impl Into<String>) -> Self {
        self.type_tag = Some(type_tag.into());
        self
    }
}

impl<A> AggregateTypeDescriptor<A> {
    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn type_tag(&self) -> Option<&str> {
        self.type_tag.as_deref()
    }

    pub fn has_constructor(&self) -> bool {
        self.constructor.is_some()
    }

    pub fn is_abstract(&self) -> bool {
        self.is_abstract
    }

    fn instantiate(&self) -> Result<A, IncompatibleAggregateError> {
        let type_name = self.type_name.clone();
        if self.is_abstract {
            return Err(IncompatibleAggregateError::NotInstantiable { type_name });
        }
        let Some(constructor) = &self.constructor else {
            return Err(IncompatibleAggregateError::MissingConstructor { type_name });
        };

        match catch_unwind(AssertUnwindSafe(|| constructor())) {
            Ok(Ok(aggregate)) => Ok(aggregate),
            Ok(Err(ConstructorError::Inaccessible(reason))) => {
                Err(IncompatibleAggregateError::InaccessibleConstructor { type_name, reason })
            }
            Ok(Err(ConstructorError::Failed(source))) => {
                Err(IncompatibleAggregateError::ConstructorFailed { type_name, source })
            }
            Err(panic) => Err(IncompatibleAggregateError::ConstructorFailed {
                type_name,
                source: Box::new(ConstructorPanic(panic_message(panic.as_ref()))),
            }),
        }
    }
}

/// The type hierarchy of one aggregate: its root and any subtypes.
pub struct AggregateModel<A> {
    types: Vec<AggregateTypeDescriptor<A>>,
}

impl<A> Clone for AggregateModel<A> {
    fn clone(&self) -> Self {
        Self {
            types: self.types.clone(),
        }
    }
}

impl<A> fmt::Debug for AggregateModel<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(&self.types).finish()
    }
}

impl<A> AggregateModel<A> {
    pub fn new(root: AggregateTypeDescriptor<A>) -> Self {
        Self { types: vec![root] }
    }

    pub fn with_subtype(mut self, subtype: AggregateTypeDescriptor<A>) -> Self {
        self.types.push(subtype);
        self
    }

    pub fn root(&self) -> &AggregateTypeDescriptor<A> {
        &self.types[0]
    }

    /// All types, root first, in registration order.
    pub fn types(&self) -> &[AggregateTypeDescriptor<A>] {
        &self.types
    }
}

type SnapshotExtractor<A> = fn(&crate::event::Payload) -> Option<A>;

/// Creates aggregate instances from the first event of their stream.
pub struct AggregateFactory<A> {
    model: AggregateModel<A>,
    snapshot: Option<SnapshotExtractor<A>>,
}

impl<A> Clone for AggregateFactory<A> {
    fn clone(&self) -> Self {
        Self {
            model: self.model.clone(),
            snapshot: self.snapshot,
        }
    }
}

impl<A> fmt::Debug for AggregateFactory<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AggregateFactory")
            .field("model", &self.model)
            .field("snapshots", &self.snapshot.is_some())
            .finish()
    }
}

impl<A: 'static> AggregateFactory<A> {
    /// Factory for a single concrete type. Validated eagerly.
    pub fn for_type(
        descriptor: AggregateTypeDescriptor<A>,
    ) -> Result<Self, IncompatibleAggregateError> {
        if descriptor.is_abstract() {
            return Err(IncompatibleAggregateError::AbstractType {
                type_name: descriptor.type_name,
            });
        }
        if !descriptor.has_constructor() {
            return Err(IncompatibleAggregateError::MissingConstructor {
                type_name: descriptor.type_name,
            });
        }
        Ok(Self::from_model(AggregateModel::new(descriptor)))
    }

    /// Factory for a polymorphic model. Constructors are checked when used.
    pub fn from_model(model: AggregateModel<A>) -> Self {
        Self {
            model,
            snapshot: None,
        }
    }

    /// Return the first event's payload as-is when it already is an `A`.
    pub fn with_snapshots(mut self) -> Self
    where
        A: Clone + Send + Sync,
    {
        self.snapshot = Some(|payload| payload.downcast_ref::<A>().cloned());
        self
    }

    /// Simple type name of the model's root.
    pub fn aggregate_type(&self) -> &str {
        self.model.root().type_name()
    }

    pub fn model(&self) -> &AggregateModel<A> {
        &self.model
    }

    /// Create a blank aggregate for the stream `aggregate_identifier`.
    pub fn create(
        &self,
        aggregate_identifier: &str,
        first_event: &DomainEventMessage,
    ) -> Result<A, IncompatibleAggregateError> {
        if let Some(aggregate) = self.snapshot.and_then(|extract| extract(first_event.payload())) {
            debug!(
                aggregate_id = aggregate_identifier,
                "Aggregate restored from snapshot event"
            );
            return Ok(aggregate);
        }

        let type_tag = first_event.aggregate_type();
        let types = self.model.types();
        let descriptor = types
            .iter()
            .find(|d| d.type_tag() == Some(type_tag))
            .or_else(|| types.iter().find(|d| d.type_name() == type_tag))
            .ok_or_else(|| IncompatibleAggregateError::UnknownType(type_tag.to_string()))?;

        descriptor.instantiate().inspect_err(|e| {
            error!(
                aggregate_id = aggregate_identifier,
                aggregate_type = descriptor.type_name(),
                error = %e,
                "Failed to instantiate aggregate"
            )
        })
    }
}
