//! # saga-engine-core
//!
//! Temporal orchestration for event-sourced CQRS applications, with zero
//! infrastructure dependencies.
//!
//! ## Modules
//!
//! - [`aggregate`]: [`AggregateFactory`] rebuilds a blank aggregate from the
//!   first event of its stream
//! - [`retry`]: [`RetryScheduler`] and [`RetryingCommandGateway`] retry
//!   transiently failing command dispatches
//! - [`deadline`]: [`DeadlineManager`] schedules, cancels and fires saga deadlines
//! - [`saga`]: [`SagaManager`] routes events to saga instances and hands
//!   handlers a [`SagaLifecycle`]
//! - [`port`]: Ports for infrastructure adapters (TaskScheduler, CommandDispatcher, DeadlineStore)
//! - [`config`], [`telemetry`], [`error`]: ambient configuration, tracing and errors
//!
//! ## Usage
//!
//! ```rust,ignore
//! use saga_engine_core::{DeadlineManager, SagaManager, SagaModel};
//! use std::time::Duration;
//!
//! struct OrderPlaced { order_id: String }
//! struct PaymentTimeout;
//!
//! let model = SagaModel::builder("OrderSaga", || ())
//!     .start_on("order_id", |e: &OrderPlaced| e.order_id.clone(), |_, _, lifecycle| {
//!         lifecycle.schedule_deadline(Duration::from_secs(600), PaymentTimeout)?;
//!         Ok(())
//!     })
//!     .on_deadline::<PaymentTimeout, _>(|_, _, lifecycle| {
//!         lifecycle.end();
//!         Ok(())
//!     })
//!     .build();
//!
//! let deadlines = DeadlineManager::new(scheduler);
//! let sagas = SagaManager::new(model, deadlines);
//! ```

pub mod aggregate;
pub mod config;
pub mod deadline;
pub mod error;
pub mod event;
pub mod port;
pub mod retry;
pub mod saga;
pub mod telemetry;

pub use aggregate::{
    AggregateFactory, AggregateModel, AggregateTypeDescriptor, ConstructorError,
    IncompatibleAggregateError,
};
pub use config::{BackoffStrategy, DeadlineConfig, RetryConfig, SagaEngineConfig};
pub use deadline::{
    Deadline, DeadlineError, DeadlineHandlers, DeadlineManager, DeadlineManagerBuilder,
    DeadlineOutcome, DeadlineResult, DeadlineStatus, DeadlineTarget, ScheduleToken, Specificity,
};
pub use error::classification::{
    FailureClassifier, FailureKind, FailureRecord, NonTransientKinds, PredicateClassifier,
    RetryableKinds,
};
pub use error::{ConfigError, Error, ErrorKind, Result, StructuredError};
pub use event::{DomainEventMessage, EventMessage, Payload, SagaId};
pub use port::{
    CommandDispatcher, CommandMessage, DeadlineRecord, DeadlineStore, DeadlineStoreError,
    DispatchError, ScheduledTask, SchedulerError, TaskHandle, TaskScheduler,
};
pub use retry::{
    Backoff, CommandGatewayError, CompletionSink, DelayedRetryScheduler, DispatchAttempt,
    RedeliveryOutcome, RetryDecision, RetryPolicy, RetryScheduler, RetryingCommandGateway,
    SchedulingError,
};
pub use saga::{
    AssociationValue, AssociationValues, SagaCreationPolicy, SagaDispatch, SagaError,
    SagaInstance, SagaLifecycle, SagaLifecycleState, SagaManager, SagaModel,
};
pub use telemetry::{TelemetryConfig, TelemetryGuard, init_telemetry};
