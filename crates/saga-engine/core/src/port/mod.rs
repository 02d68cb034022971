//! Ports for saga engine infrastructure adapters.
//!
//! This module defines the trait abstractions (ports) the saga engine
//! uses to interact with infrastructure. Each port can have multiple
//! implementations (tokio, in-memory, virtual time, ...).

pub mod command_bus;
pub mod deadline_store;
pub mod task_scheduler;

pub use command_bus::{CommandDispatcher, CommandMessage, DispatchError};
pub use deadline_store::{DeadlineRecord, DeadlineStore, DeadlineStoreError};
pub use task_scheduler::{
    ScheduledTask, SchedulerError, TaskHandle, TaskScheduler, delay_until, saturating_add,
};
