//! # saga-engine-testing
//!
//! Deterministic test doubles for saga-engine.
//! Provides [`VirtualTimeScheduler`], a clock tests advance by hand, and
//! [`ScriptedCommandDispatcher`], a command dispatcher replaying scripted
//! failures.

pub mod scripted_dispatcher;
pub mod virtual_time;

pub use scripted_dispatcher::{DispatchRecord, ScriptedCommandDispatcher};
pub use virtual_time::VirtualTimeScheduler;
