//! # ScriptedCommandDispatcher
//!
//! A [`CommandDispatcher`] that replays a scripted sequence of replies and
//! records every dispatch, for driving retry scenarios.
//!
//! ```rust,ignore
//! let dispatcher = ScriptedCommandDispatcher::new()
//!     .then_fail_times(2, DispatchError::new("ConnectionReset", "reset by peer"))
//!     .then_succeed();
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use saga_engine_core::event::Payload;
use saga_engine_core::port::command_bus::{CommandDispatcher, CommandMessage, DispatchError};
use saga_engine_core::port::task_scheduler::TaskScheduler;
use std::collections::VecDeque;
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Clone)]
enum Reply {
    Echo,
    Fail(DispatchError),
}

/// One observed dispatch.
#[derive(Debug, Clone)]
pub struct DispatchRecord {
    pub identifier: Uuid,
    pub command_name: String,
    pub dispatched_at: DateTime<Utc>,
    pub outcome: Result<(), DispatchError>,
}

/// Dispatcher replaying scripted replies.
///
/// Once the script is used up every dispatch gets the fallback reply, which
/// echoes the command payload unless [`failing_with`](Self::failing_with)
/// changed it.
#[derive(Debug)]
pub struct ScriptedCommandDispatcher {
    script: Mutex<VecDeque<Reply>>,
    fallback: Reply,
    clock: Option<Arc<dyn TaskScheduler>>,
    records: Mutex<Vec<DispatchRecord>>,
}

impl Default for ScriptedCommandDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedCommandDispatcher {
    pub fn new() -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            fallback: Reply::Echo,
            clock: None,
            records: Mutex::new(Vec::new()),
        }
    }

    /// Fail every unscripted dispatch with `error`.
    pub fn failing_with(mut self, error: DispatchError) -> Self {
        self.fallback = Reply::Fail(error);
        self
    }

    /// Timestamp dispatches with `clock` instead of the wall clock.
    pub fn with_clock(mut self, clock: Arc<dyn TaskScheduler>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn then_fail(self, error: DispatchError) -> Self {
        self.script.lock().push_back(Reply::Fail(error));
        self
    }

    pub fn then_fail_times(self, times: usize, error: DispatchError) -> Self {
        self.script
            .lock()
            .extend(std::iter::repeat_n(Reply::Fail(error), times));
        self
    }

    pub fn then_succeed(self) -> Self {
        self.script.lock().push_back(Reply::Echo);
        self
    }

    pub fn dispatch_count(&self) -> usize {
        self.records.lock().len()
    }

    pub fn records(&self) -> Vec<DispatchRecord> {
        self.records.lock().clone()
    }

    /// Dispatch instants, oldest first.
    pub fn dispatch_times(&self) -> Vec<DateTime<Utc>> {
        self.records
            .lock()
            .iter()
            .map(|record| record.dispatched_at)
            .collect()
    }

    /// Panics unless exactly `expected` dispatches were observed.
    pub fn assert_dispatched(&self, expected: usize) {
        let actual = self.dispatch_count();
        assert_eq!(
            actual, expected,
            "expected {expected} dispatch(es), observed {actual}"
        );
    }

    fn now(&self) -> DateTime<Utc> {
        self.clock
            .as_ref()
            .map(|clock| clock.now())
            .unwrap_or_else(Utc::now)
    }
}

#[async_trait]
impl CommandDispatcher for ScriptedCommandDispatcher {
    async fn dispatch(&self, command: CommandMessage) -> Result<Payload, DispatchError> {
        let reply = self
            .script
            .lock()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());
        let result = match reply {
            Reply::Echo => Ok(command.payload),
            Reply::Fail(error) => Err(error),
        };

        self.records.lock().push(DispatchRecord {
            identifier: command.identifier,
            command_name: command.command_name,
            dispatched_at: self.now(),
            outcome: result.as_ref().map(|_| ()).map_err(Clone::clone),
        });
        result
    }
}
