//! Cancelling deadlines while tokio workers fire them: every deadline ends
//! either cancelled or handled, never both.

use saga_engine_core::deadline::{
    Deadline, DeadlineManager, DeadlineResult, DeadlineTarget, ScheduleToken,
};
use saga_engine_core::event::{Payload, SagaId};
use saga_engine_local::TokioTaskScheduler;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

const SAGA_TYPE: &str = "RaceSaga";
const DEADLINES: usize = 500;

#[derive(Default)]
struct CountingTarget {
    handled: Mutex<Vec<ScheduleToken>>,
}

impl DeadlineTarget for CountingTarget {
    fn saga_type(&self) -> &str {
        SAGA_TYPE
    }

    fn deliver_deadline(&self, deadline: &Deadline) -> DeadlineResult {
        self.handled.lock().unwrap().push(deadline.token);
        DeadlineResult::Handled
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_cancel_and_fire_have_exactly_one_winner() {
    let scheduler = TokioTaskScheduler::new();
    let deadlines = DeadlineManager::new(Arc::new(scheduler.clone()));
    let target = Arc::new(CountingTarget::default());
    deadlines.register_target(&target);
    let saga_id = SagaId::new();

    let tokens: Vec<ScheduleToken> = (0..DEADLINES)
        .map(|i| {
            deadlines
                .schedule_deadline(&saga_id, SAGA_TYPE, Duration::ZERO, "race", Payload::new(i))
                .unwrap()
        })
        .collect();

    let canceller = {
        let deadlines = Arc::clone(&deadlines);
        tokio::spawn(async move {
            let mut cancelled = Vec::new();
            for token in tokens {
                if deadlines.cancel_deadline(&token) {
                    cancelled.push(token);
                }
                tokio::task::yield_now().await;
            }
            cancelled
        })
    };
    let cancelled = canceller.await.unwrap();

    tokio::time::timeout(Duration::from_secs(10), async {
        while scheduler.in_flight() > 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .expect("scheduled deadlines did not settle");

    let handled = target.handled.lock().unwrap().clone();
    let handled_once: HashSet<ScheduleToken> = handled.iter().copied().collect();
    let cancelled_once: HashSet<ScheduleToken> = cancelled.iter().copied().collect();

    assert_eq!(handled.len(), handled_once.len(), "a deadline fired twice");
    assert!(handled_once.is_disjoint(&cancelled_once));
    assert_eq!(handled.len() + cancelled.len(), DEADLINES);
    assert_eq!(deadlines.pending_count(), 0);
}
