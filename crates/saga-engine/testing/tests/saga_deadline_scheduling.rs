//! Saga deadlines on virtual time: scheduling, firing, cancellation and the
//! store mirror.

use saga_engine_core::deadline::{DeadlineManager, DeadlineResult, DeadlineStatus, ScheduleToken};
use saga_engine_core::error::{Error, ErrorKind};
use saga_engine_core::event::EventMessage;
use saga_engine_core::port::deadline_store::DeadlineStore;
use saga_engine_core::port::task_scheduler::TaskScheduler;
use saga_engine_core::saga::{AssociationValue, SagaManager, SagaModel};
use saga_engine_local::InMemoryDeadlineStore;
use saga_engine_testing::VirtualTimeScheduler;
use std::sync::Arc;
use std::time::Duration;

const TRIGGER_DURATION: Duration = Duration::from_secs(10 * 60);

struct TriggerSagaStartEvent {
    identifier: String,
}

struct ResetTriggerEvent {
    identifier: String,
}

struct ResetAllEvent {
    identifier: String,
}

#[derive(Default)]
struct MySaga {
    schedule_token: Option<ScheduleToken>,
    deadlines_met: Vec<String>,
}

fn my_saga() -> SagaModel<MySaga> {
    SagaModel::builder("MySaga", MySaga::default)
        .start_on(
            "identifier",
            |e: &TriggerSagaStartEvent| e.identifier.clone(),
            |saga, _, lifecycle| {
                saga.schedule_token = Some(
                    lifecycle.schedule_deadline(TRIGGER_DURATION, "deadlineDetails".to_string())?,
                );
                Ok(())
            },
        )
        .on_event(
            "identifier",
            |e: &ResetTriggerEvent| e.identifier.clone(),
            |saga, _, lifecycle| {
                if let Some(token) = saga.schedule_token.take() {
                    lifecycle.cancel_deadline(&token);
                }
                Ok(())
            },
        )
        .on_event(
            "identifier",
            |e: &ResetAllEvent| e.identifier.clone(),
            |saga, _, lifecycle| {
                saga.schedule_token = None;
                lifecycle.cancel_all_deadlines(Some("String"));
                Ok(())
            },
        )
        .on_deadline::<String, _>(|saga, details, _| {
            saga.deadlines_met.push(details.clone());
            Ok(())
        })
        .build()
}

struct Fixture {
    clock: VirtualTimeScheduler,
    deadlines: Arc<DeadlineManager>,
    sagas: Arc<SagaManager<MySaga>>,
}

impl Fixture {
    fn new() -> Self {
        Self::with_model(my_saga())
    }

    fn with_model(model: SagaModel<MySaga>) -> Self {
        let clock = VirtualTimeScheduler::new();
        let deadlines = DeadlineManager::new(Arc::new(clock.clone()));
        let sagas = SagaManager::new(model, Arc::clone(&deadlines));
        Self {
            clock,
            deadlines,
            sagas,
        }
    }

    fn publish<E: std::any::Any + Send + Sync>(&self, event: E) {
        let dispatch = self.sagas.handle(&EventMessage::new(event));
        assert!(dispatch.is_success(), "{:?}", dispatch.failures);
    }

    fn start(&self) {
        self.publish(TriggerSagaStartEvent {
            identifier: "id".to_string(),
        });
    }

    fn saga_id(&self) -> saga_engine_core::event::SagaId {
        self.sagas
            .find_sagas(&AssociationValue::new("identifier", "id"))
            .into_iter()
            .next()
            .expect("saga for identifier=id")
    }
}

#[tokio::test]
async fn test_deadline_scheduling() {
    let fixture = Fixture::new();
    let start = fixture.clock.now();

    fixture.start();

    assert_eq!(fixture.sagas.active_saga_count(), 1);
    let pending = fixture.deadlines.pending_deadlines();
    assert_eq!(pending.len(), 1);
    let deadline = &pending[0];
    assert_eq!(deadline.fire_at - start, chrono::Duration::minutes(10));
    assert_eq!(deadline.name, "String");
    assert_eq!(deadline.saga_type, "MySaga");
    assert_eq!(
        deadline.payload.downcast_ref::<String>().map(String::as_str),
        Some("deadlineDetails")
    );
}

#[tokio::test]
async fn test_deadline_met() {
    let fixture = Fixture::new();
    let mut outcomes = fixture.deadlines.subscribe();
    fixture.start();

    fixture
        .clock
        .advance(TRIGGER_DURATION + Duration::from_secs(60))
        .await;

    assert_eq!(fixture.sagas.active_saga_count(), 1);
    assert_eq!(fixture.deadlines.pending_count(), 0);
    let met = fixture
        .sagas
        .with_saga(&fixture.saga_id(), |saga| saga.data().deadlines_met.clone());
    assert_eq!(met, Some(vec!["deadlineDetails".to_string()]));

    let outcome = outcomes.try_recv().unwrap();
    assert_eq!(outcome.result, DeadlineResult::Handled);
    assert_eq!(outcome.fired_at, outcome.deadline.fire_at);
    assert!(outcomes.try_recv().is_err());
}

#[tokio::test]
async fn test_deadline_not_met_before_due() {
    let fixture = Fixture::new();
    fixture.start();

    fixture
        .clock
        .advance(TRIGGER_DURATION - Duration::from_secs(1))
        .await;

    assert_eq!(fixture.deadlines.pending_count(), 1);
    let met = fixture
        .sagas
        .with_saga(&fixture.saga_id(), |saga| saga.data().deadlines_met.len());
    assert_eq!(met, Some(0));
}

#[tokio::test]
async fn test_deadline_cancelled() {
    let fixture = Fixture::new();
    fixture.start();

    fixture.publish(ResetTriggerEvent {
        identifier: "id".to_string(),
    });

    assert_eq!(fixture.sagas.active_saga_count(), 1);
    assert_eq!(fixture.deadlines.pending_count(), 0);
    assert_eq!(fixture.clock.pending_tasks(), 0);

    fixture.clock.advance(TRIGGER_DURATION * 2).await;
    assert_eq!(fixture.clock.executed_tasks(), 0);
}

#[tokio::test]
async fn test_cancel_all_deadlines_by_name() {
    let fixture = Fixture::new();
    fixture.start();
    let saga_id = fixture.saga_id();
    fixture
        .deadlines
        .schedule_deadline(
            &saga_id,
            "MySaga",
            Duration::from_secs(30),
            "reminder",
            saga_engine_core::event::Payload::new(7u32),
        )
        .unwrap();

    fixture.publish(ResetAllEvent {
        identifier: "id".to_string(),
    });

    let remaining = fixture.deadlines.pending_for_saga(&saga_id);
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].name, "reminder");
}

#[tokio::test]
async fn test_deadline_after_saga_ended_is_discarded() {
    let fixture = Fixture::new();
    let mut outcomes = fixture.deadlines.subscribe();
    fixture.start();
    let saga_id = fixture.saga_id();

    assert!(fixture.sagas.end_saga(&saga_id));
    assert_eq!(fixture.deadlines.pending_count(), 1);

    fixture.clock.advance(TRIGGER_DURATION).await;

    assert_eq!(outcomes.try_recv().unwrap().result, DeadlineResult::SagaNotFound);
    assert_eq!(fixture.deadlines.pending_count(), 0);
}

#[tokio::test]
async fn test_failing_deadline_handler_is_reported() {
    let model = SagaModel::builder("MySaga", MySaga::default)
        .start_on(
            "identifier",
            |e: &TriggerSagaStartEvent| e.identifier.clone(),
            |_, _, lifecycle| {
                lifecycle.schedule_deadline(TRIGGER_DURATION, "deadlineDetails".to_string())?;
                Ok(())
            },
        )
        .on_deadline::<String, _>(|_, _, _| Err(Error::new("boom".to_string(), ErrorKind::Handler)))
        .build();
    let fixture = Fixture::with_model(model);
    let mut outcomes = fixture.deadlines.subscribe();
    fixture.start();

    fixture.clock.advance(TRIGGER_DURATION).await;

    match outcomes.try_recv().unwrap().result {
        DeadlineResult::HandlerFailed(error) => {
            assert_eq!(error.message, "boom");
            assert_eq!(error.context.get("deadline").map(String::as_str), Some("String"));
        }
        other => panic!("unexpected result {other:?}"),
    }
    // Still active, and the deadline is not retried
    assert_eq!(fixture.sagas.active_saga_count(), 1);
    assert_eq!(fixture.deadlines.pending_count(), 0);
}

#[tokio::test]
async fn test_panicking_deadline_handler_is_reported() {
    let model = SagaModel::builder("MySaga", MySaga::default)
        .start_on(
            "identifier",
            |e: &TriggerSagaStartEvent| e.identifier.clone(),
            |_, _, lifecycle| {
                lifecycle.schedule_deadline(TRIGGER_DURATION, 42u32)?;
                Ok(())
            },
        )
        .on_deadline::<u32, _>(|_, _, lifecycle| {
            lifecycle.associate_with("extra", "v");
            panic!("inventory lookup failed");
        })
        .build();
    let fixture = Fixture::with_model(model);
    let mut outcomes = fixture.deadlines.subscribe();
    fixture.start();
    let saga_id = fixture.saga_id();

    fixture.clock.advance(TRIGGER_DURATION).await;

    match outcomes.try_recv().unwrap().result {
        DeadlineResult::HandlerFailed(error) => {
            assert!(error.message.contains("inventory lookup failed"));
            assert_eq!(error.context.get("deadline").map(String::as_str), Some("u32"));
        }
        other => panic!("unexpected result {other:?}"),
    }
    assert_eq!(fixture.deadlines.pending_count(), 0);
    assert_eq!(
        fixture.sagas.find_sagas(&AssociationValue::new("extra", "v")),
        vec![saga_id.clone()]
    );
    let associations = fixture
        .sagas
        .with_saga(&saga_id, |saga| saga.associations().len());
    assert_eq!(associations, Some(2));
}

#[tokio::test]
async fn test_deadline_without_handler() {
    let model = SagaModel::builder("MySaga", MySaga::default)
        .start_on(
            "identifier",
            |e: &TriggerSagaStartEvent| e.identifier.clone(),
            |_, _, lifecycle| {
                lifecycle.schedule_deadline(Duration::from_secs(1), 5u64)?;
                Ok(())
            },
        )
        .build();
    let fixture = Fixture::with_model(model);
    let mut outcomes = fixture.deadlines.subscribe();
    fixture.start();

    fixture.clock.advance(Duration::from_secs(1)).await;

    assert_eq!(outcomes.try_recv().unwrap().result, DeadlineResult::NoMatchingHandler);
}

#[tokio::test]
async fn test_deadline_state_is_mirrored_to_store() {
    let clock = VirtualTimeScheduler::new();
    let store = InMemoryDeadlineStore::new();
    let deadlines = DeadlineManager::builder()
        .scheduler(Arc::new(clock.clone()))
        .store(Arc::new(store.clone()))
        .build()
        .unwrap();
    let sagas = SagaManager::new(my_saga(), Arc::clone(&deadlines));

    for identifier in ["fires", "cancelled"] {
        sagas.handle(&EventMessage::new(TriggerSagaStartEvent {
            identifier: identifier.to_string(),
        }));
    }
    sagas.handle(&EventMessage::new(ResetTriggerEvent {
        identifier: "cancelled".to_string(),
    }));
    clock.advance(TRIGGER_DURATION).await;
    deadlines.sync_store().await;

    let fired = sagas.find_sagas(&AssociationValue::new("identifier", "fires"));
    let cancelled = sagas.find_sagas(&AssociationValue::new("identifier", "cancelled"));

    let fired_records = store.records_for_saga(&fired[0], true).await.unwrap();
    assert_eq!(fired_records.len(), 1);
    assert_eq!(fired_records[0].status, DeadlineStatus::Fired);
    assert_eq!(fired_records[0].deadline_name, "String");

    let cancelled_records = store.records_for_saga(&cancelled[0], true).await.unwrap();
    assert_eq!(cancelled_records[0].status, DeadlineStatus::Cancelled);
    assert!(store.records_for_saga(&cancelled[0], false).await.unwrap().is_empty());
}
