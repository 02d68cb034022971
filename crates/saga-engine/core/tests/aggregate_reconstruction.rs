//! Blank aggregate construction from the first event of a stream.

use saga_engine_core::aggregate::{
    AggregateFactory, AggregateTypeDescriptor, ConstructorError, IncompatibleAggregateError,
};
use saga_engine_core::event::DomainEventMessage;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Default)]
struct StubAggregate {
    identifier: Option<String>,
}

impl StubAggregate {
    fn with_identifier(identifier: &str) -> Self {
        Self {
            identifier: Some(identifier.to_string()),
        }
    }
}

#[derive(Debug)]
struct MockException;

impl std::fmt::Display for MockException {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Mock")
    }
}

impl std::error::Error for MockException {}

#[test]
fn test_no_suitable_constructor() {
    let result = AggregateFactory::for_type(
        AggregateTypeDescriptor::<StubAggregate>::without_constructor("UnsuitableAggregate"),
    );
    assert!(matches!(
        result,
        Err(IncompatibleAggregateError::MissingConstructor { .. })
    ));
}

#[test]
fn test_constructor_not_callable() {
    let factory = AggregateFactory::for_type(AggregateTypeDescriptor::<StubAggregate>::fallible(
        "ExceptionThrowingAggregate",
        || Err(ConstructorError::Failed(Box::new(MockException))),
    ))
    .unwrap();

    let event = DomainEventMessage::new("ExceptionThrowingAggregate", "", 0, ());
    let error = factory
        .create(&Uuid::new_v4().to_string(), &event)
        .unwrap_err();

    match error {
        IncompatibleAggregateError::ConstructorFailed { type_name, source } => {
            assert_eq!(type_name, "ExceptionThrowingAggregate");
            assert_eq!(source.to_string(), "Mock");
        }
        other => panic!("unexpected error {other:?}"),
    }
}

#[test]
fn test_initialize_from_aggregate_snapshot() {
    let aggregate = StubAggregate::with_identifier("stubId");
    let snapshot = DomainEventMessage::new("StubAggregate", "stubId", 2, aggregate.clone());
    let factory = AggregateFactory::for_type(AggregateTypeDescriptor::<StubAggregate>::from_default())
        .unwrap()
        .with_snapshots();

    assert_eq!(factory.create("stubId", &snapshot).unwrap(), aggregate);
}

#[test]
fn test_first_event_yields_blank_instance() {
    let factory = AggregateFactory::for_type(AggregateTypeDescriptor::<StubAggregate>::from_default())
        .unwrap();
    let created = DomainEventMessage::new("StubAggregate", "stubId", 0, "created".to_string());

    let aggregate = factory.create("stubId", &created).unwrap();

    // Identity is applied by replaying events, not by the factory.
    assert_eq!(aggregate, StubAggregate::default());
}
