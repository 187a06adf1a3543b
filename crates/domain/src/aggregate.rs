//! Core aggregate and domain event traits.

use std::fmt::Debug;

use common::AggregateId;
use event_store::{StoredEvent, Version};
use serde::{Serialize, de::DeserializeOwned};

use crate::error::DomainError;

/// Trait for domain events.
///
/// Domain events represent facts that have happened in the domain.
/// They are immutable and should be named in past tense.
pub trait DomainEvent:
    Serialize + DeserializeOwned + Debug + Clone + PartialEq + Send + Sync
{
    /// Every event type name this event enum can produce.
    ///
    /// Stored events whose type is not listed here are skipped on replay.
    const EVENT_TYPES: &'static [&'static str];

    /// Returns the event type name.
    ///
    /// This is used for serialization and event store filtering.
    fn event_type(&self) -> &'static str;
}

/// Trait for aggregates in an event-sourced system.
///
/// In event sourcing, aggregates:
/// - Are rebuilt by replaying events
/// - Decide which events a command produces
/// - Apply events to update state (pure, deterministic)
pub trait Aggregate: Default + Debug + Clone + PartialEq + Send + Sync + Sized {
    /// The type of events this aggregate produces and consumes.
    type Event: DomainEvent;

    /// Returns the aggregate type name.
    ///
    /// Used for event store organization and routing.
    fn aggregate_type() -> &'static str;

    /// Applies an event to the aggregate, updating its state.
    ///
    /// This method must be pure and deterministic:
    /// - Given the same state and event, it must always produce the same new state
    /// - It must not have side effects
    /// - It must not fail (events represent facts that have happened)
    fn apply(&mut self, event: &Self::Event);
}

/// An aggregate together with its identity, persisted version and the
/// events recorded since it was loaded.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregateRoot<A: Aggregate> {
    id: AggregateId,
    state: A,
    version: Version,
    pending: Vec<A::Event>,
}

impl<A: Aggregate> AggregateRoot<A> {
    /// Creates an aggregate with no history.
    pub fn new(id: AggregateId) -> Self {
        Self {
            id,
            state: A::default(),
            version: Version::initial(),
            pending: Vec::new(),
        }
    }

    pub fn id(&self) -> AggregateId {
        self.id
    }

    pub fn state(&self) -> &A {
        &self.state
    }

    /// Version of the last persisted event. Pending events are not counted.
    pub fn version(&self) -> Version {
        self.version
    }

    /// True when nothing has been persisted or recorded for this aggregate.
    pub fn is_new(&self) -> bool {
        self.version == Version::initial() && self.pending.is_empty()
    }

    /// Records a new event and folds it into the state immediately.
    pub fn record_that(&mut self, event: A::Event) {
        self.state.apply(&event);
        self.pending.push(event);
    }

    /// Runs a decision against the current state and records every event it
    /// returns. Nothing is recorded if the decision fails.
    pub fn execute<E, F>(&mut self, decide: F) -> Result<&[A::Event], E>
    where
        F: FnOnce(&A) -> Result<Vec<A::Event>, E>,
    {
        let start = self.pending.len();
        for event in decide(&self.state)? {
            self.record_that(event);
        }
        Ok(&self.pending[start..])
    }

    pub fn pending_events(&self) -> &[A::Event] {
        &self.pending
    }

    /// Returns the recorded events and clears the pending list.
    pub fn release_events(&mut self) -> Vec<A::Event> {
        std::mem::take(&mut self.pending)
    }

    /// Moves the persisted version forward after a successful append.
    pub fn mark_persisted(&mut self, version: Version) {
        self.version = version;
    }

    /// Folds typed events in order, without recording them.
    pub fn from_events<'a>(id: AggregateId, events: impl IntoIterator<Item = &'a A::Event>) -> Self
    where
        A::Event: 'a,
    {
        let mut root = Self::new(id);
        for event in events {
            root.state.apply(event);
            root.version = root.version.next();
        }
        root
    }

    /// Rebuilds an aggregate from its stored history.
    ///
    /// Events of a type this aggregate does not know are skipped, but still
    /// count towards the version. A known event type with an undecodable
    /// payload is an error.
    pub fn reconstitute_from_history(
        id: AggregateId,
        history: &[StoredEvent],
    ) -> Result<Self, DomainError> {
        let mut root = Self::new(id);
        for stored in history {
            root.version = stored.version();

            if !A::Event::EVENT_TYPES.contains(&stored.event_type()) {
                tracing::trace!(
                    aggregate_type = A::aggregate_type(),
                    event_type = stored.event_type(),
                    "skipping unknown event type"
                );
                continue;
            }

            let event: A::Event =
                stored
                    .event
                    .payload_as()
                    .map_err(|source| DomainError::UndecodableEvent {
                        event_type: stored.event_type().to_string(),
                        sequence_id: stored.sequence_id,
                        source,
                    })?;
            root.state.apply(&event);
        }
        Ok(root)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use event_store::{EventEnvelope, SequenceId};
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    #[serde(tag = "type", content = "data")]
    pub enum CounterEvent {
        Opened { label: String },
        Counted { total: u32 },
    }

    impl DomainEvent for CounterEvent {
        const EVENT_TYPES: &'static [&'static str] = &["CounterOpened", "CounterCounted"];

        fn event_type(&self) -> &'static str {
            match self {
                CounterEvent::Opened { .. } => "CounterOpened",
                CounterEvent::Counted { .. } => "CounterCounted",
            }
        }
    }

    #[derive(Debug, Default, Clone, PartialEq)]
    pub struct Counter {
        pub label: Option<String>,
        pub total: u32,
    }

    impl Aggregate for Counter {
        type Event = CounterEvent;

        fn aggregate_type() -> &'static str {
            "Counter"
        }

        fn apply(&mut self, event: &CounterEvent) {
            match event {
                CounterEvent::Opened { label } => self.label = Some(label.clone()),
                CounterEvent::Counted { total } => self.total = *total,
            }
        }
    }

    fn stored(id: AggregateId, seq: i64, event_type: &str, payload: serde_json::Value) -> StoredEvent {
        StoredEvent {
            sequence_id: SequenceId::new(seq),
            event: EventEnvelope::builder()
                .aggregate_id(id)
                .aggregate_type("Counter")
                .event_type(event_type)
                .version(Version::new(seq))
                .payload_raw(payload)
                .build()
                .unwrap(),
        }
    }

    fn to_stored(id: AggregateId, events: &[CounterEvent]) -> Vec<StoredEvent> {
        events
            .iter()
            .enumerate()
            .map(|(i, e)| stored(id, i as i64 + 1, e.event_type(), serde_json::to_value(e).unwrap()))
            .collect()
    }

    #[test]
    fn record_that_applies_and_queues() {
        let mut root = AggregateRoot::<Counter>::new(AggregateId::new());
        root.record_that(CounterEvent::Opened { label: "a".into() });
        root.record_that(CounterEvent::Counted { total: 2 });

        assert_eq!(root.state().total, 2);
        assert_eq!(root.pending_events().len(), 2);
        assert_eq!(root.version(), Version::initial());
    }

    #[test]
    fn release_events_empties_pending() {
        let mut root = AggregateRoot::<Counter>::new(AggregateId::new());
        root.record_that(CounterEvent::Opened { label: "a".into() });

        assert_eq!(root.release_events().len(), 1);
        assert!(root.release_events().is_empty());
        assert_eq!(root.state().label.as_deref(), Some("a"));
    }

    #[test]
    fn execute_records_nothing_on_error() {
        let mut root = AggregateRoot::<Counter>::new(AggregateId::new());
        let result: Result<_, &str> = root.execute(|_| Err("rejected"));

        assert!(result.is_err());
        assert!(root.is_new());
    }

    #[test]
    fn replay_matches_live_fold() {
        let id = AggregateId::new();
        let events = vec![
            CounterEvent::Opened { label: "a".into() },
            CounterEvent::Counted { total: 1 },
            CounterEvent::Counted { total: 2 },
        ];

        let mut live = AggregateRoot::<Counter>::new(id);
        for event in events.clone() {
            live.record_that(event);
        }

        let replayed = AggregateRoot::<Counter>::reconstitute_from_history(id, &to_stored(id, &events))
            .unwrap();

        assert_eq!(replayed.state(), live.state());
        assert_eq!(replayed.version(), Version::new(3));
        assert!(replayed.pending_events().is_empty());
        assert_eq!(
            AggregateRoot::<Counter>::from_events(id, &events).state(),
            live.state()
        );
    }

    #[test]
    fn every_prefix_replays_to_its_fold() {
        let id = AggregateId::new();
        let events = vec![
            CounterEvent::Opened { label: "a".into() },
            CounterEvent::Counted { total: 5 },
            CounterEvent::Counted { total: 7 },
        ];
        let history = to_stored(id, &events);

        for n in 0..=events.len() {
            let replayed =
                AggregateRoot::<Counter>::reconstitute_from_history(id, &history[..n]).unwrap();
            let folded = AggregateRoot::<Counter>::from_events(id, &events[..n]);
            assert_eq!(replayed.state(), folded.state());
        }
    }

    #[test]
    fn unknown_event_types_are_skipped() {
        let id = AggregateId::new();
        let history = vec![
            stored(id, 1, "CounterOpened", serde_json::json!({"type": "Opened", "data": {"label": "a"}})),
            stored(id, 2, "LegacyAudit", serde_json::json!({"anything": true})),
            stored(id, 3, "CounterCounted", serde_json::json!({"type": "Counted", "data": {"total": 4}})),
        ];

        let root = AggregateRoot::<Counter>::reconstitute_from_history(id, &history).unwrap();

        assert_eq!(root.state().total, 4);
        assert_eq!(root.version(), Version::new(3));
    }

    #[test]
    fn known_type_with_bad_payload_is_an_error() {
        let id = AggregateId::new();
        let history = vec![stored(id, 1, "CounterCounted", serde_json::json!({"total": "x"}))];

        let result = AggregateRoot::<Counter>::reconstitute_from_history(id, &history);

        assert!(matches!(result, Err(DomainError::UndecodableEvent { .. })));
    }

    #[test]
    fn applying_same_event_twice_is_stable() {
        let mut counter = Counter::default();
        let event = CounterEvent::Counted { total: 3 };
        counter.apply(&event);
        counter.apply(&event);
        assert_eq!(counter.total, 3);
    }
}
