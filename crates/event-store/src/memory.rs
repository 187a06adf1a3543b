use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::{
    AggregateId, EventEnvelope, EventQuery, EventStoreError, Result, SequenceId, StoredEvent,
    Version,
    store::{AppendOptions, EventStore, EventStream, validate_events_for_append},
};

#[derive(Debug, Default)]
struct Log {
    events: Vec<StoredEvent>,
    last_sequence: SequenceId,
}

impl Log {
    fn current_version(&self, aggregate_id: AggregateId) -> Version {
        self.events
            .iter()
            .filter(|e| e.event.aggregate_id == aggregate_id)
            .map(|e| e.event.version)
            .max()
            .unwrap_or(Version::initial())
    }
}

/// In-memory event store.
///
/// Keeps the log in insertion order, so sequence ids double as vector order.
/// Used by tests and by the server when no database is configured.
#[derive(Clone, Default)]
pub struct InMemoryEventStore {
    log: Arc<RwLock<Log>>,
}

impl InMemoryEventStore {
    /// Creates a new empty in-memory event store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the total number of events stored.
    pub async fn event_count(&self) -> usize {
        self.log.read().await.events.len()
    }
}

fn sort_for_replay(events: &mut [StoredEvent]) {
    events.sort_by(|a, b| {
        a.sequence_id
            .cmp(&b.sequence_id)
            .then(a.event.occurred_at.cmp(&b.event.occurred_at))
    });
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn append(
        &self,
        events: Vec<EventEnvelope>,
        options: AppendOptions,
    ) -> Result<Vec<StoredEvent>> {
        validate_events_for_append(&events)?;

        let aggregate_id = events[0].aggregate_id;
        let first_new_version = events[0].version;

        let mut log = self.log.write().await;
        let current_version = log.current_version(aggregate_id);

        if let Some(expected) = options.expected_version
            && current_version != expected
        {
            return Err(EventStoreError::ConcurrencyConflict {
                aggregate_id,
                expected,
                actual: current_version,
            });
        }

        // Mirrors the (aggregate_id, version) unique constraint of the SQL schema.
        if first_new_version <= current_version {
            return Err(EventStoreError::ConcurrencyConflict {
                aggregate_id,
                expected: options.expected_version.unwrap_or(current_version),
                actual: current_version,
            });
        }

        let mut stored = Vec::with_capacity(events.len());
        for event in events {
            log.last_sequence = log.last_sequence.next();
            stored.push(StoredEvent {
                sequence_id: log.last_sequence,
                event,
            });
        }
        log.events.extend(stored.iter().cloned());

        Ok(stored)
    }

    async fn events_for_aggregate(&self, aggregate_id: AggregateId) -> Result<Vec<StoredEvent>> {
        let log = self.log.read().await;
        let mut events: Vec<_> = log
            .events
            .iter()
            .filter(|e| e.event.aggregate_id == aggregate_id)
            .cloned()
            .collect();
        sort_for_replay(&mut events);
        Ok(events)
    }

    async fn query_events(&self, query: EventQuery) -> Result<Vec<StoredEvent>> {
        let log = self.log.read().await;
        let mut events: Vec<_> = log
            .events
            .iter()
            .filter(|e| {
                if let Some(id) = query.aggregate_id
                    && e.event.aggregate_id != id
                {
                    return false;
                }
                if let Some(ref agg_type) = query.aggregate_type
                    && &e.event.aggregate_type != agg_type
                {
                    return false;
                }
                if let Some(ref types) = query.event_types
                    && !types.contains(&e.event.event_type)
                {
                    return false;
                }
                if let Some(after) = query.after_sequence
                    && e.sequence_id <= after
                {
                    return false;
                }
                if let Some(from) = query.from_timestamp
                    && e.event.occurred_at < from
                {
                    return false;
                }
                if let Some(to) = query.to_timestamp
                    && e.event.occurred_at > to
                {
                    return false;
                }
                true
            })
            .cloned()
            .collect();
        sort_for_replay(&mut events);

        let offset = query.offset.unwrap_or(0);
        let limit = query.limit.unwrap_or(usize::MAX);
        Ok(events.into_iter().skip(offset).take(limit).collect())
    }

    async fn events_by_type(&self, event_type: &str) -> Result<Vec<StoredEvent>> {
        self.query_events(EventQuery::new().event_type(event_type))
            .await
    }

    async fn stream_all_events(&self) -> Result<EventStream> {
        use futures_util::stream;

        let mut events = self.log.read().await.events.clone();
        sort_for_replay(&mut events);

        let stream = stream::iter(events.into_iter().map(Ok));
        Ok(Box::pin(stream))
    }

    async fn aggregate_version(&self, aggregate_id: AggregateId) -> Result<Option<Version>> {
        let log = self.log.read().await;
        let version = log
            .events
            .iter()
            .filter(|e| e.event.aggregate_id == aggregate_id)
            .map(|e| e.event.version)
            .max();
        Ok(version)
    }
}
