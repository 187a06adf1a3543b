use std::pin::Pin;

use async_trait::async_trait;
use futures_core::Stream;

use crate::{AggregateId, EventEnvelope, EventQuery, EventStoreError, Result, StoredEvent, Version};

/// Options for appending events to the store.
#[derive(Debug, Clone, Default)]
pub struct AppendOptions {
    /// Expected current version of the aggregate.
    /// If None, no version check is performed.
    pub expected_version: Option<Version>,
}

impl AppendOptions {
    /// Creates options with no version check.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates options expecting the aggregate to be at a specific version.
    pub fn expect_version(version: Version) -> Self {
        Self {
            expected_version: Some(version),
        }
    }

    /// Creates options expecting the aggregate to have no events yet.
    pub fn expect_new() -> Self {
        Self {
            expected_version: Some(Version::initial()),
        }
    }
}

/// A stream of stored events.
pub type EventStream = Pin<Box<dyn Stream<Item = Result<StoredEvent>> + Send>>;

/// Append-only event log.
///
/// There is deliberately no update or delete operation: stored events are the
/// only durable source of truth and are kept for audit.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Appends a batch of events for one aggregate.
    ///
    /// The batch is atomic. If `options.expected_version` is set and does not
    /// match the aggregate's current version, fails with `ConcurrencyConflict`
    /// and nothing is written. Returns the durable records in append order.
    async fn append(
        &self,
        events: Vec<EventEnvelope>,
        options: AppendOptions,
    ) -> Result<Vec<StoredEvent>>;

    /// Returns every event of one aggregate, ordered by sequence id and then
    /// by occurrence time.
    async fn events_for_aggregate(&self, aggregate_id: AggregateId) -> Result<Vec<StoredEvent>>;

    /// Returns events matching a query.
    async fn query_events(&self, query: EventQuery) -> Result<Vec<StoredEvent>>;

    /// Returns events of one type in sequence order.
    async fn events_by_type(&self, event_type: &str) -> Result<Vec<StoredEvent>>;

    /// Streams the whole log in sequence order.
    async fn stream_all_events(&self) -> Result<EventStream>;

    /// Returns the current version of an aggregate, or None if it has no events.
    async fn aggregate_version(&self, aggregate_id: AggregateId) -> Result<Option<Version>>;
}

/// Convenience methods available on every event store.
#[async_trait]
pub trait EventStoreExt: EventStore {
    /// Persists a single event and returns its durable record.
    async fn store_event(&self, event: EventEnvelope) -> Result<StoredEvent> {
        let aggregate_id = event.aggregate_id;
        self.append(vec![event], AppendOptions::new())
            .await?
            .pop()
            .ok_or_else(|| {
                EventStoreError::InvalidAppend(format!(
                    "store returned no record for aggregate {aggregate_id}"
                ))
            })
    }

    /// Checks if an aggregate has any events.
    async fn aggregate_exists(&self, aggregate_id: AggregateId) -> Result<bool> {
        Ok(self.aggregate_version(aggregate_id).await?.is_some())
    }
}

impl<T: EventStore + ?Sized> EventStoreExt for T {}

/// Lets a shared handle (including `Arc<dyn EventStore>`) stand in for a store.
#[async_trait]
impl<T: EventStore + ?Sized> EventStore for std::sync::Arc<T> {
    async fn append(
        &self,
        events: Vec<EventEnvelope>,
        options: AppendOptions,
    ) -> Result<Vec<StoredEvent>> {
        (**self).append(events, options).await
    }

    async fn events_for_aggregate(&self, aggregate_id: AggregateId) -> Result<Vec<StoredEvent>> {
        (**self).events_for_aggregate(aggregate_id).await
    }

    async fn query_events(&self, query: EventQuery) -> Result<Vec<StoredEvent>> {
        (**self).query_events(query).await
    }

    async fn events_by_type(&self, event_type: &str) -> Result<Vec<StoredEvent>> {
        (**self).events_by_type(event_type).await
    }

    async fn stream_all_events(&self) -> Result<EventStream> {
        (**self).stream_all_events().await
    }

    async fn aggregate_version(&self, aggregate_id: AggregateId) -> Result<Option<Version>> {
        (**self).aggregate_version(aggregate_id).await
    }
}

/// Validates a batch before appending.
///
/// The batch must be non-empty, target a single aggregate and carry
/// consecutive versions.
pub fn validate_events_for_append(events: &[EventEnvelope]) -> Result<()> {
    let Some(first) = events.first() else {
        return Err(EventStoreError::InvalidAppend(
            "cannot append an empty event list".to_string(),
        ));
    };

    let mut expected_version = first.version;
    for event in events.iter().skip(1) {
        if event.aggregate_id != first.aggregate_id {
            return Err(EventStoreError::InvalidAppend(
                "all events must belong to the same aggregate".to_string(),
            ));
        }
        if event.aggregate_type != first.aggregate_type {
            return Err(EventStoreError::InvalidAppend(
                "all events must have the same aggregate type".to_string(),
            ));
        }
        expected_version = expected_version.next();
        if event.version != expected_version {
            return Err(EventStoreError::InvalidAppend(format!(
                "event versions must be sequential: expected {expected_version}, got {}",
                event.version
            )));
        }
    }

    Ok(())
}
