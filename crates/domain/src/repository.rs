//! Loading and saving aggregates.

use std::marker::PhantomData;
use std::sync::Arc;

use common::{AggregateId, CorrelationId};
use event_store::{
    AppendOptions, EventEnvelope, EventStore, METADATA_CAUSATION_ID, StoredEvent, Version,
};
use messaging::EventBus;

use crate::aggregate::{Aggregate, AggregateRoot, DomainEvent};
use crate::error::DomainError;

/// Metadata stamped on every event saved in one call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventContext {
    /// Component that produced the events.
    pub source: Option<String>,
    pub correlation_id: Option<CorrelationId>,
    /// Id of the event or job that caused these events.
    pub causation_id: Option<String>,
}

impl EventContext {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: Some(source.into()),
            ..Default::default()
        }
    }

    pub fn with_correlation_id(mut self, id: CorrelationId) -> Self {
        self.correlation_id = Some(id);
        self
    }

    pub fn with_causation_id(mut self, id: impl ToString) -> Self {
        self.causation_id = Some(id.to_string());
        self
    }

    /// A context for events caused by `event`, keeping its correlation id.
    pub fn caused_by(source: impl Into<String>, event: &StoredEvent) -> Self {
        Self {
            source: Some(source.into()),
            correlation_id: event.event.correlation_id(),
            causation_id: Some(event.event.event_id.to_string()),
        }
    }
}

/// Result of command execution.
#[derive(Debug)]
pub struct CommandResult<A: Aggregate> {
    /// The aggregate after the new events were persisted.
    pub aggregate: AggregateRoot<A>,

    /// The durable records of the new events, in order.
    pub events: Vec<StoredEvent>,
}

impl<A: Aggregate> CommandResult<A> {
    pub fn new_version(&self) -> Version {
        self.aggregate.version()
    }
}

/// Event-sourced repository for one aggregate type.
///
/// The repository is responsible for:
/// 1. Loading the aggregate by replaying its history
/// 2. Persisting newly recorded events with a version check
/// 3. Publishing the persisted events on the event bus
pub struct Repository<S, A>
where
    S: EventStore,
    A: Aggregate,
{
    store: S,
    bus: Arc<dyn EventBus>,
    _phantom: PhantomData<A>,
}

impl<S, A> Clone for Repository<S, A>
where
    S: EventStore + Clone,
    A: Aggregate,
{
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            bus: Arc::clone(&self.bus),
            _phantom: PhantomData,
        }
    }
}

impl<S, A> Repository<S, A>
where
    S: EventStore,
    A: Aggregate,
{
    pub fn new(store: S, bus: Arc<dyn EventBus>) -> Self {
        Self {
            store,
            bus,
            _phantom: PhantomData,
        }
    }

    /// Returns a reference to the underlying event store.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Loads an aggregate from its history.
    ///
    /// If the aggregate has no events, returns a new instance.
    pub async fn load(&self, aggregate_id: AggregateId) -> Result<AggregateRoot<A>, DomainError> {
        let history = self.store.events_for_aggregate(aggregate_id).await?;
        AggregateRoot::reconstitute_from_history(aggregate_id, &history)
    }

    /// Loads an aggregate, returning None if it has no events.
    pub async fn load_existing(
        &self,
        aggregate_id: AggregateId,
    ) -> Result<Option<AggregateRoot<A>>, DomainError> {
        let aggregate = self.load(aggregate_id).await?;
        if aggregate.version() == Version::initial() {
            Ok(None)
        } else {
            Ok(Some(aggregate))
        }
    }

    /// Like [`Repository::load_existing`], but a missing aggregate is an error.
    pub async fn get(&self, aggregate_id: AggregateId) -> Result<AggregateRoot<A>, DomainError> {
        self.load_existing(aggregate_id)
            .await?
            .ok_or_else(|| DomainError::AggregateNotFound {
                aggregate_type: A::aggregate_type(),
                aggregate_id: aggregate_id.to_string(),
            })
    }

    /// Returns the stored history of an aggregate.
    pub async fn history(&self, aggregate_id: AggregateId) -> Result<Vec<StoredEvent>, DomainError> {
        Ok(self.store.events_for_aggregate(aggregate_id).await?)
    }

    /// Publishes the aggregate's latest stored event again when its type is
    /// one of `event_types`. Returns the event that was published.
    ///
    /// Used to resume delivery after an append succeeded but publication
    /// failed. Handlers must tolerate the duplicate.
    pub async fn republish_latest(
        &self,
        aggregate_id: AggregateId,
        event_types: &[&str],
    ) -> Result<Option<StoredEvent>, DomainError> {
        let mut history = self.store.events_for_aggregate(aggregate_id).await?;
        let Some(latest) = history.pop() else {
            return Ok(None);
        };
        if latest.aggregate_type() != A::aggregate_type()
            || !event_types.contains(&latest.event_type())
        {
            return Ok(None);
        }

        self.bus.publish(&latest).await?;
        tracing::debug!(
            %aggregate_id,
            event_type = latest.event_type(),
            version = %latest.version(),
            "latest event republished"
        );
        Ok(Some(latest))
    }

    /// Persists the aggregate's pending events, then publishes them.
    ///
    /// The append expects the aggregate to still be at the version it was
    /// loaded at; a concurrent writer makes this fail with a concurrency
    /// conflict and nothing is written. Publication happens only after the
    /// append succeeded.
    #[tracing::instrument(
        skip(self, aggregate, context),
        fields(aggregate_type = A::aggregate_type(), aggregate_id = %aggregate.id())
    )]
    pub async fn save(
        &self,
        aggregate: &mut AggregateRoot<A>,
        context: &EventContext,
    ) -> Result<Vec<StoredEvent>, DomainError> {
        let events = aggregate.release_events();
        if events.is_empty() {
            return Ok(Vec::new());
        }

        let expected_version = aggregate.version();
        let envelopes = build_envelopes::<A>(aggregate.id(), expected_version, &events, context)?;

        let stored = self
            .store
            .append(envelopes, AppendOptions::expect_version(expected_version))
            .await?;

        if let Some(last) = stored.last() {
            aggregate.mark_persisted(last.version());
        }
        metrics::counter!("events_appended_total", "aggregate_type" => A::aggregate_type())
            .increment(stored.len() as u64);
        tracing::debug!(
            count = stored.len(),
            version = %aggregate.version(),
            "events appended"
        );

        self.bus.publish_all(&stored).await?;

        Ok(stored)
    }

    /// Loads the aggregate, runs `decide` against its state, records the
    /// resulting events and saves them.
    ///
    /// The decision receives the current state and returns either a list of
    /// events or an error; on error nothing is written.
    pub async fn execute<E, F>(
        &self,
        aggregate_id: AggregateId,
        context: &EventContext,
        decide: F,
    ) -> Result<CommandResult<A>, E>
    where
        F: FnOnce(&A) -> Result<Vec<A::Event>, E>,
        E: From<DomainError>,
    {
        let mut aggregate = self.load(aggregate_id).await?;
        aggregate.execute(decide)?;
        let events = self.save(&mut aggregate, context).await?;

        Ok(CommandResult { aggregate, events })
    }
}

/// Builds event envelopes from domain events.
fn build_envelopes<A: Aggregate>(
    aggregate_id: AggregateId,
    current_version: Version,
    events: &[A::Event],
    context: &EventContext,
) -> Result<Vec<EventEnvelope>, DomainError> {
    let mut envelopes = Vec::with_capacity(events.len());
    let mut version = current_version;

    for event in events {
        version = version.next();
        let mut builder = EventEnvelope::builder()
            .aggregate_id(aggregate_id)
            .aggregate_type(A::aggregate_type())
            .event_type(event.event_type())
            .version(version)
            .payload(event)?;

        if let Some(source) = &context.source {
            builder = builder.source(source.clone());
        }
        if let Some(correlation_id) = context.correlation_id {
            builder = builder.correlation_id(correlation_id);
        }
        if let Some(causation_id) = &context.causation_id {
            builder = builder.metadata(
                METADATA_CAUSATION_ID,
                serde_json::Value::String(causation_id.clone()),
            );
        }

        envelopes.push(builder.build()?);
    }

    Ok(envelopes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::tests::{Counter, CounterEvent};
    use event_store::{EventStoreExt, InMemoryEventStore};
    use messaging::InMemoryEventBus;

    #[derive(Debug, thiserror::Error)]
    enum TestError {
        #[error("invalid total: {0}")]
        InvalidTotal(u32),
        #[error(transparent)]
        Domain(#[from] DomainError),
    }

    fn repository() -> (
        Repository<InMemoryEventStore, Counter>,
        InMemoryEventStore,
        Arc<InMemoryEventBus>,
    ) {
        let store = InMemoryEventStore::new();
        let bus = Arc::new(InMemoryEventBus::new());
        (Repository::new(store.clone(), bus.clone()), store, bus)
    }

    async fn open(repo: &Repository<InMemoryEventStore, Counter>, id: AggregateId) {
        repo.execute::<TestError, _>(id, &EventContext::new("test"), |_| {
            Ok(vec![CounterEvent::Opened {
                label: "visits".into(),
            }])
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn execute_persists_and_publishes() {
        let (repo, store, bus) = repository();
        let id = AggregateId::new();

        let result = repo
            .execute::<TestError, _>(id, &EventContext::new("test"), |_| {
                Ok(vec![
                    CounterEvent::Opened {
                        label: "visits".into(),
                    },
                    CounterEvent::Counted { total: 1 },
                ])
            })
            .await
            .unwrap();

        assert_eq!(result.events.len(), 2);
        assert_eq!(result.new_version(), Version::new(2));
        assert_eq!(result.aggregate.state().total, 1);
        assert!(result.aggregate.pending_events().is_empty());
        assert_eq!(store.event_count().await, 2);
        assert_eq!(bus.event_count().await, 2);
        assert!(bus.has_event("CounterCounted").await);
    }

    #[tokio::test]
    async fn load_replays_saved_state() {
        let (repo, _, _) = repository();
        let id = AggregateId::new();
        open(&repo, id).await;

        let loaded = repo.load(id).await.unwrap();

        assert_eq!(loaded.state().label.as_deref(), Some("visits"));
        assert_eq!(loaded.version(), Version::first());
    }

    #[tokio::test]
    async fn rejected_command_writes_nothing() {
        let (repo, store, bus) = repository();
        let id = AggregateId::new();

        let result = repo
            .execute(id, &EventContext::default(), |_| Err(TestError::InvalidTotal(0)))
            .await;

        assert!(matches!(result, Err(TestError::InvalidTotal(0))));
        assert_eq!(store.event_count().await, 0);
        assert_eq!(bus.event_count().await, 0);
    }

    #[tokio::test]
    async fn stale_aggregate_fails_with_conflict() {
        let (repo, store, bus) = repository();
        let id = AggregateId::new();
        open(&repo, id).await;

        let mut first = repo.load(id).await.unwrap();
        let mut second = repo.load(id).await.unwrap();

        first.record_that(CounterEvent::Counted { total: 1 });
        repo.save(&mut first, &EventContext::default()).await.unwrap();

        second.record_that(CounterEvent::Counted { total: 5 });
        let err = repo
            .save(&mut second, &EventContext::default())
            .await
            .unwrap_err();

        assert!(err.is_concurrency_conflict());
        assert_eq!(store.event_count().await, 2);
        assert_eq!(bus.event_count().await, 2);
        assert_eq!(repo.load(id).await.unwrap().state().total, 1);
    }

    #[tokio::test]
    async fn save_without_pending_events_is_a_no_op() {
        let (repo, store, _) = repository();
        let mut aggregate = AggregateRoot::<Counter>::new(AggregateId::new());

        let stored = repo
            .save(&mut aggregate, &EventContext::default())
            .await
            .unwrap();

        assert!(stored.is_empty());
        assert_eq!(store.event_count().await, 0);
    }

    #[tokio::test]
    async fn context_is_written_to_metadata() {
        let (repo, store, _) = repository();
        let id = AggregateId::new();
        let correlation_id = CorrelationId::new();

        repo.execute::<TestError, _>(
            id,
            &EventContext::new("counter-service")
                .with_correlation_id(correlation_id)
                .with_causation_id("job-42"),
            |_| Ok(vec![CounterEvent::Counted { total: 2 }]),
        )
        .await
        .unwrap();

        let stored = store.events_for_aggregate(id).await.unwrap();
        let event = &stored[0].event;
        assert_eq!(event.source(), Some("counter-service"));
        assert_eq!(event.correlation_id(), Some(correlation_id));
        assert_eq!(
            event.metadata.get(METADATA_CAUSATION_ID),
            Some(&serde_json::json!("job-42"))
        );

        let next = EventContext::caused_by("follow-up", &stored[0]);
        assert_eq!(next.correlation_id, Some(correlation_id));
        assert_eq!(next.causation_id, Some(event.event_id.to_string()));
    }

    #[tokio::test]
    async fn republish_latest_only_matching_types() {
        let (repo, _, bus) = repository();
        let id = AggregateId::new();
        open(&repo, id).await;
        repo.execute::<TestError, _>(id, &EventContext::default(), |_| {
            Ok(vec![CounterEvent::Counted { total: 3 }])
        })
        .await
        .unwrap();
        assert_eq!(bus.event_count().await, 2);

        assert!(
            repo.republish_latest(id, &["CounterOpened"])
                .await
                .unwrap()
                .is_none()
        );
        assert_eq!(bus.event_count().await, 2);

        let event = repo
            .republish_latest(id, &["CounterCounted"])
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.version(), Version::new(2));
        assert_eq!(bus.events_of_type("CounterCounted").await.len(), 2);
        assert!(
            repo.republish_latest(AggregateId::new(), &["CounterCounted"])
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn get_missing_aggregate_is_not_found() {
        let (repo, store, _) = repository();
        let id = AggregateId::new();

        assert!(matches!(
            repo.get(id).await,
            Err(DomainError::AggregateNotFound { .. })
        ));
        assert!(repo.load_existing(id).await.unwrap().is_none());
        assert!(!store.aggregate_exists(id).await.unwrap());
        assert!(repo.history(id).await.unwrap().is_empty());
    }
}
