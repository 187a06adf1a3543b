//! PostgreSQL integration tests
//!
//! These tests use a shared PostgreSQL container for efficiency.
//! Run with:
//!
//! ```bash
//! cargo test -p event-store --test postgres_integration -- --test-threads=1
//! ```

use std::sync::Arc;

use event_store::{
    AggregateId, AppendOptions, EventEnvelope, EventQuery, EventStore, EventStoreError,
    EventStoreExt, PostgresEventStore, Version,
};
use sqlx::PgPool;
use testcontainers::{ContainerAsync, runners::AsyncRunner};
use testcontainers_modules::postgres::Postgres;
use tokio::sync::OnceCell;

/// Shared container info - container stays alive for all tests
struct ContainerInfo {
    #[allow(dead_code)] // Container must stay alive for tests
    container: ContainerAsync<Postgres>,
    connection_string: String,
}

static CONTAINER: OnceCell<Arc<ContainerInfo>> = OnceCell::const_new();

async fn get_container_info() -> Arc<ContainerInfo> {
    CONTAINER
        .get_or_init(|| async {
            let container = Postgres::default().start().await.unwrap();

            let host = container.get_host().await.unwrap();
            let port = container.get_host_port_ipv4(5432).await.unwrap();

            let connection_string =
                format!("postgres://postgres:postgres@{}:{}/postgres", host, port);

            let temp_pool = PgPool::connect(&connection_string).await.unwrap();
            sqlx::raw_sql(include_str!(
                "../../../migrations/001_create_stored_events.sql"
            ))
            .execute(&temp_pool)
            .await
            .unwrap();
            temp_pool.close().await;

            Arc::new(ContainerInfo {
                container,
                connection_string,
            })
        })
        .await
        .clone()
}

/// Get a fresh store with its own pool and an emptied log
async fn get_test_store() -> PostgresEventStore {
    let info = get_container_info().await;

    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(5)
        .connect(&info.connection_string)
        .await
        .unwrap();

    // TRUNCATE bypasses the row-level append-only trigger.
    sqlx::query("TRUNCATE TABLE stored_events RESTART IDENTITY")
        .execute(&pool)
        .await
        .unwrap();

    PostgresEventStore::new(pool)
}

fn create_test_event(
    aggregate_id: AggregateId,
    version: Version,
    event_type: &str,
) -> EventEnvelope {
    EventEnvelope::builder()
        .aggregate_id(aggregate_id)
        .aggregate_type("OrderFulfillmentSaga")
        .event_type(event_type)
        .version(version)
        .payload_raw(serde_json::json!({"test": true}))
        .source("postgres-integration")
        .build()
        .unwrap()
}

#[tokio::test]
async fn store_and_replay_in_order() {
    let store = get_test_store().await;
    let aggregate_id = AggregateId::new();

    let events = vec![
        create_test_event(aggregate_id, Version::new(1), "OrderCreated"),
        create_test_event(aggregate_id, Version::new(2), "PrescriptionCreated"),
        create_test_event(aggregate_id, Version::new(3), "InventoryReserved"),
    ];
    let stored = store
        .append(events, AppendOptions::expect_new())
        .await
        .unwrap();
    assert_eq!(stored.len(), 3);
    assert!(stored[0].sequence_id < stored[1].sequence_id);

    let replayed = store.events_for_aggregate(aggregate_id).await.unwrap();
    let types: Vec<_> = replayed.iter().map(|e| e.event_type()).collect();
    assert_eq!(
        types,
        ["OrderCreated", "PrescriptionCreated", "InventoryReserved"]
    );
    assert_eq!(replayed[0].event.source(), Some("postgres-integration"));
}

#[tokio::test]
async fn store_event_returns_sequence_id() {
    let store = get_test_store().await;

    let first = store
        .store_event(create_test_event(AggregateId::new(), Version::first(), "A"))
        .await
        .unwrap();
    let second = store
        .store_event(create_test_event(AggregateId::new(), Version::first(), "B"))
        .await
        .unwrap();

    assert!(second.sequence_id > first.sequence_id);
}

#[tokio::test]
async fn optimistic_concurrency_conflict() {
    let store = get_test_store().await;
    let aggregate_id = AggregateId::new();

    store
        .append(
            vec![create_test_event(aggregate_id, Version::first(), "Event1")],
            AppendOptions::expect_new(),
        )
        .await
        .unwrap();

    let result = store
        .append(
            vec![create_test_event(aggregate_id, Version::new(2), "Event2")],
            AppendOptions::expect_version(Version::initial()),
        )
        .await;

    assert!(matches!(
        result,
        Err(EventStoreError::ConcurrencyConflict { .. })
    ));
}

#[tokio::test]
async fn duplicate_version_maps_to_conflict() {
    let store = get_test_store().await;
    let aggregate_id = AggregateId::new();

    store
        .store_event(create_test_event(aggregate_id, Version::first(), "Event1"))
        .await
        .unwrap();
    let result = store
        .store_event(create_test_event(aggregate_id, Version::first(), "Event1"))
        .await;

    assert!(matches!(
        result,
        Err(EventStoreError::ConcurrencyConflict { .. })
    ));
}

#[tokio::test]
async fn stored_events_reject_updates_and_deletes() {
    let store = get_test_store().await;
    let aggregate_id = AggregateId::new();
    store
        .store_event(create_test_event(aggregate_id, Version::first(), "Event1"))
        .await
        .unwrap();

    let update = sqlx::query("UPDATE stored_events SET event_type = 'Tampered'")
        .execute(store.pool())
        .await;
    assert!(update.is_err());

    let delete = sqlx::query("DELETE FROM stored_events")
        .execute(store.pool())
        .await;
    assert!(delete.is_err());

    assert_eq!(store.events_for_aggregate(aggregate_id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn query_events_with_filters() {
    let store = get_test_store().await;
    let aggregate_id = AggregateId::new();

    let stored = store
        .append(
            vec![
                create_test_event(aggregate_id, Version::new(1), "PaymentAttemptRecorded"),
                create_test_event(aggregate_id, Version::new(2), "RetryScheduled"),
                create_test_event(aggregate_id, Version::new(3), "PaymentAttemptRecorded"),
            ],
            AppendOptions::new(),
        )
        .await
        .unwrap();

    let query = EventQuery::for_aggregate(aggregate_id)
        .event_type("PaymentAttemptRecorded")
        .after_sequence(stored[0].sequence_id);

    let results = store.query_events(query).await.unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].version(), Version::new(3));

    let paged = store
        .query_events(EventQuery::for_aggregate(aggregate_id).offset(1).limit(1))
        .await
        .unwrap();
    assert_eq!(paged.len(), 1);
    assert_eq!(paged[0].event_type(), "RetryScheduled");
}

#[tokio::test]
async fn stream_all_events_in_sequence_order() {
    use futures_util::StreamExt;

    let store = get_test_store().await;
    for _ in 0..3 {
        store
            .store_event(create_test_event(AggregateId::new(), Version::first(), "E"))
            .await
            .unwrap();
    }

    let stream = store.stream_all_events().await.unwrap();
    let events: Vec<_> = stream.collect().await;
    let sequences: Vec<i64> = events
        .into_iter()
        .map(|e| e.unwrap().sequence_id.as_i64())
        .collect();
    assert_eq!(sequences, [1, 2, 3]);
}

#[tokio::test]
async fn aggregate_version_tracks_latest() {
    let store = get_test_store().await;
    let aggregate_id = AggregateId::new();

    assert!(!store.aggregate_exists(aggregate_id).await.unwrap());

    store
        .append(
            vec![
                create_test_event(aggregate_id, Version::new(1), "Event1"),
                create_test_event(aggregate_id, Version::new(2), "Event2"),
            ],
            AppendOptions::new(),
        )
        .await
        .unwrap();

    assert_eq!(
        store.aggregate_version(aggregate_id).await.unwrap(),
        Some(Version::new(2))
    );
}
