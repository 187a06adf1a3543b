use std::collections::HashMap;

use async_trait::async_trait;
use sqlx::{PgPool, Row, postgres::PgRow};
use uuid::Uuid;

use crate::{
    AggregateId, EventEnvelope, EventId, EventQuery, EventStoreError, Result, SequenceId,
    StoredEvent, Version,
    store::{AppendOptions, EventStore, EventStream, validate_events_for_append},
};

const SELECT_COLUMNS: &str = "SELECT sequence_id, event_id, aggregate_id, aggregate_type, event_type, version, payload, metadata, occurred_at FROM stored_events";

/// PostgreSQL-backed event store over the `stored_events` table.
#[derive(Clone)]
pub struct PostgresEventStore {
    pool: PgPool,
}

impl PostgresEventStore {
    /// Creates a new PostgreSQL event store.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connects to `database_url` and returns a store over the new pool.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;
        Ok(Self::new(pool))
    }

    /// Gets a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Runs the database migrations.
    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }

    fn row_to_event(row: PgRow) -> Result<StoredEvent> {
        let metadata_json: serde_json::Value = row.try_get("metadata")?;
        let metadata: HashMap<String, serde_json::Value> = serde_json::from_value(metadata_json)?;

        Ok(StoredEvent {
            sequence_id: SequenceId::new(row.try_get("sequence_id")?),
            event: EventEnvelope {
                event_id: EventId::from_uuid(row.try_get::<Uuid, _>("event_id")?),
                event_type: row.try_get("event_type")?,
                aggregate_id: AggregateId::from_uuid(row.try_get::<Uuid, _>("aggregate_id")?),
                aggregate_type: row.try_get("aggregate_type")?,
                version: Version::new(row.try_get("version")?),
                occurred_at: row.try_get("occurred_at")?,
                payload: row.try_get("payload")?,
                metadata,
            },
        })
    }
}

#[async_trait]
impl EventStore for PostgresEventStore {
    async fn append(
        &self,
        events: Vec<EventEnvelope>,
        options: AppendOptions,
    ) -> Result<Vec<StoredEvent>> {
        validate_events_for_append(&events)?;

        let aggregate_id = events[0].aggregate_id;
        let mut tx = self.pool.begin().await?;

        if let Some(expected) = options.expected_version {
            let current_version: Option<i64> = sqlx::query_scalar(
                "SELECT MAX(version) FROM stored_events WHERE aggregate_id = $1",
            )
            .bind(aggregate_id.as_uuid())
            .fetch_one(&mut *tx)
            .await?;

            let actual = Version::new(current_version.unwrap_or(0));
            if actual != expected {
                return Err(EventStoreError::ConcurrencyConflict {
                    aggregate_id,
                    expected,
                    actual,
                });
            }
        }

        let mut stored = Vec::with_capacity(events.len());
        for event in events {
            let metadata_json = serde_json::to_value(&event.metadata)?;

            let sequence_id: i64 = sqlx::query_scalar(
                r#"
                INSERT INTO stored_events (event_id, aggregate_id, aggregate_type, event_type, version, payload, metadata, occurred_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                RETURNING sequence_id
                "#,
            )
            .bind(event.event_id.as_uuid())
            .bind(event.aggregate_id.as_uuid())
            .bind(&event.aggregate_type)
            .bind(&event.event_type)
            .bind(event.version.as_i64())
            .bind(&event.payload)
            .bind(metadata_json)
            .bind(event.occurred_at)
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| {
                if let sqlx::Error::Database(ref db_err) = e
                    && db_err.constraint() == Some("unique_aggregate_version")
                {
                    return EventStoreError::ConcurrencyConflict {
                        aggregate_id,
                        expected: options.expected_version.unwrap_or(Version::initial()),
                        actual: event.version,
                    };
                }
                EventStoreError::Database(e)
            })?;

            stored.push(StoredEvent {
                sequence_id: SequenceId::new(sequence_id),
                event,
            });
        }

        tx.commit().await?;
        Ok(stored)
    }

    async fn events_for_aggregate(&self, aggregate_id: AggregateId) -> Result<Vec<StoredEvent>> {
        let sql = format!(
            "{SELECT_COLUMNS} WHERE aggregate_id = $1 ORDER BY sequence_id ASC, occurred_at ASC"
        );
        let rows = sqlx::query(&sql)
            .bind(aggregate_id.as_uuid())
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(Self::row_to_event).collect()
    }

    async fn query_events(&self, query: EventQuery) -> Result<Vec<StoredEvent>> {
        let mut sql = format!("{SELECT_COLUMNS} WHERE 1=1");
        let mut param_count = 0;

        if query.aggregate_id.is_some() {
            param_count += 1;
            sql.push_str(&format!(" AND aggregate_id = ${param_count}"));
        }
        if query.aggregate_type.is_some() {
            param_count += 1;
            sql.push_str(&format!(" AND aggregate_type = ${param_count}"));
        }
        if query.event_types.is_some() {
            param_count += 1;
            sql.push_str(&format!(" AND event_type = ANY(${param_count})"));
        }
        if query.after_sequence.is_some() {
            param_count += 1;
            sql.push_str(&format!(" AND sequence_id > ${param_count}"));
        }
        if query.from_timestamp.is_some() {
            param_count += 1;
            sql.push_str(&format!(" AND occurred_at >= ${param_count}"));
        }
        if query.to_timestamp.is_some() {
            param_count += 1;
            sql.push_str(&format!(" AND occurred_at <= ${param_count}"));
        }

        sql.push_str(" ORDER BY sequence_id ASC, occurred_at ASC");

        if query.limit.is_some() {
            param_count += 1;
            sql.push_str(&format!(" LIMIT ${param_count}"));
        }
        if query.offset.is_some() {
            param_count += 1;
            sql.push_str(&format!(" OFFSET ${param_count}"));
        }

        let mut sqlx_query = sqlx::query(&sql);

        if let Some(id) = query.aggregate_id {
            sqlx_query = sqlx_query.bind(id.as_uuid());
        }
        if let Some(agg_type) = query.aggregate_type {
            sqlx_query = sqlx_query.bind(agg_type);
        }
        if let Some(event_types) = query.event_types {
            sqlx_query = sqlx_query.bind(event_types);
        }
        if let Some(after) = query.after_sequence {
            sqlx_query = sqlx_query.bind(after.as_i64());
        }
        if let Some(from_ts) = query.from_timestamp {
            sqlx_query = sqlx_query.bind(from_ts);
        }
        if let Some(to_ts) = query.to_timestamp {
            sqlx_query = sqlx_query.bind(to_ts);
        }
        if let Some(limit) = query.limit {
            sqlx_query = sqlx_query.bind(limit as i64);
        }
        if let Some(offset) = query.offset {
            sqlx_query = sqlx_query.bind(offset as i64);
        }

        let rows = sqlx_query.fetch_all(&self.pool).await?;
        rows.into_iter().map(Self::row_to_event).collect()
    }

    async fn events_by_type(&self, event_type: &str) -> Result<Vec<StoredEvent>> {
        let sql = format!("{SELECT_COLUMNS} WHERE event_type = $1 ORDER BY sequence_id ASC");
        let rows = sqlx::query(&sql)
            .bind(event_type)
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(Self::row_to_event).collect()
    }

    async fn stream_all_events(&self) -> Result<EventStream> {
        use futures_util::StreamExt;

        // The stream outlives this call, so it borrows a cloned pool and an owned query string.
        let pool = self.pool.clone();
        let sql = format!("{SELECT_COLUMNS} ORDER BY sequence_id ASC");

        let stream = async_stream_rows(pool, sql).map(|result| match result {
            Ok(row) => Self::row_to_event(row),
            Err(e) => Err(EventStoreError::Database(e)),
        });

        Ok(Box::pin(stream))
    }

    async fn aggregate_version(&self, aggregate_id: AggregateId) -> Result<Option<Version>> {
        let version: Option<i64> =
            sqlx::query_scalar("SELECT MAX(version) FROM stored_events WHERE aggregate_id = $1")
                .bind(aggregate_id.as_uuid())
                .fetch_one(&self.pool)
                .await?;

        Ok(version.map(Version::new))
    }
}

/// Fetches rows one page at a time so the returned stream owns everything it uses.
fn async_stream_rows(
    pool: PgPool,
    sql: String,
) -> impl futures_core::Stream<Item = std::result::Result<PgRow, sqlx::Error>> + Send {
    const PAGE_SIZE: i64 = 500;

    futures_util::stream::unfold(
        (pool, sql, 0_i64, Vec::<PgRow>::new(), false),
        |(pool, sql, offset, mut buffer, exhausted)| async move {
            if buffer.is_empty() {
                if exhausted {
                    return None;
                }
                let page = format!("{sql} LIMIT {PAGE_SIZE} OFFSET {offset}");
                match sqlx::query(&page).fetch_all(&pool).await {
                    Ok(rows) => {
                        let exhausted = (rows.len() as i64) < PAGE_SIZE;
                        buffer = rows;
                        buffer.reverse();
                        let next_offset = offset + buffer.len() as i64;
                        let row = buffer.pop()?;
                        Some((Ok(row), (pool, sql, next_offset, buffer, exhausted)))
                    }
                    Err(e) => Some((Err(e), (pool, sql, offset, Vec::new(), true))),
                }
            } else {
                let row = buffer.pop()?;
                Some((Ok(row), (pool, sql, offset, buffer, exhausted)))
            }
        },
    )
}
