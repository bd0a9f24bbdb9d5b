//! Postgres-backed event store.
//!
//! Persists events in an append-only `events` table with optimistic
//! concurrency enforced both by an explicit version check and by the unique
//! constraint on `(aggregate_id, sequence_number)` (a concurrent append
//! surfaces as a `23505` unique violation, mapped to
//! [`EventStoreError::Concurrency`]).
//!
//! The [`EventStore`] trait is synchronous; this implementation bridges to
//! sqlx through the ambient tokio runtime handle. The bridge uses `block_on`,
//! which panics when invoked from a runtime worker thread: drive the sync
//! trait from a dedicated thread (or via `spawn_blocking`), or call the
//! `*_async` methods directly when already inside the runtime.

use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool, Postgres, Row, Transaction};
use std::sync::Arc;
use tracing::instrument;

use millwright_core::{AggregateId, ExpectedVersion};

use super::r#trait::{EventStore, EventStoreError, StoredEvent, UncommittedEvent};

/// Postgres-backed append-only event store.
///
/// Uses the sqlx connection pool, which is thread-safe and shareable across
/// threads. All appends run inside a transaction for atomicity.
#[derive(Debug, Clone)]
pub struct PostgresEventStore {
    pool: Arc<PgPool>,
}

impl PostgresEventStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Create the `events` table if it does not exist yet.
    pub async fn ensure_schema(&self) -> Result<(), EventStoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS events (
                event_id UUID PRIMARY KEY,
                aggregate_id UUID NOT NULL,
                aggregate_type TEXT NOT NULL,
                sequence_number BIGINT NOT NULL CHECK (sequence_number > 0),
                event_type TEXT NOT NULL,
                event_version INT NOT NULL,
                occurred_at TIMESTAMPTZ NOT NULL,
                payload JSONB NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                UNIQUE (aggregate_id, sequence_number)
            )
            "#,
        )
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("ensure_schema", e))?;

        Ok(())
    }

    /// Load all events for an aggregate stream, in sequence number order.
    #[instrument(skip(self), fields(aggregate_id = %aggregate_id), err)]
    pub async fn load_stream_async(
        &self,
        aggregate_id: AggregateId,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        let rows = sqlx::query(
            r#"
            SELECT
                event_id,
                aggregate_id,
                aggregate_type,
                sequence_number,
                event_type,
                event_version,
                occurred_at,
                payload
            FROM events
            WHERE aggregate_id = $1
            ORDER BY sequence_number ASC
            "#,
        )
        .bind(aggregate_id.as_uuid())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("load_stream", e))?;

        rows_to_events(rows)
    }

    /// Load every stored event across all streams.
    #[instrument(skip(self), err)]
    pub async fn load_all_async(&self) -> Result<Vec<StoredEvent>, EventStoreError> {
        let rows = sqlx::query(
            r#"
            SELECT
                event_id,
                aggregate_id,
                aggregate_type,
                sequence_number,
                event_type,
                event_version,
                occurred_at,
                payload
            FROM events
            ORDER BY aggregate_id ASC, sequence_number ASC
            "#,
        )
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("load_all", e))?;

        rows_to_events(rows)
    }

    /// Append events to a stream with optimistic concurrency control.
    ///
    /// Checks the current stream version inside a transaction, validates it
    /// against `expected_version`, inserts all events, and commits. A
    /// concurrent committer trips the unique constraint and maps to
    /// `Concurrency`.
    #[instrument(
        skip(self, events),
        fields(
            aggregate_id = %aggregate_id,
            event_count = events.len(),
            expected_version = ?expected_version
        ),
        err
    )]
    pub async fn append_events(
        &self,
        aggregate_id: AggregateId,
        events: Vec<UncommittedEvent>,
        expected_version: ExpectedVersion,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        if events.is_empty() {
            return Ok(vec![]);
        }

        for (idx, e) in events.iter().enumerate() {
            if e.aggregate_id != aggregate_id {
                return Err(EventStoreError::InvalidAppend(format!(
                    "batch contains multiple aggregate_ids (index {idx})"
                )));
            }
        }

        let aggregate_type = events[0].aggregate_type.clone();

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let (current_version, existing_type) = check_stream_version(&mut tx, aggregate_id).await?;

        if let Some(ref existing) = existing_type {
            if existing != &aggregate_type {
                tx.rollback()
                    .await
                    .map_err(|e| map_sqlx_error("rollback", e))?;
                return Err(EventStoreError::AggregateTypeMismatch(format!(
                    "stream aggregate_type is '{existing}', attempted append with '{aggregate_type}'"
                )));
            }
        }

        if !expected_version.matches(current_version) {
            tx.rollback()
                .await
                .map_err(|e| map_sqlx_error("rollback", e))?;
            return Err(EventStoreError::Concurrency(format!(
                "expected {expected_version:?}, found {current_version}"
            )));
        }

        let mut stored_events = Vec::with_capacity(events.len());
        let mut next_sequence = current_version + 1;

        for event in events {
            sqlx::query(
                r#"
                INSERT INTO events (
                    event_id,
                    aggregate_id,
                    aggregate_type,
                    sequence_number,
                    event_type,
                    event_version,
                    occurred_at,
                    payload
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                "#,
            )
            .bind(event.event_id)
            .bind(aggregate_id.as_uuid())
            .bind(&aggregate_type)
            .bind(next_sequence as i64)
            .bind(&event.event_type)
            .bind(event.event_version as i32)
            .bind(event.occurred_at)
            .bind(&event.payload)
            .execute(&mut *tx)
            .await
            .map_err(|e| {
                if is_unique_violation(&e) {
                    EventStoreError::Concurrency(format!(
                        "concurrent append detected: sequence_number {next_sequence} already exists"
                    ))
                } else {
                    map_sqlx_error("insert_event", e)
                }
            })?;

            let stored = StoredEvent {
                event_id: event.event_id,
                aggregate_id: event.aggregate_id,
                aggregate_type: event.aggregate_type,
                sequence_number: next_sequence,
                event_type: event.event_type,
                event_version: event.event_version,
                occurred_at: event.occurred_at,
                payload: event.payload,
            };
            stored_events.push(stored);
            next_sequence += 1;
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;

        Ok(stored_events)
    }
}

/// Current version of a stream: `(version, aggregate_type)`, both zero/None
/// if the stream doesn't exist.
async fn check_stream_version(
    tx: &mut Transaction<'_, Postgres>,
    aggregate_id: AggregateId,
) -> Result<(u64, Option<String>), EventStoreError> {
    let row = sqlx::query(
        r#"
        SELECT
            COALESCE(MAX(sequence_number), 0) as current_version,
            MAX(aggregate_type) as aggregate_type
        FROM events
        WHERE aggregate_id = $1
        "#,
    )
    .bind(aggregate_id.as_uuid())
    .fetch_one(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("check_stream_version", e))?;

    let current_version: Option<i64> = row.try_get("current_version").map_err(|e| {
        EventStoreError::InvalidAppend(format!("failed to read current_version: {e}"))
    })?;
    let aggregate_type: Option<String> = row.try_get("aggregate_type").map_err(|e| {
        EventStoreError::InvalidAppend(format!("failed to read aggregate_type: {e}"))
    })?;

    Ok((current_version.unwrap_or(0) as u64, aggregate_type))
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> EventStoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some("23505") => EventStoreError::Concurrency(msg),
                _ => EventStoreError::InvalidAppend(msg),
            }
        }
        sqlx::Error::PoolClosed => {
            EventStoreError::InvalidAppend(format!("connection pool closed in {operation}"))
        }
        _ => EventStoreError::InvalidAppend(format!("sqlx error in {operation}: {err}")),
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        if let Some(code) = db_err.code() {
            return code.as_ref() == "23505";
        }
    }
    false
}

#[derive(Debug)]
struct StoredEventRow {
    event_id: uuid::Uuid,
    aggregate_id: uuid::Uuid,
    aggregate_type: String,
    sequence_number: i64,
    event_type: String,
    event_version: i32,
    occurred_at: DateTime<Utc>,
    payload: serde_json::Value,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for StoredEventRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(StoredEventRow {
            event_id: row.try_get("event_id")?,
            aggregate_id: row.try_get("aggregate_id")?,
            aggregate_type: row.try_get("aggregate_type")?,
            sequence_number: row.try_get("sequence_number")?,
            event_type: row.try_get("event_type")?,
            event_version: row.try_get("event_version")?,
            occurred_at: row.try_get("occurred_at")?,
            payload: row.try_get("payload")?,
        })
    }
}

impl From<StoredEventRow> for StoredEvent {
    fn from(row: StoredEventRow) -> Self {
        StoredEvent {
            event_id: row.event_id,
            aggregate_id: AggregateId::from_uuid(row.aggregate_id),
            aggregate_type: row.aggregate_type,
            sequence_number: row.sequence_number as u64,
            event_type: row.event_type,
            event_version: row.event_version as u32,
            occurred_at: row.occurred_at,
            payload: row.payload,
        }
    }
}

fn rows_to_events(rows: Vec<sqlx::postgres::PgRow>) -> Result<Vec<StoredEvent>, EventStoreError> {
    let mut stored_events = Vec::with_capacity(rows.len());
    for row in rows {
        let stored = StoredEventRow::from_row(&row).map_err(|e| {
            EventStoreError::InvalidAppend(format!("failed to deserialize event row: {e}"))
        })?;
        stored_events.push(stored.into());
    }
    Ok(stored_events)
}

// The sync trait bridges to the async pool through the ambient tokio runtime.
// `block_on` on the returned handle panics on a runtime worker thread; the
// sync methods are for threads outside the runtime (see module docs).

fn runtime_handle() -> Result<tokio::runtime::Handle, EventStoreError> {
    tokio::runtime::Handle::try_current().map_err(|_| {
        EventStoreError::InvalidAppend(
            "PostgresEventStore requires a tokio runtime context".to_string(),
        )
    })
}

impl EventStore for PostgresEventStore {
    fn append(
        &self,
        events: Vec<UncommittedEvent>,
        expected_version: ExpectedVersion,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        if events.is_empty() {
            return Ok(vec![]);
        }
        let aggregate_id = events[0].aggregate_id;
        runtime_handle()?.block_on(self.append_events(aggregate_id, events, expected_version))
    }

    fn load_stream(&self, aggregate_id: AggregateId) -> Result<Vec<StoredEvent>, EventStoreError> {
        runtime_handle()?.block_on(self.load_stream_async(aggregate_id))
    }

    fn load_all(&self) -> Result<Vec<StoredEvent>, EventStoreError> {
        runtime_handle()?.block_on(self.load_all_async())
    }
}
