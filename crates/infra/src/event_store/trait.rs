use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

use millwright_core::{AggregateId, ExpectedVersion};

/// An event ready to be appended to a stream (not yet assigned a sequence number).
///
/// Events go through this lifecycle:
///
/// 1. **Domain event**: created by an aggregate's `handle()` method
/// 2. **UncommittedEvent**: wrapped with stream metadata
/// 3. **StoredEvent**: persisted with an assigned `sequence_number`
/// 4. **EventEnvelope**: published to the event bus for consumers
///
/// Use [`UncommittedEvent::from_typed`] to build one from a typed domain
/// event; it serializes the payload to JSON and captures the event metadata
/// needed for later deserialization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UncommittedEvent {
    pub event_id: Uuid,
    pub aggregate_id: AggregateId,
    pub aggregate_type: String,

    pub event_type: String,
    pub event_version: u32,
    pub occurred_at: DateTime<Utc>,

    pub payload: JsonValue,
}

/// A stored event in an append-only stream (assigned a sequence number).
///
/// Sequence numbers are assigned by the event store during append and are:
/// - **Monotonically increasing**: each event gets the next number (last + 1)
/// - **Stream-scoped**: per aggregate instance
/// - **Immutable**: once assigned they never change
///
/// They drive ordering, optimistic concurrency checks, and projection
/// idempotency cursors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredEvent {
    pub event_id: Uuid,
    pub aggregate_id: AggregateId,
    pub aggregate_type: String,

    /// Monotonically increasing position in the aggregate stream.
    pub sequence_number: u64,

    pub event_type: String,
    pub event_version: u32,
    pub occurred_at: DateTime<Utc>,

    pub payload: JsonValue,
}

impl StoredEvent {
    pub fn stream_version(&self) -> u64 {
        self.sequence_number
    }

    /// Convert a stored event into an event envelope for publication.
    pub fn to_envelope(&self) -> millwright_events::EventEnvelope<JsonValue> {
        millwright_events::EventEnvelope::new(
            self.event_id,
            self.aggregate_id,
            self.aggregate_type.clone(),
            self.sequence_number,
            self.payload.clone(),
        )
    }
}

/// Event store operation error.
///
/// These are **infrastructure errors** (storage, concurrency) as opposed to
/// domain errors (validation, invariants).
#[derive(Debug, Error)]
pub enum EventStoreError {
    #[error("optimistic concurrency check failed: {0}")]
    Concurrency(String),

    #[error("aggregate type mismatch: {0}")]
    AggregateTypeMismatch(String),

    #[error("invalid append: {0}")]
    InvalidAppend(String),

    #[error("event publication failed: {0}")]
    Publish(String),
}

/// Append-only event store.
///
/// Events are organized into **streams**, one stream per aggregate instance,
/// keyed by `aggregate_id`. Within a stream, events have monotonically
/// increasing sequence numbers (1, 2, 3, ...).
///
/// Implementations must:
/// - enforce optimistic concurrency (check version before append)
/// - assign sequence numbers monotonically (no gaps, no duplicates)
/// - persist a batch atomically (all events or none)
pub trait EventStore: Send + Sync {
    /// Append events to an aggregate stream (append-only).
    ///
    /// Sequence numbers are assigned starting at `current_version + 1`.
    fn append(
        &self,
        events: Vec<UncommittedEvent>,
        expected_version: ExpectedVersion,
    ) -> Result<Vec<StoredEvent>, EventStoreError>;

    /// Load the full stream for an aggregate. Empty if the stream doesn't exist.
    fn load_stream(&self, aggregate_id: AggregateId) -> Result<Vec<StoredEvent>, EventStoreError>;

    /// Load every stored event across all streams, ordered by
    /// `(aggregate_id, sequence_number)`. Used for projection rebuilds and
    /// bootstrap recovery.
    fn load_all(&self) -> Result<Vec<StoredEvent>, EventStoreError>;
}

impl<S> EventStore for Arc<S>
where
    S: EventStore + ?Sized,
{
    fn append(
        &self,
        events: Vec<UncommittedEvent>,
        expected_version: ExpectedVersion,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        (**self).append(events, expected_version)
    }

    fn load_stream(&self, aggregate_id: AggregateId) -> Result<Vec<StoredEvent>, EventStoreError> {
        (**self).load_stream(aggregate_id)
    }

    fn load_all(&self) -> Result<Vec<StoredEvent>, EventStoreError> {
        (**self).load_all()
    }
}

impl UncommittedEvent {
    /// Convenience constructor from a typed domain event.
    ///
    /// Keeps infra decoupled from business, while still capturing event
    /// metadata needed for future deserialization.
    pub fn from_typed<E>(
        aggregate_id: AggregateId,
        aggregate_type: impl Into<String>,
        event_id: Uuid,
        event: &E,
    ) -> Result<Self, EventStoreError>
    where
        E: millwright_events::Event + Serialize,
    {
        let payload = serde_json::to_value(event).map_err(|e| {
            EventStoreError::InvalidAppend(format!("payload serialization failed: {e}"))
        })?;

        Ok(Self {
            event_id,
            aggregate_id,
            aggregate_type: aggregate_type.into(),
            event_type: event.event_type().to_string(),
            event_version: event.version(),
            occurred_at: event.occurred_at(),
            payload,
        })
    }
}
