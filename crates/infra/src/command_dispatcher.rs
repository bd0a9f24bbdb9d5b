//! Command execution pipeline (application-level orchestration).
//!
//! The `CommandDispatcher` implements this pipeline for every aggregate:
//!
//! ```text
//! Command
//!   ↓
//! 1. Load events from store
//!   ↓
//! 2. Rehydrate aggregate (apply historical events to rebuild state)
//!   ↓
//! 3. Handle command (pure decision logic, produces events)
//!   ↓
//! 4. Persist events to store (append-only, optimistic concurrency check)
//!   ↓
//! 5. Publish events to bus (for projections and other consumers)
//! ```
//!
//! Events are persisted before publication: if the append fails, nothing is
//! published. If publication fails after a successful append, the error is
//! surfaced but the events are already durable, giving **at-least-once**
//! delivery (consumers must be idempotent).
//!
//! This module contains no IO itself; it composes the `EventStore` and
//! `EventBus` traits.

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use thiserror::Error;
use uuid::Uuid;

use millwright_core::{Aggregate, AggregateId, DomainError, ExpectedVersion};
use millwright_events::{EventBus, EventEnvelope};

use crate::event_store::{EventStore, EventStoreError, StoredEvent, UncommittedEvent};

#[derive(Debug, Error)]
pub enum DispatchError {
    /// Optimistic concurrency failure (stale stream version). Retryable:
    /// reload and re-execute the command.
    #[error("optimistic concurrency conflict: {0}")]
    Concurrency(String),
    /// Deterministic domain rejection (validation, invalid state, stock
    /// shortfall, ...). Retrying without changing inputs will fail again.
    #[error(transparent)]
    Domain(DomainError),
    /// Failed to deserialize historical event payloads into the aggregate
    /// event type.
    #[error("event deserialization failed: {0}")]
    Deserialize(String),
    /// Persisting to the event store failed. Nothing was appended.
    #[error(transparent)]
    Store(EventStoreError),
    /// Publication failed after a successful append (at-least-once; retry may
    /// duplicate). The events are durable despite this error.
    #[error("event publication failed: {0}")]
    Publish(String),
}

impl DispatchError {
    /// Whether the failure happened before anything was appended.
    ///
    /// A [`DispatchError::Publish`] is the one post-append failure: the
    /// events are already durable and callers must not run compensating
    /// actions for them.
    pub fn failed_before_append(&self) -> bool {
        !matches!(self, DispatchError::Publish(_))
    }
}

impl From<EventStoreError> for DispatchError {
    fn from(value: EventStoreError) -> Self {
        match &value {
            EventStoreError::Concurrency(msg) => DispatchError::Concurrency(msg.clone()),
            _ => DispatchError::Store(value),
        }
    }
}

impl From<DomainError> for DispatchError {
    fn from(value: DomainError) -> Self {
        DispatchError::Domain(value)
    }
}

impl DispatchError {
    /// Collapse into a domain error for callers that only speak the domain
    /// taxonomy. Infrastructure failures surface as conflicts.
    pub fn into_domain(self) -> DomainError {
        match self {
            DispatchError::Domain(e) => e,
            DispatchError::Concurrency(msg) => DomainError::conflict(msg),
            DispatchError::Deserialize(msg) => {
                DomainError::conflict(format!("event deserialization failed: {msg}"))
            }
            DispatchError::Store(e) => DomainError::conflict(format!("event store failure: {e}")),
            DispatchError::Publish(msg) => {
                DomainError::conflict(format!("event publication failed: {msg}"))
            }
        }
    }
}

/// Reusable command execution engine for event-sourced aggregates.
///
/// Sits between application services and the infrastructure layer, providing
/// a consistent execution model for all commands while keeping domain code
/// pure and testable.
///
/// Concurrency control is optimistic: the stream version observed at load
/// time is expected at append time, and a concurrent writer causes
/// [`DispatchError::Concurrency`]. Callers retry by re-dispatching (the
/// pipeline reloads on every call) or surface a conflict.
///
/// Generic over store `S` and bus `B`, so tests run against the in-memory
/// implementations and production wiring swaps in Postgres without touching
/// domain code.
#[derive(Debug)]
pub struct CommandDispatcher<S, B> {
    store: S,
    bus: B,
}

impl<S, B> CommandDispatcher<S, B> {
    pub fn new(store: S, bus: B) -> Self {
        Self { store, bus }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn into_parts(self) -> (S, B) {
        (self.store, self.bus)
    }
}

impl<S, B> CommandDispatcher<S, B>
where
    S: EventStore,
    B: EventBus<EventEnvelope<JsonValue>>,
{
    /// Dispatch a command through the full event-sourcing pipeline.
    ///
    /// The `make_aggregate` closure creates the empty aggregate instance to
    /// rehydrate (e.g. `ProductionOrder::empty(id)`), keeping the dispatcher
    /// generic over aggregate construction.
    ///
    /// Returns the committed `StoredEvent`s (with assigned sequence numbers),
    /// or an empty vector when the command decided no events.
    pub fn dispatch<A>(
        &self,
        aggregate_id: AggregateId,
        aggregate_type: impl Into<String>,
        command: A::Command,
        make_aggregate: impl FnOnce(AggregateId) -> A,
    ) -> Result<Vec<StoredEvent>, DispatchError>
    where
        A: Aggregate<Error = DomainError>,
        A::Event: millwright_events::Event + Serialize + DeserializeOwned,
    {
        // 1) Load history
        let history = self.store.load_stream(aggregate_id)?;
        validate_loaded_stream(aggregate_id, &history)?;
        let expected = ExpectedVersion::Exact(stream_version(&history));

        // 2) Rehydrate aggregate
        let mut aggregate = make_aggregate(aggregate_id);
        apply_history::<A>(&mut aggregate, &history)?;

        // 3) Decide events (no mutation)
        let decided = aggregate.handle(&command).map_err(DispatchError::from)?;
        if decided.is_empty() {
            return Ok(vec![]);
        }

        // 4) Persist (append-only, optimistic)
        let aggregate_type = aggregate_type.into();
        let uncommitted = decided
            .iter()
            .map(|ev| {
                UncommittedEvent::from_typed(
                    aggregate_id,
                    aggregate_type.clone(),
                    Uuid::now_v7(),
                    ev,
                )
            })
            .collect::<Result<Vec<_>, _>>()?;

        let committed = self.store.append(uncommitted, expected)?;

        // 5) Publish committed events (after append)
        for stored in &committed {
            self.bus
                .publish(stored.to_envelope())
                .map_err(|e| DispatchError::Publish(format!("{e:?}")))?;
        }

        Ok(committed)
    }

    /// Rehydrate an aggregate from its stream without dispatching a command.
    ///
    /// Application services use this for authoritative reads (state checks
    /// that must not race against the disposable read models).
    pub fn load_aggregate<A>(
        &self,
        aggregate_id: AggregateId,
        make_aggregate: impl FnOnce(AggregateId) -> A,
    ) -> Result<A, DispatchError>
    where
        A: Aggregate,
        A::Event: DeserializeOwned,
    {
        let history = self.store.load_stream(aggregate_id)?;
        validate_loaded_stream(aggregate_id, &history)?;

        let mut aggregate = make_aggregate(aggregate_id);
        apply_history::<A>(&mut aggregate, &history)?;
        Ok(aggregate)
    }
}

fn stream_version(stream: &[StoredEvent]) -> u64 {
    stream.last().map(|e| e.sequence_number).unwrap_or(0)
}

fn validate_loaded_stream(
    aggregate_id: AggregateId,
    stream: &[StoredEvent],
) -> Result<(), DispatchError> {
    // Ensure the stream belongs to the requested aggregate and is
    // monotonically increasing by sequence number, even if the backend is
    // buggy.
    let mut last = 0u64;
    for (idx, e) in stream.iter().enumerate() {
        if e.aggregate_id != aggregate_id {
            return Err(DispatchError::Store(EventStoreError::InvalidAppend(
                format!("loaded stream contains wrong aggregate_id at index {idx}"),
            )));
        }
        if e.sequence_number == 0 {
            return Err(DispatchError::Store(EventStoreError::InvalidAppend(
                "stored event has sequence_number=0".to_string(),
            )));
        }
        if e.sequence_number <= last {
            return Err(DispatchError::Store(EventStoreError::InvalidAppend(
                format!(
                    "non-monotonic sequence_number in loaded stream (last={last}, found={})",
                    e.sequence_number
                ),
            )));
        }
        last = e.sequence_number;
    }
    Ok(())
}

fn apply_history<A>(aggregate: &mut A, history: &[StoredEvent]) -> Result<(), DispatchError>
where
    A: Aggregate,
    A::Event: DeserializeOwned,
{
    // Ensure deterministic ordering.
    let mut sorted = history.to_vec();
    sorted.sort_by_key(|e| e.sequence_number);

    for stored in sorted {
        let ev: A::Event = serde_json::from_value(stored.payload)
            .map_err(|e| DispatchError::Deserialize(e.to_string()))?;
        aggregate.apply(&ev);
    }

    Ok(())
}
