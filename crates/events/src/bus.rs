//! Event publishing/subscription abstraction (mechanics only).
//!
//! The bus is the **transport layer** for events after they have been
//! persisted to the event store:
//!
//! ```text
//! Command → Event Store (append events) → Event Bus (publish) → Consumers
//!                                                                 └─ Projections
//! ```
//!
//! Events are stored first, then published; if publication fails the events
//! are still in the store and can be republished. Delivery is at-least-once,
//! so consumers must be idempotent.

use std::sync::Arc;
use std::sync::mpsc::Receiver;
use std::time::Duration;

/// A subscription to an event stream.
///
/// Each subscription gets a copy of all events published to the bus
/// (broadcast semantics). Subscriptions are designed for single-threaded
/// consumption.
#[derive(Debug)]
pub struct Subscription<M> {
    receiver: Receiver<M>,
}

impl<M> Subscription<M> {
    pub fn new(receiver: Receiver<M>) -> Self {
        Self { receiver }
    }

    /// Block until the next message is available.
    pub fn recv(&self) -> Result<M, std::sync::mpsc::RecvError> {
        self.receiver.recv()
    }

    /// Try to receive a message without blocking.
    pub fn try_recv(&self) -> Result<M, std::sync::mpsc::TryRecvError> {
        self.receiver.try_recv()
    }

    /// Block for up to `timeout` waiting for a message.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<M, std::sync::mpsc::RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }
}

/// Domain-agnostic event bus (pub/sub abstraction).
///
/// - **Lightweight contract**: minimal interface, no assumptions about
///   implementation (in-memory channels, message queues, ...).
/// - **No storage assumptions**: the bus is for distribution, not persistence;
///   the event store is the source of truth.
/// - **At-least-once delivery**: consumers must handle duplicates safely.
///
/// `publish()` can fail; failures are surfaced to the caller (typically the
/// command dispatcher). Since events are already persisted, retrying
/// publication is safe.
pub trait EventBus<M>: Send + Sync {
    type Error: core::fmt::Debug + Send + Sync + 'static;

    fn publish(&self, message: M) -> Result<(), Self::Error>;

    fn subscribe(&self) -> Subscription<M>;
}

impl<M, B> EventBus<M> for Arc<B>
where
    B: EventBus<M> + ?Sized,
{
    type Error = B::Error;

    fn publish(&self, message: M) -> Result<(), Self::Error> {
        (**self).publish(message)
    }

    fn subscribe(&self) -> Subscription<M> {
        (**self).subscribe()
    }
}
