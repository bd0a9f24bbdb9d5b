//! `millwright-events` — event abstractions shared across the workspace.
//!
//! Domain events are decided by aggregates; this crate provides the pieces
//! that move them around: the `Event` trait, the stream `EventEnvelope`, and
//! the `EventBus` pub/sub abstraction with an in-memory implementation.

pub mod bus;
pub mod envelope;
pub mod event;
pub mod in_memory_bus;

pub use bus::{EventBus, Subscription};
pub use envelope::EventEnvelope;
pub use event::Event;
pub use in_memory_bus::{InMemoryBusError, InMemoryEventBus};
