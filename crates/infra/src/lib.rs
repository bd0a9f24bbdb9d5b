//! Infrastructure layer: event persistence, command dispatch, read models,
//! and the production coordination service.

pub mod command_dispatcher;
pub mod event_store;
pub mod production;
pub mod projections;
pub mod read_model;


pub use command_dispatcher::{CommandDispatcher, DispatchError};
pub use event_store::{EventStore, EventStoreError, InMemoryEventStore, StoredEvent, UncommittedEvent};
pub use production::{FinishedGoodsDraft, MaterialDraft, OrderDraft, ProductionService};
