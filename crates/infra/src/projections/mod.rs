//! Event-driven read models (projections).
//!
//! Projections consume published envelopes (JSON payloads) and maintain
//! disposable, rebuildable read models. Delivery from the bus is
//! at-least-once, so every projection keeps a per-stream sequence cursor and
//! silently skips replays at or below it.

use thiserror::Error;

pub mod finished_goods;
pub mod orders;
pub mod stock_levels;

pub use finished_goods::{FinishedGoodsProjection, FinishedGoodsReadModel};
pub use orders::{OrderReadModel, OrdersProjection};
pub use stock_levels::{StockLevelsProjection, StockReadModel};

#[derive(Debug, Error)]
pub enum ProjectionError {
    #[error("failed to deserialize event payload: {0}")]
    Deserialize(String),

    #[error("non-monotonic sequence number (last={last}, found={found})")]
    NonMonotonicSequence { last: u64, found: u64 },
}
