//! Domain error model.

use thiserror::Error;

/// Result type used across the domain layer.
pub type DomainResult<T> = Result<T, DomainError>;

/// Domain-level error.
///
/// Keep this focused on deterministic, business/domain failures (validation,
/// state machine rejections, stock shortfalls). Infrastructure concerns belong
/// elsewhere.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// A value failed validation (e.g. malformed input). Never partially applied.
    #[error("validation failed: {0}")]
    Validation(String),

    /// A transition was attempted from a state that does not permit it
    /// (double-start, double-confirm, editing a non-Pending order).
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// An identifier was invalid (e.g. parse failure).
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// A requested order or material was not found.
    #[error("not found")]
    NotFound,

    /// A material lacks quantity-on-hand for the requested deduction.
    /// Names the first insufficient material; nothing was deducted.
    #[error("insufficient stock for material {material_id}: requested {requested}, on hand {on_hand}")]
    InsufficientStock {
        material_id: String,
        requested: u32,
        on_hand: u32,
    },

    /// A finished-goods item already references this order id.
    #[error("finished goods already published for order {order_id}")]
    DuplicatePublish { order_id: String },

    /// A conflict occurred (e.g. stale version / optimistic concurrency).
    #[error("conflict: {0}")]
    Conflict(String),
}

impl DomainError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidState(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    pub fn not_found() -> Self {
        Self::NotFound
    }

    pub fn insufficient_stock(
        material_id: impl ToString,
        requested: u32,
        on_hand: u32,
    ) -> Self {
        Self::InsufficientStock {
            material_id: material_id.to_string(),
            requested,
            on_hand,
        }
    }

    pub fn duplicate_publish(order_id: impl ToString) -> Self {
        Self::DuplicatePublish {
            order_id: order_id.to_string(),
        }
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }
}
