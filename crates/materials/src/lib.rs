//! `millwright-materials` — raw-material stock domain.
//!
//! The whole stock book is one aggregate (`MaterialLedger`): a single stream
//! serializes every check-and-deduct, so concurrent consumption races on the
//! append rather than on per-material read-modify-write sequences.

pub mod ledger;

pub use ledger::{
    ConsumeForOrder, LedgerCommand, LedgerEvent, MaterialId, MaterialLedger, MaterialLedgerId,
    MaterialLine, MaterialRecord, RegisterMaterial, ReceiveStock, AdjustStock, RestoreForOrder,
    StockAdjusted, StockConsumed, StockReceived, StockRestored, MaterialRegistered, merge_lines,
};
