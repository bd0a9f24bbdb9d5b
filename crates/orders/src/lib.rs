//! `millwright-orders` — production order domain.

pub mod order;

pub use order::{
    CompleteProduction, CreateOrder, OrderCommand, OrderCreated, OrderEvent, OrderFields,
    OrderRevised, ProductionCompleted, ProductionOrder, ProductionOrderId, ProductionStarted,
    ProductionStatus, ProgressReported, ReportProgress, ReviseOrder, StartProduction,
};
