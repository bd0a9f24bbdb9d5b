use std::collections::HashMap;
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;

use millwright_core::AggregateId;
use millwright_events::EventEnvelope;
use millwright_materials::MaterialLine;
use millwright_orders::{OrderEvent, ProductionOrder, ProductionOrderId, ProductionStatus};

use super::ProjectionError;
use crate::read_model::ReadModelStore;

/// Stream type identifier for production order aggregates.
pub const ORDER_AGGREGATE_TYPE: &str = "orders.production_order";

/// Queryable production-order read model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderReadModel {
    pub order_id: ProductionOrderId,
    /// Monotonic human-facing order number.
    pub sequence_no: u64,
    pub product_name: String,
    pub quantity: u32,
    pub material_lines: Vec<MaterialLine>,
    pub estimated_cost_cents: u64,
    pub sale_price_cents: u64,
    pub estimated_days: u32,
    pub image_ref: Option<String>,
    pub status: ProductionStatus,
    pub progress_pct: u8,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl OrderReadModel {
    /// Build the view directly from a rehydrated aggregate (used by the
    /// service to return write-side state without waiting on the bus).
    pub fn from_order(order: &ProductionOrder) -> Self {
        let fields = order.fields();
        Self {
            order_id: order.id_typed(),
            sequence_no: order.sequence_no(),
            product_name: fields.product_name.clone(),
            quantity: fields.quantity,
            material_lines: fields.material_lines.clone(),
            estimated_cost_cents: fields.estimated_cost_cents,
            sale_price_cents: fields.sale_price_cents,
            estimated_days: fields.estimated_days,
            image_ref: fields.image_ref.clone(),
            status: order.status(),
            progress_pct: order.progress_pct(),
            created_at: order.created_at(),
            updated_at: order.updated_at(),
        }
    }
}

/// Production orders projection.
#[derive(Debug)]
pub struct OrdersProjection<S>
where
    S: ReadModelStore<ProductionOrderId, OrderReadModel>,
{
    store: S,
    cursors: RwLock<HashMap<AggregateId, u64>>,
}

impl<S> OrdersProjection<S>
where
    S: ReadModelStore<ProductionOrderId, OrderReadModel>,
{
    pub fn new(store: S) -> Self {
        Self {
            store,
            cursors: RwLock::new(HashMap::new()),
        }
    }

    pub fn get(&self, order_id: &ProductionOrderId) -> Option<OrderReadModel> {
        self.store.get(order_id)
    }

    /// All orders, sorted by their human-facing sequence number.
    pub fn list(&self) -> Vec<OrderReadModel> {
        let mut orders = self.store.list();
        orders.sort_by_key(|o| o.sequence_no);
        orders
    }

    /// Apply a published envelope into the projection.
    ///
    /// Envelopes from other aggregate types are skipped; replays at or below
    /// the stream cursor are ignored (at-least-once delivery).
    pub fn apply_envelope(
        &self,
        envelope: &EventEnvelope<JsonValue>,
    ) -> Result<(), ProjectionError> {
        if envelope.aggregate_type() != ORDER_AGGREGATE_TYPE {
            return Ok(());
        }

        let aggregate_id = envelope.aggregate_id();
        let seq = envelope.sequence_number();

        if let Ok(mut cursors) = self.cursors.write() {
            let last = *cursors.get(&aggregate_id).unwrap_or(&0);

            if seq == 0 {
                return Err(ProjectionError::NonMonotonicSequence { last, found: seq });
            }
            if seq <= last {
                // Duplicate or replay; safe to ignore.
                return Ok(());
            }
            if seq != last + 1 && last != 0 {
                return Err(ProjectionError::NonMonotonicSequence { last, found: seq });
            }

            let event: OrderEvent = serde_json::from_value(envelope.payload().clone())
                .map_err(|e| ProjectionError::Deserialize(e.to_string()))?;

            self.apply_event(&event);

            // Advance cursor after successful apply.
            cursors.insert(aggregate_id, seq);
        }

        Ok(())
    }

    fn apply_event(&self, event: &OrderEvent) {
        match event {
            OrderEvent::OrderCreated(e) => {
                self.store.upsert(
                    e.order_id,
                    OrderReadModel {
                        order_id: e.order_id,
                        sequence_no: e.sequence_no,
                        product_name: e.fields.product_name.clone(),
                        quantity: e.fields.quantity,
                        material_lines: e.fields.material_lines.clone(),
                        estimated_cost_cents: e.fields.estimated_cost_cents,
                        sale_price_cents: e.fields.sale_price_cents,
                        estimated_days: e.fields.estimated_days,
                        image_ref: e.fields.image_ref.clone(),
                        status: ProductionStatus::Pending,
                        progress_pct: 0,
                        created_at: e.occurred_at,
                        updated_at: e.occurred_at,
                    },
                );
            }
            OrderEvent::OrderRevised(e) => {
                if let Some(mut rm) = self.store.get(&e.order_id) {
                    rm.product_name = e.fields.product_name.clone();
                    rm.quantity = e.fields.quantity;
                    rm.material_lines = e.fields.material_lines.clone();
                    rm.estimated_cost_cents = e.fields.estimated_cost_cents;
                    rm.sale_price_cents = e.fields.sale_price_cents;
                    rm.estimated_days = e.fields.estimated_days;
                    rm.image_ref = e.fields.image_ref.clone();
                    rm.updated_at = e.occurred_at;
                    self.store.upsert(e.order_id, rm);
                }
            }
            OrderEvent::ProductionStarted(e) => {
                if let Some(mut rm) = self.store.get(&e.order_id) {
                    rm.status = ProductionStatus::InProgress;
                    rm.progress_pct = 0;
                    rm.updated_at = e.occurred_at;
                    self.store.upsert(e.order_id, rm);
                }
            }
            OrderEvent::ProgressReported(e) => {
                if let Some(mut rm) = self.store.get(&e.order_id) {
                    rm.progress_pct = e.progress_pct;
                    rm.updated_at = e.occurred_at;
                    self.store.upsert(e.order_id, rm);
                }
            }
            OrderEvent::ProductionCompleted(e) => {
                if let Some(mut rm) = self.store.get(&e.order_id) {
                    rm.status = ProductionStatus::Completed;
                    rm.progress_pct = 100;
                    rm.updated_at = e.occurred_at;
                    self.store.upsert(e.order_id, rm);
                }
            }
        }
    }

    /// Rebuild the read model from scratch by replaying envelopes.
    pub fn rebuild_from_scratch(
        &self,
        envelopes: impl IntoIterator<Item = EventEnvelope<JsonValue>>,
    ) -> Result<(), ProjectionError> {
        if let Ok(mut cursors) = self.cursors.write() {
            cursors.clear();
        }
        self.store.clear();

        // Deterministic replay order: aggregate, then sequence.
        let mut envs: Vec<_> = envelopes.into_iter().collect();
        envs.sort_by_key(|e| (*e.aggregate_id().as_uuid().as_bytes(), e.sequence_number()));

        for env in &envs {
            self.apply_envelope(env)?;
        }

        Ok(())
    }
}
