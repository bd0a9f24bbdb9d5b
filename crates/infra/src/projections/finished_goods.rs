use std::collections::HashMap;
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;

use millwright_core::AggregateId;
use millwright_events::EventEnvelope;
use millwright_goods::{CatalogEvent, FinishedGoodsId};
use millwright_orders::ProductionOrderId;

use super::ProjectionError;
use crate::read_model::ReadModelStore;

/// Stream type identifier for the finished-goods catalog aggregate.
pub const CATALOG_AGGREGATE_TYPE: &str = "goods.catalog";

/// Queryable finished-goods catalog entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinishedGoodsReadModel {
    pub item_id: FinishedGoodsId,
    pub description: String,
    pub category: String,
    pub sale_price_cents: u64,
    pub image_ref: Option<String>,
    pub source_order_id: ProductionOrderId,
    pub published_at: DateTime<Utc>,
}

/// Finished-goods catalog projection.
#[derive(Debug)]
pub struct FinishedGoodsProjection<S>
where
    S: ReadModelStore<FinishedGoodsId, FinishedGoodsReadModel>,
{
    store: S,
    cursors: RwLock<HashMap<AggregateId, u64>>,
}

impl<S> FinishedGoodsProjection<S>
where
    S: ReadModelStore<FinishedGoodsId, FinishedGoodsReadModel>,
{
    pub fn new(store: S) -> Self {
        Self {
            store,
            cursors: RwLock::new(HashMap::new()),
        }
    }

    pub fn get(&self, item_id: &FinishedGoodsId) -> Option<FinishedGoodsReadModel> {
        self.store.get(item_id)
    }

    /// All published items, newest first.
    pub fn list(&self) -> Vec<FinishedGoodsReadModel> {
        let mut items = self.store.list();
        items.sort_by(|a, b| b.published_at.cmp(&a.published_at));
        items
    }

    pub fn find_by_order(&self, order_id: &ProductionOrderId) -> Option<FinishedGoodsReadModel> {
        self.store
            .list()
            .into_iter()
            .find(|i| i.source_order_id == *order_id)
    }

    /// Apply a published envelope into the projection.
    pub fn apply_envelope(
        &self,
        envelope: &EventEnvelope<JsonValue>,
    ) -> Result<(), ProjectionError> {
        if envelope.aggregate_type() != CATALOG_AGGREGATE_TYPE {
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
                return Ok(());
            }
            if seq != last + 1 && last != 0 {
                return Err(ProjectionError::NonMonotonicSequence { last, found: seq });
            }

            let event: CatalogEvent = serde_json::from_value(envelope.payload().clone())
                .map_err(|e| ProjectionError::Deserialize(e.to_string()))?;

            match &event {
                CatalogEvent::ItemPublished(e) => {
                    self.store.upsert(
                        e.item_id,
                        FinishedGoodsReadModel {
                            item_id: e.item_id,
                            description: e.description.clone(),
                            category: e.category.clone(),
                            sale_price_cents: e.sale_price_cents,
                            image_ref: e.image_ref.clone(),
                            source_order_id: e.source_order_id,
                            published_at: e.occurred_at,
                        },
                    );
                }
            }

            cursors.insert(aggregate_id, seq);
        }

        Ok(())
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

        let mut envs: Vec<_> = envelopes.into_iter().collect();
        envs.sort_by_key(|e| (*e.aggregate_id().as_uuid().as_bytes(), e.sequence_number()));

        for env in &envs {
            self.apply_envelope(env)?;
        }

        Ok(())
    }
}
