use std::collections::HashMap;
use std::sync::RwLock;

use serde_json::Value as JsonValue;

use millwright_core::AggregateId;
use millwright_events::EventEnvelope;
use millwright_materials::{LedgerEvent, MaterialId};

use super::ProjectionError;
use crate::read_model::ReadModelStore;

/// Stream type identifier for the material ledger aggregate.
pub const LEDGER_AGGREGATE_TYPE: &str = "materials.ledger";

/// Queryable stock level per material, with a low-stock flag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StockReadModel {
    pub material_id: MaterialId,
    pub name: String,
    pub category: String,
    pub unit_cost_cents: u64,
    pub on_hand: u32,
    pub min_threshold: Option<u32>,
    /// True when `on_hand` has fallen below `min_threshold`.
    pub below_threshold: bool,
}

impl StockReadModel {
    fn refresh_flag(&mut self) {
        self.below_threshold = match self.min_threshold {
            Some(threshold) => self.on_hand < threshold,
            None => false,
        };
    }
}

/// Material stock projection.
///
/// All materials live in one ledger stream, so a single cursor per ledger
/// aggregate covers every material record.
#[derive(Debug)]
pub struct StockLevelsProjection<S>
where
    S: ReadModelStore<MaterialId, StockReadModel>,
{
    store: S,
    cursors: RwLock<HashMap<AggregateId, u64>>,
}

impl<S> StockLevelsProjection<S>
where
    S: ReadModelStore<MaterialId, StockReadModel>,
{
    pub fn new(store: S) -> Self {
        Self {
            store,
            cursors: RwLock::new(HashMap::new()),
        }
    }

    pub fn get(&self, material_id: &MaterialId) -> Option<StockReadModel> {
        self.store.get(material_id)
    }

    pub fn list(&self) -> Vec<StockReadModel> {
        let mut materials = self.store.list();
        materials.sort_by(|a, b| a.name.cmp(&b.name));
        materials
    }

    /// Materials that have fallen below their reorder threshold.
    pub fn list_below_threshold(&self) -> Vec<StockReadModel> {
        self.list().into_iter().filter(|m| m.below_threshold).collect()
    }

    /// Apply a published envelope into the projection.
    pub fn apply_envelope(
        &self,
        envelope: &EventEnvelope<JsonValue>,
    ) -> Result<(), ProjectionError> {
        if envelope.aggregate_type() != LEDGER_AGGREGATE_TYPE {
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

            let event: LedgerEvent = serde_json::from_value(envelope.payload().clone())
                .map_err(|e| ProjectionError::Deserialize(e.to_string()))?;

            self.apply_event(&event);
            cursors.insert(aggregate_id, seq);
        }

        Ok(())
    }

    fn apply_event(&self, event: &LedgerEvent) {
        match event {
            LedgerEvent::MaterialRegistered(e) => {
                let mut rm = StockReadModel {
                    material_id: e.material_id,
                    name: e.name.clone(),
                    category: e.category.clone(),
                    unit_cost_cents: e.unit_cost_cents,
                    on_hand: e.initial_on_hand,
                    min_threshold: e.min_threshold,
                    below_threshold: false,
                };
                rm.refresh_flag();
                self.store.upsert(e.material_id, rm);
            }
            LedgerEvent::StockReceived(e) => {
                self.adjust(&e.material_id, |rm| {
                    rm.on_hand = rm.on_hand.saturating_add(e.quantity);
                });
            }
            LedgerEvent::StockAdjusted(e) => {
                self.adjust(&e.material_id, |rm| {
                    let next = i64::from(rm.on_hand) + e.delta;
                    rm.on_hand = u32::try_from(next.max(0)).unwrap_or(u32::MAX);
                });
            }
            LedgerEvent::StockConsumed(e) => {
                for line in &e.lines {
                    self.adjust(&line.material_id, |rm| {
                        rm.on_hand = rm.on_hand.saturating_sub(line.quantity);
                    });
                }
            }
            LedgerEvent::StockRestored(e) => {
                for line in &e.lines {
                    self.adjust(&line.material_id, |rm| {
                        rm.on_hand = rm.on_hand.saturating_add(line.quantity);
                    });
                }
            }
        }
    }

    fn adjust(&self, material_id: &MaterialId, f: impl FnOnce(&mut StockReadModel)) {
        if let Some(mut rm) = self.store.get(material_id) {
            f(&mut rm);
            rm.refresh_flag();
            self.store.upsert(*material_id, rm);
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

        let mut envs: Vec<_> = envelopes.into_iter().collect();
        envs.sort_by_key(|e| (*e.aggregate_id().as_uuid().as_bytes(), e.sequence_number()));

        for env in &envs {
            self.apply_envelope(env)?;
        }

        Ok(())
    }
}
