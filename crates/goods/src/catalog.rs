use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use millwright_core::{Aggregate, AggregateId, AggregateRoot, DomainError};
use millwright_events::Event;
use millwright_orders::ProductionOrderId;

/// Finished-goods item identifier.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FinishedGoodsId(pub AggregateId);

impl FinishedGoodsId {
    pub fn new(id: AggregateId) -> Self {
        Self(id)
    }
}

impl core::fmt::Display for FinishedGoodsId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

/// Catalog identifier (aggregate id). One catalog stream holds all items.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FinishedGoodsCatalogId(pub AggregateId);

impl FinishedGoodsCatalogId {
    pub fn new(id: AggregateId) -> Self {
        Self(id)
    }
}

impl core::fmt::Display for FinishedGoodsCatalogId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

/// One catalog/inventory entry created from a completed production order.
///
/// Never mutated after publication.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinishedGoodsItem {
    pub id: FinishedGoodsId,
    pub description: String,
    pub category: String,
    /// Price in smallest currency unit (e.g., cents).
    pub sale_price_cents: u64,
    pub image_ref: Option<String>,
    /// Provenance: the order this item was manufactured under. Unique across
    /// the catalog — at most one item per order.
    pub source_order_id: ProductionOrderId,
    pub published_at: DateTime<Utc>,
}

/// Aggregate root: FinishedGoodsCatalog.
///
/// The provenance set is the idempotency guard: publishing twice for one
/// order fails regardless of caller discipline (duplicate clicks, retries).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinishedGoodsCatalog {
    id: FinishedGoodsCatalogId,
    items: Vec<FinishedGoodsItem>,
    provenance: HashSet<ProductionOrderId>,
    version: u64,
}

impl FinishedGoodsCatalog {
    /// Empty aggregate for rehydration.
    pub fn empty(id: FinishedGoodsCatalogId) -> Self {
        Self {
            id,
            items: Vec::new(),
            provenance: HashSet::new(),
            version: 0,
        }
    }

    pub fn id_typed(&self) -> FinishedGoodsCatalogId {
        self.id
    }

    pub fn items(&self) -> &[FinishedGoodsItem] {
        &self.items
    }

    pub fn item_for_order(&self, order_id: &ProductionOrderId) -> Option<&FinishedGoodsItem> {
        self.items.iter().find(|i| i.source_order_id == *order_id)
    }

    pub fn has_published(&self, order_id: &ProductionOrderId) -> bool {
        self.provenance.contains(order_id)
    }
}

impl AggregateRoot for FinishedGoodsCatalog {
    type Id = FinishedGoodsCatalogId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

/// Command: PublishItem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishItem {
    pub catalog_id: FinishedGoodsCatalogId,
    pub item_id: FinishedGoodsId,
    pub source_order_id: ProductionOrderId,
    pub description: String,
    pub category: String,
    pub sale_price_cents: u64,
    pub image_ref: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CatalogCommand {
    PublishItem(PublishItem),
}

/// Event: ItemPublished.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemPublished {
    pub catalog_id: FinishedGoodsCatalogId,
    pub item_id: FinishedGoodsId,
    pub source_order_id: ProductionOrderId,
    pub description: String,
    pub category: String,
    pub sale_price_cents: u64,
    pub image_ref: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CatalogEvent {
    ItemPublished(ItemPublished),
}

impl Event for CatalogEvent {
    fn event_type(&self) -> &'static str {
        match self {
            CatalogEvent::ItemPublished(_) => "goods.catalog.item_published",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            CatalogEvent::ItemPublished(e) => e.occurred_at,
        }
    }
}

impl Aggregate for FinishedGoodsCatalog {
    type Command = CatalogCommand;
    type Event = CatalogEvent;
    type Error = DomainError;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            CatalogEvent::ItemPublished(e) => {
                self.items.push(FinishedGoodsItem {
                    id: e.item_id,
                    description: e.description.clone(),
                    category: e.category.clone(),
                    sale_price_cents: e.sale_price_cents,
                    image_ref: e.image_ref.clone(),
                    source_order_id: e.source_order_id,
                    published_at: e.occurred_at,
                });
                self.provenance.insert(e.source_order_id);
            }
        }

        self.version += 1;
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        match command {
            CatalogCommand::PublishItem(cmd) => self.handle_publish(cmd),
        }
    }
}

impl FinishedGoodsCatalog {
    fn handle_publish(&self, cmd: &PublishItem) -> Result<Vec<CatalogEvent>, DomainError> {
        if self.id != cmd.catalog_id {
            return Err(DomainError::conflict("catalog_id mismatch"));
        }

        if cmd.description.trim().is_empty() {
            return Err(DomainError::validation("description cannot be empty"));
        }

        if self.provenance.contains(&cmd.source_order_id) {
            return Err(DomainError::duplicate_publish(cmd.source_order_id));
        }

        Ok(vec![CatalogEvent::ItemPublished(ItemPublished {
            catalog_id: cmd.catalog_id,
            item_id: cmd.item_id,
            source_order_id: cmd.source_order_id,
            description: cmd.description.clone(),
            category: cmd.category.clone(),
            sale_price_cents: cmd.sale_price_cents,
            image_ref: cmd.image_ref.clone(),
            occurred_at: cmd.occurred_at,
        })])
    }
}
