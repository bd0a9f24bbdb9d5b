//! Production coordination service.
//!
//! `ProductionService` is the application-facing surface over the three
//! aggregates (material ledger, production orders, finished-goods catalog).
//! It owns the cross-aggregate workflows that no single aggregate can decide
//! alone:
//!
//! - **create/update**: price the bill of materials against current ledger
//!   unit costs and assign the human-facing order number
//! - **start**: consume materials atomically, then move the order to
//!   in-progress, restoring stock if the second step fails
//! - **confirm**: publish exactly one finished-goods item, then complete the
//!   order
//!
//! ## Concurrency model
//!
//! Commands for one order are serialized through a per-order mutex, so
//! concurrent starts/confirms for the same order resolve to one winner and
//! deterministic `InvalidState` losers. The ledger is a single stream, so
//! ledger appends from different orders serialize on optimistic concurrency;
//! the service retries those conflicts a bounded number of times.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;
use serde_json::Value as JsonValue;
use tracing::instrument;

use millwright_core::{AggregateId, DomainError, DomainResult};
use millwright_events::{EventBus, EventEnvelope};
use millwright_goods::{
    CatalogCommand, FinishedGoodsCatalog, FinishedGoodsCatalogId, FinishedGoodsId,
    FinishedGoodsItem, PublishItem,
};
use millwright_materials::{
    AdjustStock, ConsumeForOrder, LedgerCommand, MaterialId, MaterialLedger, MaterialLedgerId,
    MaterialLine, MaterialRecord, ReceiveStock, RegisterMaterial, RestoreForOrder, merge_lines,
};
use millwright_orders::{
    CompleteProduction, CreateOrder, OrderCommand, OrderFields, ProductionOrder, ProductionOrderId,
    ProductionStatus, ReportProgress, ReviseOrder, StartProduction,
};

use crate::command_dispatcher::{CommandDispatcher, DispatchError};
use crate::event_store::EventStore;
use crate::projections::finished_goods::CATALOG_AGGREGATE_TYPE;
use crate::projections::orders::ORDER_AGGREGATE_TYPE;
use crate::projections::stock_levels::LEDGER_AGGREGATE_TYPE;
use crate::projections::{
    FinishedGoodsProjection, FinishedGoodsReadModel, OrderReadModel, OrdersProjection,
    StockLevelsProjection, StockReadModel,
};
use crate::read_model::InMemoryReadStore;

/// Bounded retry count for optimistic-concurrency conflicts on the shared
/// ledger/catalog streams.
const MAX_CONFLICT_RETRIES: usize = 8;

type OrdersRm = OrdersProjection<Arc<InMemoryReadStore<ProductionOrderId, OrderReadModel>>>;
type StockRm = StockLevelsProjection<Arc<InMemoryReadStore<MaterialId, StockReadModel>>>;
type GoodsRm = FinishedGoodsProjection<Arc<InMemoryReadStore<FinishedGoodsId, FinishedGoodsReadModel>>>;

/// Input for registering a raw material.
#[derive(Debug, Clone)]
pub struct MaterialDraft {
    pub name: String,
    pub category: String,
    pub unit_cost_cents: u64,
    pub initial_on_hand: u32,
    pub min_threshold: Option<u32>,
}

/// Input for creating or revising a production order.
#[derive(Debug, Clone)]
pub struct OrderDraft {
    pub product_name: String,
    pub quantity: u32,
    pub material_lines: Vec<MaterialLine>,
    pub sale_price_cents: u64,
    pub estimated_days: u32,
    pub image_ref: Option<String>,
}

/// Input for publishing the finished-goods item on confirmation.
#[derive(Debug, Clone)]
pub struct FinishedGoodsDraft {
    pub description: String,
    pub category: String,
    pub sale_price_cents: u64,
    pub image_ref: Option<String>,
}

/// Application service coordinating orders, stock, and finished goods.
pub struct ProductionService<S, B> {
    dispatcher: CommandDispatcher<S, B>,
    ledger_id: MaterialLedgerId,
    catalog_id: FinishedGoodsCatalogId,
    orders_rm: Arc<OrdersRm>,
    stock_rm: Arc<StockRm>,
    goods_rm: Arc<GoodsRm>,
    order_locks: Mutex<HashMap<ProductionOrderId, Arc<Mutex<()>>>>,
    next_sequence: Mutex<u64>,
}

impl<S, B> ProductionService<S, B>
where
    S: EventStore,
    B: EventBus<EventEnvelope<JsonValue>>,
{
    /// Wire up the service over a store and bus.
    ///
    /// Replays the full event history to discover the ledger/catalog streams
    /// (creating fresh identifiers when none exist yet), rebuilds the read
    /// models, recovers the order number counter, and spawns the projection
    /// worker feeding read models from the bus.
    pub fn bootstrap(store: S, bus: B) -> DomainResult<Self> {
        // Subscribe before replay so no published envelope falls between
        // rebuild and live consumption (cursors drop the overlap).
        let subscription = bus.subscribe();

        let orders_rm = Arc::new(OrdersProjection::new(Arc::new(InMemoryReadStore::new())));
        let stock_rm = Arc::new(StockLevelsProjection::new(Arc::new(InMemoryReadStore::new())));
        let goods_rm = Arc::new(FinishedGoodsProjection::new(Arc::new(InMemoryReadStore::new())));

        let history = store
            .load_all()
            .map_err(|e| DomainError::conflict(format!("event store failure: {e}")))?;

        let ledger_id = history
            .iter()
            .find(|e| e.aggregate_type == LEDGER_AGGREGATE_TYPE)
            .map(|e| MaterialLedgerId::new(e.aggregate_id))
            .unwrap_or_else(|| MaterialLedgerId::new(AggregateId::new()));
        let catalog_id = history
            .iter()
            .find(|e| e.aggregate_type == CATALOG_AGGREGATE_TYPE)
            .map(|e| FinishedGoodsCatalogId::new(e.aggregate_id))
            .unwrap_or_else(|| FinishedGoodsCatalogId::new(AggregateId::new()));

        let envelopes: Vec<_> = history.iter().map(|e| e.to_envelope()).collect();
        orders_rm
            .rebuild_from_scratch(envelopes.clone())
            .map_err(|e| DomainError::conflict(format!("orders rebuild failed: {e}")))?;
        stock_rm
            .rebuild_from_scratch(envelopes.clone())
            .map_err(|e| DomainError::conflict(format!("stock rebuild failed: {e}")))?;
        goods_rm
            .rebuild_from_scratch(envelopes)
            .map_err(|e| DomainError::conflict(format!("finished goods rebuild failed: {e}")))?;

        // Order numbers continue where the replayed history left off.
        let next_sequence = orders_rm
            .list()
            .last()
            .map(|o| o.sequence_no + 1)
            .unwrap_or(1);

        spawn_projection_worker(
            subscription,
            Arc::clone(&orders_rm),
            Arc::clone(&stock_rm),
            Arc::clone(&goods_rm),
        )?;

        Ok(Self {
            dispatcher: CommandDispatcher::new(store, bus),
            ledger_id,
            catalog_id,
            orders_rm,
            stock_rm,
            goods_rm,
            order_locks: Mutex::new(HashMap::new()),
            next_sequence: Mutex::new(next_sequence),
        })
    }

    pub fn ledger_id(&self) -> MaterialLedgerId {
        self.ledger_id
    }

    pub fn catalog_id(&self) -> FinishedGoodsCatalogId {
        self.catalog_id
    }

    // --- materials ---

    #[instrument(skip(self, draft), fields(name = %draft.name), err)]
    pub fn register_material(&self, draft: MaterialDraft) -> DomainResult<MaterialRecord> {
        let material_id = MaterialId::new(AggregateId::new());
        self.dispatch_ledger(LedgerCommand::RegisterMaterial(RegisterMaterial {
            ledger_id: self.ledger_id,
            material_id,
            name: draft.name,
            category: draft.category,
            unit_cost_cents: draft.unit_cost_cents,
            initial_on_hand: draft.initial_on_hand,
            min_threshold: draft.min_threshold,
            occurred_at: Utc::now(),
        }))?;
        self.material_record(&material_id)
    }

    #[instrument(skip(self), fields(material_id = %material_id), err)]
    pub fn receive_stock(&self, material_id: MaterialId, quantity: u32) -> DomainResult<MaterialRecord> {
        self.dispatch_ledger(LedgerCommand::ReceiveStock(ReceiveStock {
            ledger_id: self.ledger_id,
            material_id,
            quantity,
            occurred_at: Utc::now(),
        }))?;
        self.material_record(&material_id)
    }

    #[instrument(skip(self), fields(material_id = %material_id), err)]
    pub fn adjust_stock(&self, material_id: MaterialId, delta: i64) -> DomainResult<MaterialRecord> {
        self.dispatch_ledger(LedgerCommand::AdjustStock(AdjustStock {
            ledger_id: self.ledger_id,
            material_id,
            delta,
            occurred_at: Utc::now(),
        }))?;
        self.material_record(&material_id)
    }

    pub fn get_material(&self, material_id: &MaterialId) -> DomainResult<MaterialRecord> {
        self.material_record(material_id)
    }

    /// Current stock levels (disposable read model).
    pub fn list_materials(&self) -> Vec<StockReadModel> {
        self.stock_rm.list()
    }

    /// Materials below their reorder threshold.
    pub fn list_low_stock(&self) -> Vec<StockReadModel> {
        self.stock_rm.list_below_threshold()
    }

    // --- orders ---

    /// Create a production order.
    ///
    /// Prices the (merged) bill of materials against current ledger unit
    /// costs; an unknown material is `NotFound`. Stock sufficiency is **not**
    /// checked here: orders may be planned beyond today's stock, the check
    /// happens at start.
    #[instrument(skip(self, draft), fields(product = %draft.product_name), err)]
    pub fn create_order(&self, draft: OrderDraft) -> DomainResult<OrderReadModel> {
        let fields = self.price_draft(draft)?;
        let order_id = ProductionOrderId::new(AggregateId::new());

        // Hold the counter across the append so numbers stay dense even when
        // creations race.
        let mut next = lock(&self.next_sequence);
        let sequence_no = *next;
        match self.dispatch_order(
            order_id,
            OrderCommand::CreateOrder(CreateOrder {
                order_id,
                sequence_no,
                fields,
                occurred_at: Utc::now(),
            }),
        ) {
            Ok(()) => *next += 1,
            Err(err) => {
                // The created event is durable on a publish failure, so the
                // number is taken and must not be reused.
                if !err.failed_before_append() {
                    *next += 1;
                }
                drop(next);
                return Err(err.into_domain());
            }
        }
        drop(next);

        self.order_view(order_id)
    }

    /// Replace the mutable fields of a pending order, re-pricing materials.
    #[instrument(skip(self, draft), fields(order_id = %order_id), err)]
    pub fn update_order(
        &self,
        order_id: ProductionOrderId,
        draft: OrderDraft,
    ) -> DomainResult<OrderReadModel> {
        let mutex = self.order_lock(order_id);
        let _guard = lock(&mutex);

        let order = self.load_order(order_id)?;
        if !order.exists() {
            return Err(DomainError::not_found());
        }

        let fields = self.price_draft(draft)?;
        self.dispatch_order(
            order_id,
            OrderCommand::ReviseOrder(ReviseOrder {
                order_id,
                fields,
                occurred_at: Utc::now(),
            }),
        )
        .map_err(DispatchError::into_domain)?;

        self.order_view(order_id)
    }

    /// Start production: consume materials, then move the order to
    /// in-progress.
    ///
    /// The pending check runs against the rehydrated aggregate under the
    /// per-order lock, so a concurrent second start fails here with
    /// `InvalidState` before touching stock. If the order append fails after
    /// the stock deduction, a compensating restore puts the quantities back;
    /// a failure to publish the already-appended start event does not
    /// compensate, since the order is durably in progress.
    #[instrument(skip(self), fields(order_id = %order_id), err)]
    pub fn start_order(&self, order_id: ProductionOrderId) -> DomainResult<OrderReadModel> {
        let mutex = self.order_lock(order_id);
        let _guard = lock(&mutex);

        let order = self.load_order(order_id)?;
        if !order.exists() {
            return Err(DomainError::not_found());
        }
        if order.status() != ProductionStatus::Pending {
            return Err(DomainError::invalid_state(
                "only pending orders can start production",
            ));
        }

        // An interrupted earlier start may have consumed already; the ledger
        // records consumption per order, so don't deduct twice.
        let ledger = self.load_ledger()?;
        let consumed_now = if ledger.has_consumed(&order_id.0) {
            tracing::warn!(order_id = %order_id, "stock already consumed for order, resuming start");
            false
        } else {
            self.dispatch_ledger(LedgerCommand::ConsumeForOrder(ConsumeForOrder {
                ledger_id: self.ledger_id,
                order_ref: order_id.0,
                lines: order.material_lines().to_vec(),
                occurred_at: Utc::now(),
            }))?;
            true
        };

        if let Err(err) = self.dispatch_order(
            order_id,
            OrderCommand::StartProduction(StartProduction {
                order_id,
                occurred_at: Utc::now(),
            }),
        ) {
            // Compensate only when this call deducted AND the start event
            // never made it into the stream. A publish failure leaves the
            // order durably in progress; its deduction must stand.
            if consumed_now && err.failed_before_append() {
                tracing::warn!(order_id = %order_id, error = %err, "start failed after stock deduction, restoring");
                if let Err(restore_err) = self.dispatch_ledger(LedgerCommand::RestoreForOrder(
                    RestoreForOrder {
                        ledger_id: self.ledger_id,
                        order_ref: order_id.0,
                        occurred_at: Utc::now(),
                    },
                )) {
                    tracing::error!(
                        order_id = %order_id,
                        error = %restore_err,
                        "compensating restore failed, ledger holds consumption for an order that never started"
                    );
                }
            }
            return Err(err.into_domain());
        }

        self.order_view(order_id)
    }

    /// Record advisory progress on an in-progress order.
    #[instrument(skip(self), fields(order_id = %order_id), err)]
    pub fn report_progress(
        &self,
        order_id: ProductionOrderId,
        progress_pct: u8,
    ) -> DomainResult<OrderReadModel> {
        let mutex = self.order_lock(order_id);
        let _guard = lock(&mutex);

        self.dispatch_order(
            order_id,
            OrderCommand::ReportProgress(ReportProgress {
                order_id,
                progress_pct,
                occurred_at: Utc::now(),
            }),
        )
        .map_err(DispatchError::into_domain)?;

        self.order_view(order_id)
    }

    /// Confirm completion: publish the finished-goods item, then complete the
    /// order.
    ///
    /// The catalog's provenance set backstops the in-progress check: even if
    /// an earlier confirm was interrupted between publish and complete, at
    /// most one item ever exists per order. In that interrupted case the
    /// duplicate publish is treated as already-done and completion proceeds.
    #[instrument(skip(self, draft), fields(order_id = %order_id), err)]
    pub fn confirm_order(
        &self,
        order_id: ProductionOrderId,
        draft: FinishedGoodsDraft,
    ) -> DomainResult<(OrderReadModel, FinishedGoodsItem)> {
        let mutex = self.order_lock(order_id);
        let _guard = lock(&mutex);

        let order = self.load_order(order_id)?;
        if !order.exists() {
            return Err(DomainError::not_found());
        }
        if order.status() != ProductionStatus::InProgress {
            return Err(DomainError::invalid_state(
                "only in-progress orders can be confirmed",
            ));
        }

        let item_id = FinishedGoodsId::new(AggregateId::new());
        match self.dispatch_catalog(CatalogCommand::PublishItem(PublishItem {
            catalog_id: self.catalog_id,
            item_id,
            source_order_id: order_id,
            description: draft.description,
            category: draft.category,
            sale_price_cents: draft.sale_price_cents,
            image_ref: draft.image_ref,
            occurred_at: Utc::now(),
        })) {
            Ok(()) => {}
            Err(DomainError::DuplicatePublish { .. }) => {
                tracing::warn!(order_id = %order_id, "item already published for order, completing production");
            }
            Err(err) => return Err(err),
        }

        self.dispatch_order(
            order_id,
            OrderCommand::CompleteProduction(CompleteProduction {
                order_id,
                occurred_at: Utc::now(),
            }),
        )
        .map_err(DispatchError::into_domain)?;

        let catalog = self.load_catalog()?;
        let item = catalog
            .item_for_order(&order_id)
            .cloned()
            .ok_or_else(DomainError::not_found)?;

        Ok((self.order_view(order_id)?, item))
    }

    /// Authoritative order state (rehydrated from the stream).
    pub fn get_order(&self, order_id: ProductionOrderId) -> DomainResult<OrderReadModel> {
        self.order_view(order_id)
    }

    /// All orders sorted by order number (disposable read model).
    pub fn list_orders(&self) -> Vec<OrderReadModel> {
        self.orders_rm.list()
    }

    /// Published finished-goods items, newest first (disposable read model).
    pub fn list_finished_goods(&self) -> Vec<FinishedGoodsReadModel> {
        self.goods_rm.list()
    }

    // --- internals ---

    /// Validate and price a draft against current ledger unit costs.
    fn price_draft(&self, draft: OrderDraft) -> DomainResult<OrderFields> {
        let ledger = self.load_ledger()?;
        let merged = merge_lines(&draft.material_lines)?;
        let estimated_cost_cents = estimate_cost(&ledger, &merged)?;

        Ok(OrderFields {
            product_name: draft.product_name,
            quantity: draft.quantity,
            material_lines: merged,
            estimated_cost_cents,
            sale_price_cents: draft.sale_price_cents,
            estimated_days: draft.estimated_days,
            image_ref: draft.image_ref,
        })
    }

    fn material_record(&self, material_id: &MaterialId) -> DomainResult<MaterialRecord> {
        let ledger = self.load_ledger()?;
        ledger
            .material(material_id)
            .cloned()
            .ok_or_else(DomainError::not_found)
    }

    fn order_view(&self, order_id: ProductionOrderId) -> DomainResult<OrderReadModel> {
        let order = self.load_order(order_id)?;
        if !order.exists() {
            return Err(DomainError::not_found());
        }
        Ok(OrderReadModel::from_order(&order))
    }

    fn load_order(&self, order_id: ProductionOrderId) -> DomainResult<ProductionOrder> {
        self.dispatcher
            .load_aggregate(order_id.0, |id| {
                ProductionOrder::empty(ProductionOrderId::new(id))
            })
            .map_err(DispatchError::into_domain)
    }

    fn load_ledger(&self) -> DomainResult<MaterialLedger> {
        let ledger_id = self.ledger_id;
        self.dispatcher
            .load_aggregate(ledger_id.0, |_| MaterialLedger::empty(ledger_id))
            .map_err(DispatchError::into_domain)
    }

    fn load_catalog(&self) -> DomainResult<FinishedGoodsCatalog> {
        let catalog_id = self.catalog_id;
        self.dispatcher
            .load_aggregate(catalog_id.0, |_| FinishedGoodsCatalog::empty(catalog_id))
            .map_err(DispatchError::into_domain)
    }

    /// Dispatch against an order stream, keeping the [`DispatchError`] so
    /// lifecycle operations can tell pre-append failures from post-append
    /// publish failures.
    fn dispatch_order(
        &self,
        order_id: ProductionOrderId,
        command: OrderCommand,
    ) -> Result<(), DispatchError> {
        // Per-order serialization makes optimistic conflicts impossible here,
        // so no retry loop.
        self.dispatcher
            .dispatch::<ProductionOrder>(order_id.0, ORDER_AGGREGATE_TYPE, command, |id| {
                ProductionOrder::empty(ProductionOrderId::new(id))
            })
            .map(|_| ())
    }

    /// Dispatch against the shared ledger stream, retrying bounded
    /// optimistic-concurrency conflicts (appends from other orders).
    fn dispatch_ledger(&self, command: LedgerCommand) -> DomainResult<()> {
        let ledger_id = self.ledger_id;
        for _ in 0..MAX_CONFLICT_RETRIES {
            match self.dispatcher.dispatch::<MaterialLedger>(
                ledger_id.0,
                LEDGER_AGGREGATE_TYPE,
                command.clone(),
                |_| MaterialLedger::empty(ledger_id),
            ) {
                Ok(_) => return Ok(()),
                Err(DispatchError::Concurrency(_)) => continue,
                Err(err) => return Err(err.into_domain()),
            }
        }
        Err(DomainError::conflict(
            "ledger append kept conflicting, giving up",
        ))
    }

    fn dispatch_catalog(&self, command: CatalogCommand) -> DomainResult<()> {
        let catalog_id = self.catalog_id;
        for _ in 0..MAX_CONFLICT_RETRIES {
            match self.dispatcher.dispatch::<FinishedGoodsCatalog>(
                catalog_id.0,
                CATALOG_AGGREGATE_TYPE,
                command.clone(),
                |_| FinishedGoodsCatalog::empty(catalog_id),
            ) {
                Ok(_) => return Ok(()),
                Err(DispatchError::Concurrency(_)) => continue,
                Err(err) => return Err(err.into_domain()),
            }
        }
        Err(DomainError::conflict(
            "catalog append kept conflicting, giving up",
        ))
    }

    fn order_lock(&self, order_id: ProductionOrderId) -> Arc<Mutex<()>> {
        let mut locks = lock(&self.order_locks);
        Arc::clone(locks.entry(order_id).or_default())
    }
}

/// Σ line quantity × unit cost, in cents, against the rehydrated ledger.
fn estimate_cost(ledger: &MaterialLedger, lines: &[MaterialLine]) -> DomainResult<u64> {
    let mut total: u64 = 0;
    for line in lines {
        let unit = ledger
            .unit_cost_cents(&line.material_id)
            .ok_or_else(DomainError::not_found)?;
        let line_cost = unit
            .checked_mul(u64::from(line.quantity))
            .ok_or_else(|| DomainError::validation("estimated cost overflows"))?;
        total = total
            .checked_add(line_cost)
            .ok_or_else(|| DomainError::validation("estimated cost overflows"))?;
    }
    Ok(total)
}

/// Lock a mutex, recovering the data from a poisoned lock. State behind these
/// locks stays consistent across panics (counters and lock maps).
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn spawn_projection_worker(
    subscription: millwright_events::Subscription<EventEnvelope<JsonValue>>,
    orders_rm: Arc<OrdersRm>,
    stock_rm: Arc<StockRm>,
    goods_rm: Arc<GoodsRm>,
) -> DomainResult<()> {
    std::thread::Builder::new()
        .name("millwright-projections".to_string())
        .spawn(move || {
            // Exits when the bus side of the channel is dropped.
            while let Ok(envelope) = subscription.recv() {
                if let Err(err) = orders_rm.apply_envelope(&envelope) {
                    tracing::warn!(error = %err, "orders projection rejected envelope");
                }
                if let Err(err) = stock_rm.apply_envelope(&envelope) {
                    tracing::warn!(error = %err, "stock projection rejected envelope");
                }
                if let Err(err) = goods_rm.apply_envelope(&envelope) {
                    tracing::warn!(error = %err, "finished goods projection rejected envelope");
                }
            }
        })
        .map(|_| ())
        .map_err(|e| DomainError::conflict(format!("failed to spawn projection worker: {e}")))
}
