use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use millwright_core::{Aggregate, AggregateId, AggregateRoot, DomainError};
use millwright_events::Event;

/// Material identifier.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MaterialId(pub AggregateId);

impl MaterialId {
    pub fn new(id: AggregateId) -> Self {
        Self(id)
    }
}

impl core::fmt::Display for MaterialId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

/// Ledger identifier (aggregate id). One ledger stream covers all materials.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MaterialLedgerId(pub AggregateId);

impl MaterialLedgerId {
    pub fn new(id: AggregateId) -> Self {
        Self(id)
    }
}

impl core::fmt::Display for MaterialLedgerId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

/// One (material, quantity) pair within an order's bill of materials.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaterialLine {
    pub material_id: MaterialId,
    pub quantity: u32,
}

/// Merge duplicate material ids by summing quantities, preserving first-seen
/// order. `[{A,3},{A,2}]` becomes `[{A,5}]`. A merged quantity that would
/// overflow is rejected rather than clamped.
pub fn merge_lines(lines: &[MaterialLine]) -> Result<Vec<MaterialLine>, DomainError> {
    let mut merged: Vec<MaterialLine> = Vec::with_capacity(lines.len());
    for line in lines {
        match merged.iter_mut().find(|l| l.material_id == line.material_id) {
            Some(existing) => {
                existing.quantity = existing
                    .quantity
                    .checked_add(line.quantity)
                    .ok_or_else(|| DomainError::validation("merged line quantity overflows"))?;
            }
            None => merged.push(*line),
        }
    }
    Ok(merged)
}

/// Per-material stock record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaterialRecord {
    pub id: MaterialId,
    pub name: String,
    pub category: String,
    /// Unit cost in smallest currency unit (e.g., cents).
    pub unit_cost_cents: u64,
    pub on_hand: u32,
    pub min_threshold: Option<u32>,
}

/// Aggregate root: MaterialLedger.
///
/// Owns quantity-on-hand for every material. Consumption for an order is a
/// single event covering all lines, so deduction is all-or-nothing and a
/// given order's batch is consumed at most once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MaterialLedger {
    id: MaterialLedgerId,
    materials: BTreeMap<MaterialId, MaterialRecord>,
    /// Lines currently consumed per order, kept for compensating restores.
    consumed: BTreeMap<AggregateId, Vec<MaterialLine>>,
    version: u64,
}

impl MaterialLedger {
    /// Empty aggregate for rehydration.
    pub fn empty(id: MaterialLedgerId) -> Self {
        Self {
            id,
            materials: BTreeMap::new(),
            consumed: BTreeMap::new(),
            version: 0,
        }
    }

    pub fn id_typed(&self) -> MaterialLedgerId {
        self.id
    }

    pub fn material(&self, id: &MaterialId) -> Option<&MaterialRecord> {
        self.materials.get(id)
    }

    pub fn on_hand(&self, id: &MaterialId) -> Option<u32> {
        self.materials.get(id).map(|m| m.on_hand)
    }

    pub fn unit_cost_cents(&self, id: &MaterialId) -> Option<u64> {
        self.materials.get(id).map(|m| m.unit_cost_cents)
    }

    pub fn materials(&self) -> impl Iterator<Item = &MaterialRecord> {
        self.materials.values()
    }

    /// Whether this order's consumption is currently applied (not restored).
    pub fn has_consumed(&self, order_ref: &AggregateId) -> bool {
        self.consumed.contains_key(order_ref)
    }
}

impl AggregateRoot for MaterialLedger {
    type Id = MaterialLedgerId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

/// Command: RegisterMaterial.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterMaterial {
    pub ledger_id: MaterialLedgerId,
    pub material_id: MaterialId,
    pub name: String,
    pub category: String,
    pub unit_cost_cents: u64,
    pub initial_on_hand: u32,
    pub min_threshold: Option<u32>,
    pub occurred_at: DateTime<Utc>,
}

/// Command: ReceiveStock (goods receipt; adds quantity).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiveStock {
    pub ledger_id: MaterialLedgerId,
    pub material_id: MaterialId,
    pub quantity: u32,
    pub occurred_at: DateTime<Utc>,
}

/// Command: AdjustStock (manual correction; signed delta).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdjustStock {
    pub ledger_id: MaterialLedgerId,
    pub material_id: MaterialId,
    pub delta: i64,
    pub occurred_at: DateTime<Utc>,
}

/// Command: ConsumeForOrder (atomic check-and-deduct across all lines).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumeForOrder {
    pub ledger_id: MaterialLedgerId,
    pub order_ref: AggregateId,
    pub lines: Vec<MaterialLine>,
    pub occurred_at: DateTime<Utc>,
}

/// Command: RestoreForOrder (compensating inverse of ConsumeForOrder).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoreForOrder {
    pub ledger_id: MaterialLedgerId,
    pub order_ref: AggregateId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LedgerCommand {
    RegisterMaterial(RegisterMaterial),
    ReceiveStock(ReceiveStock),
    AdjustStock(AdjustStock),
    ConsumeForOrder(ConsumeForOrder),
    RestoreForOrder(RestoreForOrder),
}

/// Event: MaterialRegistered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaterialRegistered {
    pub ledger_id: MaterialLedgerId,
    pub material_id: MaterialId,
    pub name: String,
    pub category: String,
    pub unit_cost_cents: u64,
    pub initial_on_hand: u32,
    pub min_threshold: Option<u32>,
    pub occurred_at: DateTime<Utc>,
}

/// Event: StockReceived.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockReceived {
    pub ledger_id: MaterialLedgerId,
    pub material_id: MaterialId,
    pub quantity: u32,
    pub occurred_at: DateTime<Utc>,
}

/// Event: StockAdjusted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockAdjusted {
    pub ledger_id: MaterialLedgerId,
    pub material_id: MaterialId,
    pub delta: i64,
    pub occurred_at: DateTime<Utc>,
}

/// Event: StockConsumed. One event covers every line of the order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockConsumed {
    pub ledger_id: MaterialLedgerId,
    pub order_ref: AggregateId,
    pub lines: Vec<MaterialLine>,
    pub occurred_at: DateTime<Utc>,
}

/// Event: StockRestored. Carries the exact lines being added back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockRestored {
    pub ledger_id: MaterialLedgerId,
    pub order_ref: AggregateId,
    pub lines: Vec<MaterialLine>,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LedgerEvent {
    MaterialRegistered(MaterialRegistered),
    StockReceived(StockReceived),
    StockAdjusted(StockAdjusted),
    StockConsumed(StockConsumed),
    StockRestored(StockRestored),
}

impl Event for LedgerEvent {
    fn event_type(&self) -> &'static str {
        match self {
            LedgerEvent::MaterialRegistered(_) => "materials.ledger.material_registered",
            LedgerEvent::StockReceived(_) => "materials.ledger.stock_received",
            LedgerEvent::StockAdjusted(_) => "materials.ledger.stock_adjusted",
            LedgerEvent::StockConsumed(_) => "materials.ledger.stock_consumed",
            LedgerEvent::StockRestored(_) => "materials.ledger.stock_restored",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            LedgerEvent::MaterialRegistered(e) => e.occurred_at,
            LedgerEvent::StockReceived(e) => e.occurred_at,
            LedgerEvent::StockAdjusted(e) => e.occurred_at,
            LedgerEvent::StockConsumed(e) => e.occurred_at,
            LedgerEvent::StockRestored(e) => e.occurred_at,
        }
    }
}

impl Aggregate for MaterialLedger {
    type Command = LedgerCommand;
    type Event = LedgerEvent;
    type Error = DomainError;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            LedgerEvent::MaterialRegistered(e) => {
                self.materials.insert(
                    e.material_id,
                    MaterialRecord {
                        id: e.material_id,
                        name: e.name.clone(),
                        category: e.category.clone(),
                        unit_cost_cents: e.unit_cost_cents,
                        on_hand: e.initial_on_hand,
                        min_threshold: e.min_threshold,
                    },
                );
            }
            LedgerEvent::StockReceived(e) => {
                if let Some(m) = self.materials.get_mut(&e.material_id) {
                    m.on_hand = m.on_hand.saturating_add(e.quantity);
                }
            }
            LedgerEvent::StockAdjusted(e) => {
                if let Some(m) = self.materials.get_mut(&e.material_id) {
                    let next = i64::from(m.on_hand) + e.delta;
                    m.on_hand = u32::try_from(next.max(0)).unwrap_or(u32::MAX);
                }
            }
            LedgerEvent::StockConsumed(e) => {
                for line in &e.lines {
                    if let Some(m) = self.materials.get_mut(&line.material_id) {
                        m.on_hand = m.on_hand.saturating_sub(line.quantity);
                    }
                }
                self.consumed.insert(e.order_ref, e.lines.clone());
            }
            LedgerEvent::StockRestored(e) => {
                for line in &e.lines {
                    if let Some(m) = self.materials.get_mut(&line.material_id) {
                        m.on_hand = m.on_hand.saturating_add(line.quantity);
                    }
                }
                self.consumed.remove(&e.order_ref);
            }
        }

        // Deterministic version tracking: +1 per applied event.
        self.version += 1;
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        match command {
            LedgerCommand::RegisterMaterial(cmd) => self.handle_register(cmd),
            LedgerCommand::ReceiveStock(cmd) => self.handle_receive(cmd),
            LedgerCommand::AdjustStock(cmd) => self.handle_adjust(cmd),
            LedgerCommand::ConsumeForOrder(cmd) => self.handle_consume(cmd),
            LedgerCommand::RestoreForOrder(cmd) => self.handle_restore(cmd),
        }
    }
}

impl MaterialLedger {
    fn ensure_ledger_id(&self, ledger_id: MaterialLedgerId) -> Result<(), DomainError> {
        if self.id != ledger_id {
            return Err(DomainError::conflict("ledger_id mismatch"));
        }
        Ok(())
    }

    fn handle_register(&self, cmd: &RegisterMaterial) -> Result<Vec<LedgerEvent>, DomainError> {
        self.ensure_ledger_id(cmd.ledger_id)?;

        if cmd.name.trim().is_empty() {
            return Err(DomainError::validation("material name cannot be empty"));
        }
        if self.materials.contains_key(&cmd.material_id) {
            return Err(DomainError::conflict(format!(
                "material {} already registered",
                cmd.material_id
            )));
        }

        Ok(vec![LedgerEvent::MaterialRegistered(MaterialRegistered {
            ledger_id: cmd.ledger_id,
            material_id: cmd.material_id,
            name: cmd.name.clone(),
            category: cmd.category.clone(),
            unit_cost_cents: cmd.unit_cost_cents,
            initial_on_hand: cmd.initial_on_hand,
            min_threshold: cmd.min_threshold,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_receive(&self, cmd: &ReceiveStock) -> Result<Vec<LedgerEvent>, DomainError> {
        self.ensure_ledger_id(cmd.ledger_id)?;

        let record = self
            .materials
            .get(&cmd.material_id)
            .ok_or_else(DomainError::not_found)?;

        if cmd.quantity == 0 {
            return Err(DomainError::validation("quantity must be positive"));
        }
        if record.on_hand.checked_add(cmd.quantity).is_none() {
            return Err(DomainError::validation("stock would overflow"));
        }

        Ok(vec![LedgerEvent::StockReceived(StockReceived {
            ledger_id: cmd.ledger_id,
            material_id: cmd.material_id,
            quantity: cmd.quantity,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_adjust(&self, cmd: &AdjustStock) -> Result<Vec<LedgerEvent>, DomainError> {
        self.ensure_ledger_id(cmd.ledger_id)?;

        let record = self
            .materials
            .get(&cmd.material_id)
            .ok_or_else(DomainError::not_found)?;

        if cmd.delta == 0 {
            return Err(DomainError::validation("delta cannot be zero"));
        }

        let next = i64::from(record.on_hand) + cmd.delta;
        if next < 0 {
            // Quantity on hand is never allowed below zero, not even by manual correction.
            return Err(DomainError::insufficient_stock(
                cmd.material_id,
                cmd.delta.unsigned_abs().min(u64::from(u32::MAX)) as u32,
                record.on_hand,
            ));
        }
        if next > i64::from(u32::MAX) {
            return Err(DomainError::validation("stock would overflow"));
        }

        Ok(vec![LedgerEvent::StockAdjusted(StockAdjusted {
            ledger_id: cmd.ledger_id,
            material_id: cmd.material_id,
            delta: cmd.delta,
            occurred_at: cmd.occurred_at,
        })])
    }

    /// Verify every line, then emit one event deducting all of them.
    ///
    /// Sufficiency is checked against merged lines before anything is emitted,
    /// so a failure on the third line leaves the first two untouched.
    fn handle_consume(&self, cmd: &ConsumeForOrder) -> Result<Vec<LedgerEvent>, DomainError> {
        self.ensure_ledger_id(cmd.ledger_id)?;

        if cmd.lines.is_empty() {
            return Err(DomainError::validation("material lines cannot be empty"));
        }
        if self.consumed.contains_key(&cmd.order_ref) {
            return Err(DomainError::conflict(format!(
                "materials already consumed for order {}",
                cmd.order_ref
            )));
        }

        let merged = merge_lines(&cmd.lines)?;
        for line in &merged {
            if line.quantity == 0 {
                return Err(DomainError::validation("line quantity must be positive"));
            }
            let record = self
                .materials
                .get(&line.material_id)
                .ok_or_else(DomainError::not_found)?;
            if record.on_hand < line.quantity {
                return Err(DomainError::insufficient_stock(
                    line.material_id,
                    line.quantity,
                    record.on_hand,
                ));
            }
        }

        Ok(vec![LedgerEvent::StockConsumed(StockConsumed {
            ledger_id: cmd.ledger_id,
            order_ref: cmd.order_ref,
            lines: merged,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_restore(&self, cmd: &RestoreForOrder) -> Result<Vec<LedgerEvent>, DomainError> {
        self.ensure_ledger_id(cmd.ledger_id)?;

        let lines = self.consumed.get(&cmd.order_ref).ok_or_else(|| {
            DomainError::invalid_state(format!(
                "no consumed stock recorded for order {}",
                cmd.order_ref
            ))
        })?;

        Ok(vec![LedgerEvent::StockRestored(StockRestored {
            ledger_id: cmd.ledger_id,
            order_ref: cmd.order_ref,
            lines: lines.clone(),
            occurred_at: cmd.occurred_at,
        })])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use millwright_core::AggregateId;
    use proptest::prelude::*;

    fn test_ledger_id() -> MaterialLedgerId {
        MaterialLedgerId::new(AggregateId::new())
    }

    fn test_material_id() -> MaterialId {
        MaterialId::new(AggregateId::new())
    }

    fn test_time() -> DateTime<Utc> {
        Utc::now()
    }

    fn ledger_with(materials: &[(MaterialId, &str, u64, u32)]) -> (MaterialLedger, MaterialLedgerId) {
        let ledger_id = test_ledger_id();
        let mut ledger = MaterialLedger::empty(ledger_id);
        for (id, name, cost, on_hand) in materials {
            let events = ledger
                .handle(&LedgerCommand::RegisterMaterial(RegisterMaterial {
                    ledger_id,
                    material_id: *id,
                    name: name.to_string(),
                    category: "raw".to_string(),
                    unit_cost_cents: *cost,
                    initial_on_hand: *on_hand,
                    min_threshold: None,
                    occurred_at: test_time(),
                }))
                .unwrap();
            for e in &events {
                ledger.apply(e);
            }
        }
        (ledger, ledger_id)
    }

    fn consume(
        ledger: &MaterialLedger,
        ledger_id: MaterialLedgerId,
        order_ref: AggregateId,
        lines: Vec<MaterialLine>,
    ) -> Result<Vec<LedgerEvent>, DomainError> {
        ledger.handle(&LedgerCommand::ConsumeForOrder(ConsumeForOrder {
            ledger_id,
            order_ref,
            lines,
            occurred_at: test_time(),
        }))
    }

    #[test]
    fn consume_deducts_every_line_atomically() {
        let screw = test_material_id();
        let hinge = test_material_id();
        let (mut ledger, ledger_id) = ledger_with(&[(screw, "Screw", 5, 100), (hinge, "Hinge", 120, 5)]);

        let order = AggregateId::new();
        let events = consume(
            &ledger,
            ledger_id,
            order,
            vec![
                MaterialLine { material_id: screw, quantity: 50 },
                MaterialLine { material_id: hinge, quantity: 5 },
            ],
        )
        .unwrap();
        assert_eq!(events.len(), 1);
        for e in &events {
            ledger.apply(e);
        }

        assert_eq!(ledger.on_hand(&screw), Some(50));
        assert_eq!(ledger.on_hand(&hinge), Some(0));
        assert!(ledger.has_consumed(&order));
    }

    #[test]
    fn insufficient_stock_aborts_whole_consume_and_names_material() {
        let plank = test_material_id();
        let (ledger, ledger_id) = ledger_with(&[(plank, "Wood-Plank", 300, 10)]);

        let err = consume(
            &ledger,
            ledger_id,
            AggregateId::new(),
            vec![MaterialLine { material_id: plank, quantity: 12 }],
        )
        .unwrap_err();

        match err {
            DomainError::InsufficientStock { material_id, requested, on_hand } => {
                assert_eq!(material_id, plank.to_string());
                assert_eq!(requested, 12);
                assert_eq!(on_hand, 10);
            }
            other => panic!("expected InsufficientStock, got {other:?}"),
        }
        // Nothing changed: handle never mutates.
        assert_eq!(ledger.on_hand(&plank), Some(10));
    }

    #[test]
    fn failing_line_leaves_earlier_lines_untouched() {
        let screw = test_material_id();
        let plank = test_material_id();
        let (ledger, ledger_id) = ledger_with(&[(screw, "Screw", 5, 100), (plank, "Wood-Plank", 300, 2)]);

        let err = consume(
            &ledger,
            ledger_id,
            AggregateId::new(),
            vec![
                MaterialLine { material_id: screw, quantity: 10 },
                MaterialLine { material_id: plank, quantity: 5 },
            ],
        )
        .unwrap_err();

        assert!(matches!(err, DomainError::InsufficientStock { .. }));
        assert_eq!(ledger.on_hand(&screw), Some(100));
        assert_eq!(ledger.on_hand(&plank), Some(2));
    }

    #[test]
    fn consume_twice_for_one_order_is_rejected() {
        let screw = test_material_id();
        let (mut ledger, ledger_id) = ledger_with(&[(screw, "Screw", 5, 100)]);
        let order = AggregateId::new();
        let lines = vec![MaterialLine { material_id: screw, quantity: 10 }];

        let events = consume(&ledger, ledger_id, order, lines.clone()).unwrap();
        for e in &events {
            ledger.apply(e);
        }

        let err = consume(&ledger, ledger_id, order, lines).unwrap_err();
        assert!(matches!(err, DomainError::Conflict(_)));
        assert_eq!(ledger.on_hand(&screw), Some(90));
    }

    #[test]
    fn overflowing_merged_lines_are_rejected() {
        let screw = test_material_id();
        let (ledger, ledger_id) = ledger_with(&[(screw, "Screw", 5, 100)]);

        let err = consume(
            &ledger,
            ledger_id,
            AggregateId::new(),
            vec![
                MaterialLine { material_id: screw, quantity: u32::MAX },
                MaterialLine { material_id: screw, quantity: 1 },
            ],
        )
        .unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));
    }

    #[test]
    fn duplicate_lines_are_merged_before_checking() {
        let screw = test_material_id();
        let (ledger, ledger_id) = ledger_with(&[(screw, "Screw", 5, 4)]);

        // 3 + 2 merged = 5 > 4 on hand: must fail even though each line alone fits.
        let err = consume(
            &ledger,
            ledger_id,
            AggregateId::new(),
            vec![
                MaterialLine { material_id: screw, quantity: 3 },
                MaterialLine { material_id: screw, quantity: 2 },
            ],
        )
        .unwrap_err();
        assert!(matches!(err, DomainError::InsufficientStock { .. }));
    }

    #[test]
    fn restore_reverts_exactly_what_was_consumed() {
        let screw = test_material_id();
        let hinge = test_material_id();
        let (mut ledger, ledger_id) = ledger_with(&[(screw, "Screw", 5, 100), (hinge, "Hinge", 120, 5)]);
        let order = AggregateId::new();

        let events = consume(
            &ledger,
            ledger_id,
            order,
            vec![
                MaterialLine { material_id: screw, quantity: 40 },
                MaterialLine { material_id: hinge, quantity: 2 },
            ],
        )
        .unwrap();
        for e in &events {
            ledger.apply(e);
        }

        let events = ledger
            .handle(&LedgerCommand::RestoreForOrder(RestoreForOrder {
                ledger_id,
                order_ref: order,
                occurred_at: test_time(),
            }))
            .unwrap();
        for e in &events {
            ledger.apply(e);
        }

        assert_eq!(ledger.on_hand(&screw), Some(100));
        assert_eq!(ledger.on_hand(&hinge), Some(5));
        assert!(!ledger.has_consumed(&order));
    }

    #[test]
    fn restore_without_prior_consume_is_rejected() {
        let screw = test_material_id();
        let (ledger, ledger_id) = ledger_with(&[(screw, "Screw", 5, 100)]);

        let err = ledger
            .handle(&LedgerCommand::RestoreForOrder(RestoreForOrder {
                ledger_id,
                order_ref: AggregateId::new(),
                occurred_at: test_time(),
            }))
            .unwrap_err();
        assert!(matches!(err, DomainError::InvalidState(_)));
    }

    #[test]
    fn unknown_material_in_lines_is_not_found() {
        let screw = test_material_id();
        let (ledger, ledger_id) = ledger_with(&[(screw, "Screw", 5, 100)]);

        let err = consume(
            &ledger,
            ledger_id,
            AggregateId::new(),
            vec![MaterialLine { material_id: test_material_id(), quantity: 1 }],
        )
        .unwrap_err();
        assert_eq!(err, DomainError::NotFound);
    }

    #[test]
    fn adjust_below_zero_is_rejected() {
        let screw = test_material_id();
        let (ledger, ledger_id) = ledger_with(&[(screw, "Screw", 5, 3)]);

        let err = ledger
            .handle(&LedgerCommand::AdjustStock(AdjustStock {
                ledger_id,
                material_id: screw,
                delta: -4,
                occurred_at: test_time(),
            }))
            .unwrap_err();
        assert!(matches!(err, DomainError::InsufficientStock { .. }));
    }

    #[test]
    fn register_duplicate_material_is_rejected() {
        let screw = test_material_id();
        let (ledger, ledger_id) = ledger_with(&[(screw, "Screw", 5, 3)]);

        let err = ledger
            .handle(&LedgerCommand::RegisterMaterial(RegisterMaterial {
                ledger_id,
                material_id: screw,
                name: "Screw".to_string(),
                category: "raw".to_string(),
                unit_cost_cents: 5,
                initial_on_hand: 0,
                min_threshold: None,
                occurred_at: test_time(),
            }))
            .unwrap_err();
        assert!(matches!(err, DomainError::Conflict(_)));
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 256,
            ..ProptestConfig::default()
        })]

        /// Property: for any sequence of consume/restore attempts against a
        /// registered material, quantity on hand never goes negative (it is a
        /// u32 throughout) and always equals the oracle
        /// `initial - consumed_applied`.
        #[test]
        fn stock_never_negative_under_random_consumes(
            initial in 0u32..1_000,
            requests in prop::collection::vec((1u32..200, prop::bool::ANY), 1..20)
        ) {
            let ledger_id = test_ledger_id();
            let material_id = test_material_id();
            let mut ledger = MaterialLedger::empty(ledger_id);

            let events = ledger.handle(&LedgerCommand::RegisterMaterial(RegisterMaterial {
                ledger_id,
                material_id,
                name: "Widget".to_string(),
                category: "raw".to_string(),
                unit_cost_cents: 10,
                initial_on_hand: initial,
                min_threshold: None,
                occurred_at: test_time(),
            })).unwrap();
            for e in &events {
                ledger.apply(e);
            }

            let mut outstanding: Vec<(AggregateId, u32)> = Vec::new();
            let mut expected = initial;

            for (qty, restore_first) in requests {
                if restore_first {
                    if let Some((order, restored_qty)) = outstanding.pop() {
                        let events = ledger.handle(&LedgerCommand::RestoreForOrder(RestoreForOrder {
                            ledger_id,
                            order_ref: order,
                            occurred_at: test_time(),
                        })).unwrap();
                        for e in &events {
                            ledger.apply(e);
                        }
                        expected += restored_qty;
                    }
                }

                let order = AggregateId::new();
                let result = ledger.handle(&LedgerCommand::ConsumeForOrder(ConsumeForOrder {
                    ledger_id,
                    order_ref: order,
                    lines: vec![MaterialLine { material_id, quantity: qty }],
                    occurred_at: test_time(),
                }));

                match result {
                    Ok(events) => {
                        prop_assert!(qty <= expected);
                        for e in &events {
                            ledger.apply(e);
                        }
                        expected -= qty;
                        outstanding.push((order, qty));
                    }
                    Err(DomainError::InsufficientStock { .. }) => {
                        prop_assert!(qty > expected);
                    }
                    Err(other) => return Err(TestCaseError::fail(format!("unexpected error: {other:?}"))),
                }

                prop_assert_eq!(ledger.on_hand(&material_id), Some(expected));
            }
        }
    }
}
