use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use millwright_core::{Aggregate, AggregateId, AggregateRoot, DomainError};
use millwright_events::Event;
use millwright_materials::{MaterialLine, merge_lines};

/// Production order identifier.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProductionOrderId(pub AggregateId);

impl ProductionOrderId {
    pub fn new(id: AggregateId) -> Self {
        Self(id)
    }
}

impl core::fmt::Display for ProductionOrderId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

/// Production order lifecycle. Transitions are strictly forward:
/// Pending → InProgress → Completed, nothing else.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProductionStatus {
    Pending,
    InProgress,
    Completed,
}

/// Mutable order fields, replaced as a unit by create/revise.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderFields {
    pub product_name: String,
    pub quantity: u32,
    pub material_lines: Vec<MaterialLine>,
    /// Derived: Σ line quantity × material unit cost, in cents. Computed by
    /// the registry against current ledger costs, stored with the event.
    pub estimated_cost_cents: u64,
    /// Price in smallest currency unit (e.g., cents).
    pub sale_price_cents: u64,
    pub estimated_days: u32,
    pub image_ref: Option<String>,
}

/// Aggregate root: ProductionOrder.
///
/// Orders are never destroyed; the event stream is the audit record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProductionOrder {
    id: ProductionOrderId,
    sequence_no: u64,
    fields: OrderFields,
    status: ProductionStatus,
    progress_pct: u8,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    version: u64,
    created: bool,
}

impl ProductionOrder {
    /// Create an empty, not-yet-created aggregate instance for rehydration.
    pub fn empty(id: ProductionOrderId) -> Self {
        Self {
            id,
            sequence_no: 0,
            fields: OrderFields {
                product_name: String::new(),
                quantity: 0,
                material_lines: Vec::new(),
                estimated_cost_cents: 0,
                sale_price_cents: 0,
                estimated_days: 0,
                image_ref: None,
            },
            status: ProductionStatus::Pending,
            progress_pct: 0,
            created_at: DateTime::<Utc>::MIN_UTC,
            updated_at: DateTime::<Utc>::MIN_UTC,
            version: 0,
            created: false,
        }
    }

    pub fn id_typed(&self) -> ProductionOrderId {
        self.id
    }

    pub fn exists(&self) -> bool {
        self.created
    }

    pub fn sequence_no(&self) -> u64 {
        self.sequence_no
    }

    pub fn status(&self) -> ProductionStatus {
        self.status
    }

    pub fn progress_pct(&self) -> u8 {
        self.progress_pct
    }

    pub fn fields(&self) -> &OrderFields {
        &self.fields
    }

    pub fn material_lines(&self) -> &[MaterialLine] {
        &self.fields.material_lines
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    /// Material lines (and the rest of the draft fields) are mutable only
    /// while the order is Pending.
    pub fn is_modifiable(&self) -> bool {
        matches!(self.status, ProductionStatus::Pending)
    }
}

impl AggregateRoot for ProductionOrder {
    type Id = ProductionOrderId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

/// Command: CreateOrder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateOrder {
    pub order_id: ProductionOrderId,
    /// Monotonic human-facing number, assigned by the registry.
    pub sequence_no: u64,
    pub fields: OrderFields,
    pub occurred_at: DateTime<Utc>,
}

/// Command: ReviseOrder. Fully replaces the mutable fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviseOrder {
    pub order_id: ProductionOrderId,
    pub fields: OrderFields,
    pub occurred_at: DateTime<Utc>,
}

/// Command: StartProduction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartProduction {
    pub order_id: ProductionOrderId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: ReportProgress (advisory; never moves state).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportProgress {
    pub order_id: ProductionOrderId,
    pub progress_pct: u8,
    pub occurred_at: DateTime<Utc>,
}

/// Command: CompleteProduction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompleteProduction {
    pub order_id: ProductionOrderId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderCommand {
    CreateOrder(CreateOrder),
    ReviseOrder(ReviseOrder),
    StartProduction(StartProduction),
    ReportProgress(ReportProgress),
    CompleteProduction(CompleteProduction),
}

/// Event: OrderCreated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderCreated {
    pub order_id: ProductionOrderId,
    pub sequence_no: u64,
    pub fields: OrderFields,
    pub occurred_at: DateTime<Utc>,
}

/// Event: OrderRevised.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderRevised {
    pub order_id: ProductionOrderId,
    pub fields: OrderFields,
    pub occurred_at: DateTime<Utc>,
}

/// Event: ProductionStarted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductionStarted {
    pub order_id: ProductionOrderId,
    pub occurred_at: DateTime<Utc>,
}

/// Event: ProgressReported.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressReported {
    pub order_id: ProductionOrderId,
    pub progress_pct: u8,
    pub occurred_at: DateTime<Utc>,
}

/// Event: ProductionCompleted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductionCompleted {
    pub order_id: ProductionOrderId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderEvent {
    OrderCreated(OrderCreated),
    OrderRevised(OrderRevised),
    ProductionStarted(ProductionStarted),
    ProgressReported(ProgressReported),
    ProductionCompleted(ProductionCompleted),
}

impl Event for OrderEvent {
    fn event_type(&self) -> &'static str {
        match self {
            OrderEvent::OrderCreated(_) => "orders.production_order.created",
            OrderEvent::OrderRevised(_) => "orders.production_order.revised",
            OrderEvent::ProductionStarted(_) => "orders.production_order.started",
            OrderEvent::ProgressReported(_) => "orders.production_order.progress_reported",
            OrderEvent::ProductionCompleted(_) => "orders.production_order.completed",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            OrderEvent::OrderCreated(e) => e.occurred_at,
            OrderEvent::OrderRevised(e) => e.occurred_at,
            OrderEvent::ProductionStarted(e) => e.occurred_at,
            OrderEvent::ProgressReported(e) => e.occurred_at,
            OrderEvent::ProductionCompleted(e) => e.occurred_at,
        }
    }
}

impl Aggregate for ProductionOrder {
    type Command = OrderCommand;
    type Event = OrderEvent;
    type Error = DomainError;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            OrderEvent::OrderCreated(e) => {
                self.id = e.order_id;
                self.sequence_no = e.sequence_no;
                self.fields = e.fields.clone();
                self.status = ProductionStatus::Pending;
                self.progress_pct = 0;
                self.created_at = e.occurred_at;
                self.updated_at = e.occurred_at;
                self.created = true;
            }
            OrderEvent::OrderRevised(e) => {
                self.fields = e.fields.clone();
                self.updated_at = e.occurred_at;
            }
            OrderEvent::ProductionStarted(e) => {
                self.status = ProductionStatus::InProgress;
                self.progress_pct = 0;
                self.updated_at = e.occurred_at;
            }
            OrderEvent::ProgressReported(e) => {
                self.progress_pct = e.progress_pct;
                self.updated_at = e.occurred_at;
            }
            OrderEvent::ProductionCompleted(e) => {
                self.status = ProductionStatus::Completed;
                self.progress_pct = 100;
                self.updated_at = e.occurred_at;
            }
        }

        // Deterministic version tracking: +1 per applied event.
        self.version += 1;
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        match command {
            OrderCommand::CreateOrder(cmd) => self.handle_create(cmd),
            OrderCommand::ReviseOrder(cmd) => self.handle_revise(cmd),
            OrderCommand::StartProduction(cmd) => self.handle_start(cmd),
            OrderCommand::ReportProgress(cmd) => self.handle_progress(cmd),
            OrderCommand::CompleteProduction(cmd) => self.handle_complete(cmd),
        }
    }
}

impl ProductionOrder {
    fn ensure_order_id(&self, order_id: ProductionOrderId) -> Result<(), DomainError> {
        if self.id != order_id {
            return Err(DomainError::conflict("order_id mismatch"));
        }
        Ok(())
    }

    /// Structural validation shared by create and revise. Returns the fields
    /// with duplicate material lines merged.
    fn validate_fields(fields: &OrderFields) -> Result<OrderFields, DomainError> {
        if fields.product_name.trim().is_empty() {
            return Err(DomainError::validation("product name cannot be empty"));
        }
        if fields.quantity == 0 {
            return Err(DomainError::validation("quantity must be positive"));
        }
        if fields.material_lines.is_empty() {
            return Err(DomainError::validation("material lines cannot be empty"));
        }
        for line in &fields.material_lines {
            if line.quantity == 0 {
                return Err(DomainError::validation(
                    "material line quantity must be positive",
                ));
            }
        }
        if fields.estimated_days == 0 {
            return Err(DomainError::validation(
                "estimated duration must be positive",
            ));
        }

        let mut merged = fields.clone();
        merged.material_lines = merge_lines(&fields.material_lines)?;
        Ok(merged)
    }

    fn handle_create(&self, cmd: &CreateOrder) -> Result<Vec<OrderEvent>, DomainError> {
        if self.created {
            return Err(DomainError::conflict("production order already exists"));
        }

        let fields = Self::validate_fields(&cmd.fields)?;

        Ok(vec![OrderEvent::OrderCreated(OrderCreated {
            order_id: cmd.order_id,
            sequence_no: cmd.sequence_no,
            fields,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_revise(&self, cmd: &ReviseOrder) -> Result<Vec<OrderEvent>, DomainError> {
        if !self.created {
            return Err(DomainError::not_found());
        }
        self.ensure_order_id(cmd.order_id)?;

        if !self.is_modifiable() {
            return Err(DomainError::invalid_state(
                "order can only be edited while pending",
            ));
        }

        let fields = Self::validate_fields(&cmd.fields)?;

        Ok(vec![OrderEvent::OrderRevised(OrderRevised {
            order_id: cmd.order_id,
            fields,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_start(&self, cmd: &StartProduction) -> Result<Vec<OrderEvent>, DomainError> {
        if !self.created {
            return Err(DomainError::not_found());
        }
        self.ensure_order_id(cmd.order_id)?;

        // Re-starting is rejected, never silently accepted: a second start
        // would mean a second material deduction.
        if self.status != ProductionStatus::Pending {
            return Err(DomainError::invalid_state(
                "only pending orders can start production",
            ));
        }

        Ok(vec![OrderEvent::ProductionStarted(ProductionStarted {
            order_id: cmd.order_id,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_progress(&self, cmd: &ReportProgress) -> Result<Vec<OrderEvent>, DomainError> {
        if !self.created {
            return Err(DomainError::not_found());
        }
        self.ensure_order_id(cmd.order_id)?;

        if self.status != ProductionStatus::InProgress {
            return Err(DomainError::invalid_state(
                "progress can only be reported while in progress",
            ));
        }
        if cmd.progress_pct > 100 {
            return Err(DomainError::validation("progress cannot exceed 100"));
        }
        if cmd.progress_pct < self.progress_pct {
            return Err(DomainError::validation("progress cannot decrease"));
        }

        Ok(vec![OrderEvent::ProgressReported(ProgressReported {
            order_id: cmd.order_id,
            progress_pct: cmd.progress_pct,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_complete(&self, cmd: &CompleteProduction) -> Result<Vec<OrderEvent>, DomainError> {
        if !self.created {
            return Err(DomainError::not_found());
        }
        self.ensure_order_id(cmd.order_id)?;

        // Re-completing is rejected: it would mean a second finished-goods item.
        if self.status != ProductionStatus::InProgress {
            return Err(DomainError::invalid_state(
                "only in-progress orders can be completed",
            ));
        }

        Ok(vec![OrderEvent::ProductionCompleted(ProductionCompleted {
            order_id: cmd.order_id,
            occurred_at: cmd.occurred_at,
        })])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use millwright_core::AggregateId;
    use millwright_materials::MaterialId;

    fn test_order_id() -> ProductionOrderId {
        ProductionOrderId::new(AggregateId::new())
    }

    fn test_material_id() -> MaterialId {
        MaterialId::new(AggregateId::new())
    }

    fn test_time() -> DateTime<Utc> {
        Utc::now()
    }

    fn test_fields(lines: Vec<MaterialLine>) -> OrderFields {
        OrderFields {
            product_name: "Cabinet".to_string(),
            quantity: 2,
            material_lines: lines,
            estimated_cost_cents: 1_500,
            sale_price_cents: 19_999,
            estimated_days: 7,
            image_ref: None,
        }
    }

    fn created_order(lines: Vec<MaterialLine>) -> (ProductionOrder, ProductionOrderId) {
        let order_id = test_order_id();
        let mut order = ProductionOrder::empty(order_id);
        let events = order
            .handle(&OrderCommand::CreateOrder(CreateOrder {
                order_id,
                sequence_no: 1,
                fields: test_fields(lines),
                occurred_at: test_time(),
            }))
            .unwrap();
        for e in &events {
            order.apply(e);
        }
        (order, order_id)
    }

    fn started_order(lines: Vec<MaterialLine>) -> (ProductionOrder, ProductionOrderId) {
        let (mut order, order_id) = created_order(lines);
        let events = order
            .handle(&OrderCommand::StartProduction(StartProduction {
                order_id,
                occurred_at: test_time(),
            }))
            .unwrap();
        for e in &events {
            order.apply(e);
        }
        (order, order_id)
    }

    fn line(material_id: MaterialId, quantity: u32) -> MaterialLine {
        MaterialLine { material_id, quantity }
    }

    #[test]
    fn create_assigns_pending_state_and_zero_progress() {
        let (order, _) = created_order(vec![line(test_material_id(), 3)]);
        assert_eq!(order.status(), ProductionStatus::Pending);
        assert_eq!(order.progress_pct(), 0);
        assert_eq!(order.sequence_no(), 1);
        assert_eq!(order.version(), 1);
    }

    #[test]
    fn duplicate_material_lines_are_merged_on_create() {
        let a = test_material_id();
        let (order, _) = created_order(vec![line(a, 3), line(a, 2)]);
        assert_eq!(order.material_lines(), &[line(a, 5)]);
    }

    #[test]
    fn create_rejects_empty_name_and_zero_quantities() {
        let order_id = test_order_id();
        let order = ProductionOrder::empty(order_id);

        let mut fields = test_fields(vec![line(test_material_id(), 1)]);
        fields.product_name = "   ".to_string();
        let err = order
            .handle(&OrderCommand::CreateOrder(CreateOrder {
                order_id,
                sequence_no: 1,
                fields,
                occurred_at: test_time(),
            }))
            .unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));

        let mut fields = test_fields(vec![line(test_material_id(), 0)]);
        fields.quantity = 1;
        let err = order
            .handle(&OrderCommand::CreateOrder(CreateOrder {
                order_id,
                sequence_no: 1,
                fields,
                occurred_at: test_time(),
            }))
            .unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));

        let fields = test_fields(vec![]);
        let err = order
            .handle(&OrderCommand::CreateOrder(CreateOrder {
                order_id,
                sequence_no: 1,
                fields,
                occurred_at: test_time(),
            }))
            .unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));
    }

    #[test]
    fn revise_replaces_fields_while_pending() {
        let a = test_material_id();
        let b = test_material_id();
        let (mut order, order_id) = created_order(vec![line(a, 3)]);

        let mut fields = test_fields(vec![line(b, 4)]);
        fields.product_name = "Bookshelf".to_string();
        fields.estimated_cost_cents = 2_200;
        let events = order
            .handle(&OrderCommand::ReviseOrder(ReviseOrder {
                order_id,
                fields: fields.clone(),
                occurred_at: test_time(),
            }))
            .unwrap();
        for e in &events {
            order.apply(e);
        }

        assert_eq!(order.fields().product_name, "Bookshelf");
        assert_eq!(order.fields().estimated_cost_cents, 2_200);
        assert_eq!(order.material_lines(), &[line(b, 4)]);
    }

    #[test]
    fn revise_after_start_is_rejected() {
        let (order, order_id) = started_order(vec![line(test_material_id(), 3)]);

        let err = order
            .handle(&OrderCommand::ReviseOrder(ReviseOrder {
                order_id,
                fields: test_fields(vec![line(test_material_id(), 1)]),
                occurred_at: test_time(),
            }))
            .unwrap_err();
        assert!(matches!(err, DomainError::InvalidState(_)));
    }

    #[test]
    fn start_twice_is_rejected() {
        let (order, order_id) = started_order(vec![line(test_material_id(), 3)]);

        let err = order
            .handle(&OrderCommand::StartProduction(StartProduction {
                order_id,
                occurred_at: test_time(),
            }))
            .unwrap_err();
        assert!(matches!(err, DomainError::InvalidState(_)));
    }

    #[test]
    fn complete_requires_in_progress() {
        let (order, order_id) = created_order(vec![line(test_material_id(), 3)]);

        let err = order
            .handle(&OrderCommand::CompleteProduction(CompleteProduction {
                order_id,
                occurred_at: test_time(),
            }))
            .unwrap_err();
        assert!(matches!(err, DomainError::InvalidState(_)));
    }

    #[test]
    fn complete_twice_is_rejected() {
        let (mut order, order_id) = started_order(vec![line(test_material_id(), 3)]);

        let events = order
            .handle(&OrderCommand::CompleteProduction(CompleteProduction {
                order_id,
                occurred_at: test_time(),
            }))
            .unwrap();
        for e in &events {
            order.apply(e);
        }
        assert_eq!(order.status(), ProductionStatus::Completed);
        assert_eq!(order.progress_pct(), 100);

        let err = order
            .handle(&OrderCommand::CompleteProduction(CompleteProduction {
                order_id,
                occurred_at: test_time(),
            }))
            .unwrap_err();
        assert!(matches!(err, DomainError::InvalidState(_)));
    }

    #[test]
    fn progress_is_monotonic_and_advisory() {
        let (mut order, order_id) = started_order(vec![line(test_material_id(), 3)]);

        let events = order
            .handle(&OrderCommand::ReportProgress(ReportProgress {
                order_id,
                progress_pct: 40,
                occurred_at: test_time(),
            }))
            .unwrap();
        for e in &events {
            order.apply(e);
        }
        assert_eq!(order.progress_pct(), 40);
        // Progress never moves state by itself.
        assert_eq!(order.status(), ProductionStatus::InProgress);

        let err = order
            .handle(&OrderCommand::ReportProgress(ReportProgress {
                order_id,
                progress_pct: 30,
                occurred_at: test_time(),
            }))
            .unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));

        let err = order
            .handle(&OrderCommand::ReportProgress(ReportProgress {
                order_id,
                progress_pct: 101,
                occurred_at: test_time(),
            }))
            .unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));
    }

    #[test]
    fn progress_at_100_does_not_complete_the_order() {
        let (mut order, order_id) = started_order(vec![line(test_material_id(), 3)]);

        let events = order
            .handle(&OrderCommand::ReportProgress(ReportProgress {
                order_id,
                progress_pct: 100,
                occurred_at: test_time(),
            }))
            .unwrap();
        for e in &events {
            order.apply(e);
        }
        assert_eq!(order.progress_pct(), 100);
        assert_eq!(order.status(), ProductionStatus::InProgress);
    }

    #[test]
    fn progress_outside_in_progress_is_rejected() {
        let (order, order_id) = created_order(vec![line(test_material_id(), 3)]);

        let err = order
            .handle(&OrderCommand::ReportProgress(ReportProgress {
                order_id,
                progress_pct: 10,
                occurred_at: test_time(),
            }))
            .unwrap_err();
        assert!(matches!(err, DomainError::InvalidState(_)));
    }

    #[test]
    fn handle_does_not_mutate_state() {
        let (order, order_id) = created_order(vec![line(test_material_id(), 3)]);
        let before = order.clone();

        let _ = order.handle(&OrderCommand::StartProduction(StartProduction {
            order_id,
            occurred_at: test_time(),
        }));
        assert_eq!(order, before);
    }

    #[test]
    fn apply_is_deterministic() {
        let order_id = test_order_id();
        let a = test_material_id();
        let created = OrderEvent::OrderCreated(OrderCreated {
            order_id,
            sequence_no: 7,
            fields: test_fields(vec![line(a, 3)]),
            occurred_at: test_time(),
        });
        let started = OrderEvent::ProductionStarted(ProductionStarted {
            order_id,
            occurred_at: test_time(),
        });

        let mut one = ProductionOrder::empty(order_id);
        one.apply(&created);
        one.apply(&started);

        let mut two = ProductionOrder::empty(order_id);
        two.apply(&created);
        two.apply(&started);

        assert_eq!(one, two);
        assert_eq!(one.status(), ProductionStatus::InProgress);
        assert_eq!(one.version(), 2);
    }
}
