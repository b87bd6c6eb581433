use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use procura_core::{Aggregate, AggregateRoot, DomainError, TenantId, typed_aggregate_id};
use procura_events::Event;
use procura_receiving::{
    Adjustment, Closure, LineLedger, LineReceipt, LocationId, NewLine, reconcile,
};

typed_aggregate_id!(
    /// Purchase order identifier (tenant-scoped via `tenant_id` fields in events/commands).
    PurchaseOrderId
);

typed_aggregate_id!(
    /// Supplier the goods are ordered from.
    SupplierId
);

/// Purchase order status lifecycle.
///
/// ```text
/// draft --mark_ordered--> ordered --receive--> partially_received --receive--> received
///   |                        |                                                  ^
///   +--cancel--+   +--cancel-+                 ordered --receive (all closed)---+
///              v   v
///            cancelled
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PurchaseOrderStatus {
    Draft,
    Ordered,
    PartiallyReceived,
    Received,
    Cancelled,
}

impl PurchaseOrderStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            PurchaseOrderStatus::Draft => "draft",
            PurchaseOrderStatus::Ordered => "ordered",
            PurchaseOrderStatus::PartiallyReceived => "partially_received",
            PurchaseOrderStatus::Received => "received",
            PurchaseOrderStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            PurchaseOrderStatus::Received | PurchaseOrderStatus::Cancelled
        )
    }

    pub fn accepts_receipts(self) -> bool {
        matches!(
            self,
            PurchaseOrderStatus::Ordered | PurchaseOrderStatus::PartiallyReceived
        )
    }

    pub fn can_cancel(self) -> bool {
        matches!(self, PurchaseOrderStatus::Draft | PurchaseOrderStatus::Ordered)
    }

    /// Status after a receipt left the lines in `closure`.
    ///
    /// Monotone: an untouched ledger keeps the current status, so a receipt
    /// never moves an order back to `ordered`.
    pub fn after_receipt(self, closure: Closure) -> Self {
        match closure {
            Closure::Closed => PurchaseOrderStatus::Received,
            Closure::Partial => PurchaseOrderStatus::PartiallyReceived,
            Closure::Untouched => self,
        }
    }
}

impl core::fmt::Display for PurchaseOrderStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Aggregate root: PurchaseOrder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PurchaseOrder {
    id: PurchaseOrderId,
    tenant_id: Option<TenantId>,
    supplier_id: Option<SupplierId>,
    destination: Option<LocationId>,
    status: PurchaseOrderStatus,
    ledger: LineLedger,
    version: u64,
    created: bool,
    deleted: bool,
}

impl PurchaseOrder {
    /// Create an empty, not-yet-created aggregate instance for rehydration.
    pub fn empty(id: PurchaseOrderId) -> Self {
        Self {
            id,
            tenant_id: None,
            supplier_id: None,
            destination: None,
            status: PurchaseOrderStatus::Draft,
            ledger: LineLedger::default(),
            version: 0,
            created: false,
            deleted: false,
        }
    }

    pub fn id_typed(&self) -> PurchaseOrderId {
        self.id
    }

    pub fn tenant_id(&self) -> Option<TenantId> {
        self.tenant_id
    }

    pub fn supplier_id(&self) -> Option<SupplierId> {
        self.supplier_id
    }

    pub fn destination(&self) -> Option<LocationId> {
        self.destination
    }

    pub fn status(&self) -> PurchaseOrderStatus {
        self.status
    }

    pub fn ledger(&self) -> &LineLedger {
        &self.ledger
    }

    /// Whether the order exists (created and not deleted).
    pub fn exists(&self) -> bool {
        self.created && !self.deleted
    }

    fn label(&self) -> String {
        format!("purchase order {}", self.id)
    }
}

impl AggregateRoot for PurchaseOrder {
    type Id = PurchaseOrderId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

/// Command: CreatePurchaseOrder (lines are fixed at creation).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreatePurchaseOrder {
    pub tenant_id: TenantId,
    pub order_id: PurchaseOrderId,
    pub supplier_id: SupplierId,
    pub destination: LocationId,
    pub lines: Vec<NewLine>,
    pub occurred_at: DateTime<Utc>,
}

/// Command: MarkOrdered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarkOrdered {
    pub tenant_id: TenantId,
    pub order_id: PurchaseOrderId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: ReceiveGoods (one batch of per-line accept/reject adjustments).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiveGoods {
    pub tenant_id: TenantId,
    pub order_id: PurchaseOrderId,
    pub adjustments: Vec<Adjustment>,
    pub occurred_at: DateTime<Utc>,
}

/// Command: CancelPurchaseOrder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelPurchaseOrder {
    pub tenant_id: TenantId,
    pub order_id: PurchaseOrderId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: DeletePurchaseOrder (draft only).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeletePurchaseOrder {
    pub tenant_id: TenantId,
    pub order_id: PurchaseOrderId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PurchaseOrderCommand {
    CreatePurchaseOrder(CreatePurchaseOrder),
    MarkOrdered(MarkOrdered),
    ReceiveGoods(ReceiveGoods),
    CancelPurchaseOrder(CancelPurchaseOrder),
    DeletePurchaseOrder(DeletePurchaseOrder),
}

/// Event: PurchaseOrderCreated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurchaseOrderCreated {
    pub tenant_id: TenantId,
    pub order_id: PurchaseOrderId,
    pub supplier_id: SupplierId,
    pub destination: LocationId,
    pub ledger: LineLedger,
    pub occurred_at: DateTime<Utc>,
}

/// Event: PurchaseOrderMarkedOrdered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurchaseOrderMarkedOrdered {
    pub tenant_id: TenantId,
    pub order_id: PurchaseOrderId,
    pub occurred_at: DateTime<Utc>,
}

/// Event: GoodsReceived.
///
/// Carries both the per-line receipts (what this batch moved, consumed by the
/// inventory side of the system) and the resulting ledger, which `apply`
/// adopts as-is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GoodsReceived {
    pub tenant_id: TenantId,
    pub order_id: PurchaseOrderId,
    pub destination: LocationId,
    pub receipts: Vec<LineReceipt>,
    pub ledger: LineLedger,
    pub occurred_at: DateTime<Utc>,
}

/// Event: PurchaseOrderCancelled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurchaseOrderCancelled {
    pub tenant_id: TenantId,
    pub order_id: PurchaseOrderId,
    pub occurred_at: DateTime<Utc>,
}

/// Event: PurchaseOrderDeleted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurchaseOrderDeleted {
    pub tenant_id: TenantId,
    pub order_id: PurchaseOrderId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PurchaseOrderEvent {
    PurchaseOrderCreated(PurchaseOrderCreated),
    PurchaseOrderMarkedOrdered(PurchaseOrderMarkedOrdered),
    GoodsReceived(GoodsReceived),
    PurchaseOrderCancelled(PurchaseOrderCancelled),
    PurchaseOrderDeleted(PurchaseOrderDeleted),
}

impl Event for PurchaseOrderEvent {
    fn event_type(&self) -> &'static str {
        match self {
            PurchaseOrderEvent::PurchaseOrderCreated(_) => "purchasing.order.created",
            PurchaseOrderEvent::PurchaseOrderMarkedOrdered(_) => "purchasing.order.ordered",
            PurchaseOrderEvent::GoodsReceived(_) => "purchasing.order.goods_received",
            PurchaseOrderEvent::PurchaseOrderCancelled(_) => "purchasing.order.cancelled",
            PurchaseOrderEvent::PurchaseOrderDeleted(_) => "purchasing.order.deleted",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            PurchaseOrderEvent::PurchaseOrderCreated(e) => e.occurred_at,
            PurchaseOrderEvent::PurchaseOrderMarkedOrdered(e) => e.occurred_at,
            PurchaseOrderEvent::GoodsReceived(e) => e.occurred_at,
            PurchaseOrderEvent::PurchaseOrderCancelled(e) => e.occurred_at,
            PurchaseOrderEvent::PurchaseOrderDeleted(e) => e.occurred_at,
        }
    }
}

impl Aggregate for PurchaseOrder {
    type Command = PurchaseOrderCommand;
    type Event = PurchaseOrderEvent;
    type Error = DomainError;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            PurchaseOrderEvent::PurchaseOrderCreated(e) => {
                self.id = e.order_id;
                self.tenant_id = Some(e.tenant_id);
                self.supplier_id = Some(e.supplier_id);
                self.destination = Some(e.destination);
                self.status = PurchaseOrderStatus::Draft;
                self.ledger = e.ledger.clone();
                self.created = true;
            }
            PurchaseOrderEvent::PurchaseOrderMarkedOrdered(_) => {
                self.status = PurchaseOrderStatus::Ordered;
            }
            PurchaseOrderEvent::GoodsReceived(e) => {
                self.ledger = e.ledger.clone();
                self.status = self.status.after_receipt(self.ledger.closure());
            }
            PurchaseOrderEvent::PurchaseOrderCancelled(_) => {
                self.status = PurchaseOrderStatus::Cancelled;
            }
            PurchaseOrderEvent::PurchaseOrderDeleted(_) => {
                self.deleted = true;
            }
        }

        self.version += 1;
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        match command {
            PurchaseOrderCommand::CreatePurchaseOrder(cmd) => self.handle_create(cmd),
            PurchaseOrderCommand::MarkOrdered(cmd) => self.handle_mark_ordered(cmd),
            PurchaseOrderCommand::ReceiveGoods(cmd) => self.handle_receive(cmd),
            PurchaseOrderCommand::CancelPurchaseOrder(cmd) => self.handle_cancel(cmd),
            PurchaseOrderCommand::DeletePurchaseOrder(cmd) => self.handle_delete(cmd),
        }
    }
}

impl PurchaseOrder {
    fn ensure_exists(&self) -> Result<(), DomainError> {
        if !self.exists() {
            return Err(DomainError::not_found(self.label()));
        }
        Ok(())
    }

    fn ensure_tenant(&self, tenant_id: TenantId) -> Result<(), DomainError> {
        if !self.created {
            return Ok(());
        }
        if self.tenant_id != Some(tenant_id) {
            return Err(DomainError::not_found(self.label()));
        }
        Ok(())
    }

    fn ensure_order_id(&self, order_id: PurchaseOrderId) -> Result<(), DomainError> {
        if self.id != order_id {
            return Err(DomainError::invariant("order_id mismatch"));
        }
        Ok(())
    }

    fn ensure_target(&self, tenant_id: TenantId, order_id: PurchaseOrderId) -> Result<(), DomainError> {
        self.ensure_exists()?;
        self.ensure_tenant(tenant_id)?;
        self.ensure_order_id(order_id)
    }

    fn handle_create(
        &self,
        cmd: &CreatePurchaseOrder,
    ) -> Result<Vec<PurchaseOrderEvent>, DomainError> {
        if self.created {
            return Err(DomainError::conflict(format!("{} already exists", self.label())));
        }
        self.ensure_order_id(cmd.order_id)?;

        let ledger = LineLedger::open(&cmd.lines)?;

        Ok(vec![PurchaseOrderEvent::PurchaseOrderCreated(
            PurchaseOrderCreated {
                tenant_id: cmd.tenant_id,
                order_id: cmd.order_id,
                supplier_id: cmd.supplier_id,
                destination: cmd.destination,
                ledger,
                occurred_at: cmd.occurred_at,
            },
        )])
    }

    fn handle_mark_ordered(
        &self,
        cmd: &MarkOrdered,
    ) -> Result<Vec<PurchaseOrderEvent>, DomainError> {
        self.ensure_target(cmd.tenant_id, cmd.order_id)?;

        if self.status != PurchaseOrderStatus::Draft {
            return Err(DomainError::invalid_state(format!(
                "{} is {}; only draft orders can be marked ordered",
                self.label(),
                self.status
            )));
        }

        Ok(vec![PurchaseOrderEvent::PurchaseOrderMarkedOrdered(
            PurchaseOrderMarkedOrdered {
                tenant_id: cmd.tenant_id,
                order_id: cmd.order_id,
                occurred_at: cmd.occurred_at,
            },
        )])
    }

    fn handle_receive(&self, cmd: &ReceiveGoods) -> Result<Vec<PurchaseOrderEvent>, DomainError> {
        self.ensure_target(cmd.tenant_id, cmd.order_id)?;

        if !self.status.accepts_receipts() {
            return Err(DomainError::invalid_state(format!(
                "{} is {}; goods can only be received once ordered and before fully received",
                self.label(),
                self.status
            )));
        }

        let destination = self
            .destination
            .ok_or_else(|| DomainError::invariant("destination must be set"))?;

        let outcome = reconcile(self.label(), &self.ledger, &cmd.adjustments)?;

        Ok(vec![PurchaseOrderEvent::GoodsReceived(GoodsReceived {
            tenant_id: cmd.tenant_id,
            order_id: cmd.order_id,
            destination,
            receipts: outcome.receipts,
            ledger: outcome.ledger,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_cancel(
        &self,
        cmd: &CancelPurchaseOrder,
    ) -> Result<Vec<PurchaseOrderEvent>, DomainError> {
        self.ensure_target(cmd.tenant_id, cmd.order_id)?;

        if !self.status.can_cancel() {
            return Err(DomainError::invalid_state(format!(
                "{} is {}; only draft or ordered orders can be cancelled",
                self.label(),
                self.status
            )));
        }

        Ok(vec![PurchaseOrderEvent::PurchaseOrderCancelled(
            PurchaseOrderCancelled {
                tenant_id: cmd.tenant_id,
                order_id: cmd.order_id,
                occurred_at: cmd.occurred_at,
            },
        )])
    }

    fn handle_delete(
        &self,
        cmd: &DeletePurchaseOrder,
    ) -> Result<Vec<PurchaseOrderEvent>, DomainError> {
        self.ensure_target(cmd.tenant_id, cmd.order_id)?;

        if self.status != PurchaseOrderStatus::Draft {
            return Err(DomainError::invalid_state(format!(
                "{} is {}; only draft orders can be deleted",
                self.label(),
                self.status
            )));
        }

        Ok(vec![PurchaseOrderEvent::PurchaseOrderDeleted(
            PurchaseOrderDeleted {
                tenant_id: cmd.tenant_id,
                order_id: cmd.order_id,
                occurred_at: cmd.occurred_at,
            },
        )])
    }
}
