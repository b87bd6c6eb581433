use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use procura_core::{Aggregate, AggregateRoot, DomainError, TenantId, typed_aggregate_id};
use procura_events::Event;
use procura_receiving::{
    Adjustment, Closure, LineLedger, LineReceipt, LocationId, NewLine, ProductId, reconcile,
};

use crate::shipment::ShipmentId;

typed_aggregate_id!(
    /// Transfer identifier (tenant-scoped via `tenant_id` fields in events/commands).
    TransferId
);

/// Transfer status lifecycle.
///
/// `draft -> ready_to_ship -> in_progress -> transferred`, with `cancelled`
/// reachable from `draft` or `ready_to_ship` only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferStatus {
    Draft,
    ReadyToShip,
    InProgress,
    Transferred,
    Cancelled,
}

impl TransferStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TransferStatus::Draft => "draft",
            TransferStatus::ReadyToShip => "ready_to_ship",
            TransferStatus::InProgress => "in_progress",
            TransferStatus::Transferred => "transferred",
            TransferStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, TransferStatus::Transferred | TransferStatus::Cancelled)
    }

    /// Statuses in which a shipment may be created for the transfer.
    pub fn can_ship(self) -> bool {
        matches!(self, TransferStatus::ReadyToShip | TransferStatus::InProgress)
    }

    pub fn can_cancel(self) -> bool {
        matches!(self, TransferStatus::Draft | TransferStatus::ReadyToShip)
    }

    /// Status after a receipt left the lines in `closure`.
    ///
    /// Only full closure moves a transfer on; a partial receipt keeps it
    /// `in_progress` until a later shipment closes the remaining lines.
    pub fn after_receipt(self, closure: Closure) -> Self {
        match closure {
            Closure::Closed => TransferStatus::Transferred,
            Closure::Partial | Closure::Untouched => self,
        }
    }
}

impl core::fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Product quantity moved between inventory buckets by a lifecycle step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockLine {
    pub product_id: ProductId,
    pub quantity: i64,
}

/// Aggregate root: Transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transfer {
    id: TransferId,
    tenant_id: Option<TenantId>,
    origin: Option<LocationId>,
    destination: Option<LocationId>,
    status: TransferStatus,
    ledger: LineLedger,
    active_shipment: Option<ShipmentId>,
    shipment_in_transit: bool,
    version: u64,
    created: bool,
    deleted: bool,
}

impl Transfer {
    /// Create an empty, not-yet-created aggregate instance for rehydration.
    pub fn empty(id: TransferId) -> Self {
        Self {
            id,
            tenant_id: None,
            origin: None,
            destination: None,
            status: TransferStatus::Draft,
            ledger: LineLedger::default(),
            active_shipment: None,
            shipment_in_transit: false,
            version: 0,
            created: false,
            deleted: false,
        }
    }

    pub fn id_typed(&self) -> TransferId {
        self.id
    }

    pub fn tenant_id(&self) -> Option<TenantId> {
        self.tenant_id
    }

    pub fn origin(&self) -> Option<LocationId> {
        self.origin
    }

    pub fn destination(&self) -> Option<LocationId> {
        self.destination
    }

    pub fn status(&self) -> TransferStatus {
        self.status
    }

    pub fn ledger(&self) -> &LineLedger {
        &self.ledger
    }

    /// The pending or in-transit shipment carrying this transfer, if any.
    pub fn active_shipment(&self) -> Option<ShipmentId> {
        self.active_shipment
    }

    /// Whether the active shipment has already left the origin.
    pub fn shipment_in_transit(&self) -> bool {
        self.shipment_in_transit
    }

    pub fn exists(&self) -> bool {
        self.created && !self.deleted
    }

    /// Check that `shipment_id` may go in transit for this transfer.
    fn check_start_transit(&self, shipment_id: ShipmentId) -> Result<(), DomainError> {
        self.ensure_exists()?;
        self.ensure_active_shipment(shipment_id)?;
        if self.shipment_in_transit {
            return Err(DomainError::invalid_state(format!(
                "shipment {shipment_id} of {} is already in transit",
                self.label()
            )));
        }
        if !self.status.can_ship() {
            return Err(DomainError::invalid_state(format!(
                "{} is {}; shipments can only leave a ready_to_ship or in_progress transfer",
                self.label(),
                self.status
            )));
        }
        Ok(())
    }

    fn label(&self) -> String {
        format!("transfer {}", self.id)
    }

    fn ordered_stock(&self) -> Vec<StockLine> {
        self.ledger
            .lines()
            .iter()
            .filter(|l| l.ordered() > 0)
            .map(|l| StockLine {
                product_id: l.product_id(),
                quantity: l.ordered(),
            })
            .collect()
    }
}

impl AggregateRoot for Transfer {
    type Id = TransferId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

/// Command: CreateTransfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateTransfer {
    pub tenant_id: TenantId,
    pub transfer_id: TransferId,
    pub origin: LocationId,
    pub destination: LocationId,
    pub lines: Vec<NewLine>,
    pub occurred_at: DateTime<Utc>,
}

/// Command: MarkReadyToShip (reserves stock at the origin).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarkReadyToShip {
    pub tenant_id: TenantId,
    pub transfer_id: TransferId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: AttachShipment (claims the single active-shipment slot).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachShipment {
    pub tenant_id: TenantId,
    pub transfer_id: TransferId,
    pub shipment_id: ShipmentId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: DetachShipment (releases the slot of a shipment being cancelled).
///
/// `in_transit` is the shipment stage the caller observed; the detach is
/// refused when the transfer recorded a different one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetachShipment {
    pub tenant_id: TenantId,
    pub transfer_id: TransferId,
    pub shipment_id: ShipmentId,
    pub in_transit: bool,
    pub occurred_at: DateTime<Utc>,
}

/// Command: StartTransit (the active shipment left the origin).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartTransit {
    pub tenant_id: TenantId,
    pub transfer_id: TransferId,
    pub shipment_id: ShipmentId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: ReceiveTransfer (the active shipment arrived; reconcile its lines).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiveTransfer {
    pub tenant_id: TenantId,
    pub transfer_id: TransferId,
    pub shipment_id: ShipmentId,
    pub adjustments: Vec<Adjustment>,
    pub occurred_at: DateTime<Utc>,
}

/// Command: CancelTransfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelTransfer {
    pub tenant_id: TenantId,
    pub transfer_id: TransferId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: DeleteTransfer (draft only).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteTransfer {
    pub tenant_id: TenantId,
    pub transfer_id: TransferId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferCommand {
    CreateTransfer(CreateTransfer),
    MarkReadyToShip(MarkReadyToShip),
    AttachShipment(AttachShipment),
    DetachShipment(DetachShipment),
    StartTransit(StartTransit),
    ReceiveTransfer(ReceiveTransfer),
    CancelTransfer(CancelTransfer),
    DeleteTransfer(DeleteTransfer),
}

/// Event: TransferCreated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferCreated {
    pub tenant_id: TenantId,
    pub transfer_id: TransferId,
    pub origin: LocationId,
    pub destination: LocationId,
    pub ledger: LineLedger,
    pub occurred_at: DateTime<Utc>,
}

/// Event: TransferReadyToShip.
///
/// `reserved` moves from origin `available` to origin `unavailable`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferReadyToShip {
    pub tenant_id: TenantId,
    pub transfer_id: TransferId,
    pub origin: LocationId,
    pub reserved: Vec<StockLine>,
    pub occurred_at: DateTime<Utc>,
}

/// Event: ShipmentAttached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShipmentAttached {
    pub tenant_id: TenantId,
    pub transfer_id: TransferId,
    pub shipment_id: ShipmentId,
    pub occurred_at: DateTime<Utc>,
}

/// Event: ShipmentDetached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShipmentDetached {
    pub tenant_id: TenantId,
    pub transfer_id: TransferId,
    pub shipment_id: ShipmentId,
    pub occurred_at: DateTime<Utc>,
}

/// Event: TransferDispatched (the active shipment went in transit).
///
/// `dispatched` moves from origin `unavailable` to destination `incoming`. It
/// is empty for follow-up shipments, whose goods already count as incoming.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferDispatched {
    pub tenant_id: TenantId,
    pub transfer_id: TransferId,
    pub shipment_id: ShipmentId,
    pub origin: LocationId,
    pub destination: LocationId,
    pub dispatched: Vec<StockLine>,
    pub occurred_at: DateTime<Utc>,
}

/// Event: TransferReceived.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferReceived {
    pub tenant_id: TenantId,
    pub transfer_id: TransferId,
    pub shipment_id: ShipmentId,
    pub destination: LocationId,
    pub receipts: Vec<LineReceipt>,
    pub ledger: LineLedger,
    pub occurred_at: DateTime<Utc>,
}

/// Event: TransferCancelled.
///
/// `released` is non-empty when the reservation made at `ready_to_ship` has to
/// go back to origin `available`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferCancelled {
    pub tenant_id: TenantId,
    pub transfer_id: TransferId,
    pub origin: LocationId,
    pub released: Vec<StockLine>,
    pub occurred_at: DateTime<Utc>,
}

/// Event: TransferDeleted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferDeleted {
    pub tenant_id: TenantId,
    pub transfer_id: TransferId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferEvent {
    TransferCreated(TransferCreated),
    TransferReadyToShip(TransferReadyToShip),
    ShipmentAttached(ShipmentAttached),
    ShipmentDetached(ShipmentDetached),
    TransferDispatched(TransferDispatched),
    TransferReceived(TransferReceived),
    TransferCancelled(TransferCancelled),
    TransferDeleted(TransferDeleted),
}

impl Event for TransferEvent {
    fn event_type(&self) -> &'static str {
        match self {
            TransferEvent::TransferCreated(_) => "transfers.transfer.created",
            TransferEvent::TransferReadyToShip(_) => "transfers.transfer.ready_to_ship",
            TransferEvent::ShipmentAttached(_) => "transfers.transfer.shipment_attached",
            TransferEvent::ShipmentDetached(_) => "transfers.transfer.shipment_detached",
            TransferEvent::TransferDispatched(_) => "transfers.transfer.dispatched",
            TransferEvent::TransferReceived(_) => "transfers.transfer.received",
            TransferEvent::TransferCancelled(_) => "transfers.transfer.cancelled",
            TransferEvent::TransferDeleted(_) => "transfers.transfer.deleted",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            TransferEvent::TransferCreated(e) => e.occurred_at,
            TransferEvent::TransferReadyToShip(e) => e.occurred_at,
            TransferEvent::ShipmentAttached(e) => e.occurred_at,
            TransferEvent::ShipmentDetached(e) => e.occurred_at,
            TransferEvent::TransferDispatched(e) => e.occurred_at,
            TransferEvent::TransferReceived(e) => e.occurred_at,
            TransferEvent::TransferCancelled(e) => e.occurred_at,
            TransferEvent::TransferDeleted(e) => e.occurred_at,
        }
    }
}

impl Aggregate for Transfer {
    type Command = TransferCommand;
    type Event = TransferEvent;
    type Error = DomainError;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            TransferEvent::TransferCreated(e) => {
                self.id = e.transfer_id;
                self.tenant_id = Some(e.tenant_id);
                self.origin = Some(e.origin);
                self.destination = Some(e.destination);
                self.status = TransferStatus::Draft;
                self.ledger = e.ledger.clone();
                self.created = true;
            }
            TransferEvent::TransferReadyToShip(_) => {
                self.status = TransferStatus::ReadyToShip;
            }
            TransferEvent::ShipmentAttached(e) => {
                self.active_shipment = Some(e.shipment_id);
                self.shipment_in_transit = false;
            }
            TransferEvent::ShipmentDetached(_) => {
                self.active_shipment = None;
                self.shipment_in_transit = false;
            }
            TransferEvent::TransferDispatched(_) => {
                self.status = TransferStatus::InProgress;
                self.shipment_in_transit = true;
            }
            TransferEvent::TransferReceived(e) => {
                self.ledger = e.ledger.clone();
                self.active_shipment = None;
                self.shipment_in_transit = false;
                self.status = self.status.after_receipt(self.ledger.closure());
            }
            TransferEvent::TransferCancelled(_) => {
                self.status = TransferStatus::Cancelled;
            }
            TransferEvent::TransferDeleted(_) => {
                self.deleted = true;
            }
        }

        self.version += 1;
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        match command {
            TransferCommand::CreateTransfer(cmd) => self.handle_create(cmd),
            TransferCommand::MarkReadyToShip(cmd) => self.handle_ready_to_ship(cmd),
            TransferCommand::AttachShipment(cmd) => self.handle_attach(cmd),
            TransferCommand::DetachShipment(cmd) => self.handle_detach(cmd),
            TransferCommand::StartTransit(cmd) => self.handle_start_transit(cmd),
            TransferCommand::ReceiveTransfer(cmd) => self.handle_receive(cmd),
            TransferCommand::CancelTransfer(cmd) => self.handle_cancel(cmd),
            TransferCommand::DeleteTransfer(cmd) => self.handle_delete(cmd),
        }
    }
}

impl Transfer {
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

    fn ensure_transfer_id(&self, transfer_id: TransferId) -> Result<(), DomainError> {
        if self.id != transfer_id {
            return Err(DomainError::invariant("transfer_id mismatch"));
        }
        Ok(())
    }

    fn ensure_target(&self, tenant_id: TenantId, transfer_id: TransferId) -> Result<(), DomainError> {
        self.ensure_exists()?;
        self.ensure_tenant(tenant_id)?;
        self.ensure_transfer_id(transfer_id)
    }

    fn ensure_active_shipment(&self, shipment_id: ShipmentId) -> Result<(), DomainError> {
        if self.active_shipment != Some(shipment_id) {
            return Err(DomainError::invalid_state(format!(
                "shipment {shipment_id} is not the active shipment of {}",
                self.label()
            )));
        }
        Ok(())
    }

    fn locations(&self) -> Result<(LocationId, LocationId), DomainError> {
        match (self.origin, self.destination) {
            (Some(origin), Some(destination)) => Ok((origin, destination)),
            _ => Err(DomainError::invariant("origin and destination must be set")),
        }
    }

    fn handle_create(&self, cmd: &CreateTransfer) -> Result<Vec<TransferEvent>, DomainError> {
        if self.created {
            return Err(DomainError::conflict(format!("{} already exists", self.label())));
        }
        self.ensure_transfer_id(cmd.transfer_id)?;

        if cmd.origin == cmd.destination {
            return Err(DomainError::validation(
                "origin and destination must be different locations",
            ));
        }

        let ledger = LineLedger::open(&cmd.lines)?;

        Ok(vec![TransferEvent::TransferCreated(TransferCreated {
            tenant_id: cmd.tenant_id,
            transfer_id: cmd.transfer_id,
            origin: cmd.origin,
            destination: cmd.destination,
            ledger,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_ready_to_ship(
        &self,
        cmd: &MarkReadyToShip,
    ) -> Result<Vec<TransferEvent>, DomainError> {
        self.ensure_target(cmd.tenant_id, cmd.transfer_id)?;

        if self.status != TransferStatus::Draft {
            return Err(DomainError::invalid_state(format!(
                "{} is {}; only draft transfers can be marked ready to ship",
                self.label(),
                self.status
            )));
        }

        let (origin, _) = self.locations()?;

        Ok(vec![TransferEvent::TransferReadyToShip(TransferReadyToShip {
            tenant_id: cmd.tenant_id,
            transfer_id: cmd.transfer_id,
            origin,
            reserved: self.ordered_stock(),
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_attach(&self, cmd: &AttachShipment) -> Result<Vec<TransferEvent>, DomainError> {
        self.ensure_target(cmd.tenant_id, cmd.transfer_id)?;

        if !self.status.can_ship() {
            return Err(DomainError::invalid_state(format!(
                "{} is {}; shipments require ready_to_ship or in_progress",
                self.label(),
                self.status
            )));
        }

        if let Some(active) = self.active_shipment {
            return Err(DomainError::invalid_state(format!(
                "{} already has active shipment {active}",
                self.label()
            )));
        }

        Ok(vec![TransferEvent::ShipmentAttached(ShipmentAttached {
            tenant_id: cmd.tenant_id,
            transfer_id: cmd.transfer_id,
            shipment_id: cmd.shipment_id,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_detach(&self, cmd: &DetachShipment) -> Result<Vec<TransferEvent>, DomainError> {
        self.ensure_target(cmd.tenant_id, cmd.transfer_id)?;
        self.ensure_active_shipment(cmd.shipment_id)?;

        if cmd.in_transit != self.shipment_in_transit {
            return Err(DomainError::conflict(format!(
                "shipment {} of {} changed stage while being detached",
                cmd.shipment_id,
                self.label()
            )));
        }

        Ok(vec![TransferEvent::ShipmentDetached(ShipmentDetached {
            tenant_id: cmd.tenant_id,
            transfer_id: cmd.transfer_id,
            shipment_id: cmd.shipment_id,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_start_transit(&self, cmd: &StartTransit) -> Result<Vec<TransferEvent>, DomainError> {
        self.ensure_target(cmd.tenant_id, cmd.transfer_id)?;
        self.check_start_transit(cmd.shipment_id)?;

        let (origin, destination) = self.locations()?;
        // Follow-up shipments of an in-progress transfer move nothing new:
        // the undelivered remainder is still counted as incoming.
        let dispatched = if self.status == TransferStatus::InProgress {
            Vec::new()
        } else {
            self.ordered_stock()
        };

        Ok(vec![TransferEvent::TransferDispatched(TransferDispatched {
            tenant_id: cmd.tenant_id,
            transfer_id: cmd.transfer_id,
            shipment_id: cmd.shipment_id,
            origin,
            destination,
            dispatched,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_receive(&self, cmd: &ReceiveTransfer) -> Result<Vec<TransferEvent>, DomainError> {
        self.ensure_target(cmd.tenant_id, cmd.transfer_id)?;

        if self.status != TransferStatus::InProgress {
            return Err(DomainError::invalid_state(format!(
                "{} is {}; only in_progress transfers can be received",
                self.label(),
                self.status
            )));
        }
        self.ensure_active_shipment(cmd.shipment_id)?;
        if !self.shipment_in_transit {
            return Err(DomainError::invalid_state(format!(
                "shipment {} of {} has not left the origin",
                cmd.shipment_id,
                self.label()
            )));
        }

        let (_, destination) = self.locations()?;
        let outcome = reconcile(self.label(), &self.ledger, &cmd.adjustments)?;

        Ok(vec![TransferEvent::TransferReceived(TransferReceived {
            tenant_id: cmd.tenant_id,
            transfer_id: cmd.transfer_id,
            shipment_id: cmd.shipment_id,
            destination,
            receipts: outcome.receipts,
            ledger: outcome.ledger,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_cancel(&self, cmd: &CancelTransfer) -> Result<Vec<TransferEvent>, DomainError> {
        self.ensure_target(cmd.tenant_id, cmd.transfer_id)?;

        if !self.status.can_cancel() {
            return Err(DomainError::invalid_state(format!(
                "{} is {}; only draft or ready_to_ship transfers can be cancelled",
                self.label(),
                self.status
            )));
        }

        if let Some(active) = self.active_shipment {
            return Err(DomainError::invalid_state(format!(
                "{} has active shipment {active}; cancel the shipment first",
                self.label()
            )));
        }

        let (origin, _) = self.locations()?;
        let released = if self.status == TransferStatus::ReadyToShip {
            self.ordered_stock()
        } else {
            Vec::new()
        };

        Ok(vec![TransferEvent::TransferCancelled(TransferCancelled {
            tenant_id: cmd.tenant_id,
            transfer_id: cmd.transfer_id,
            origin,
            released,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_delete(&self, cmd: &DeleteTransfer) -> Result<Vec<TransferEvent>, DomainError> {
        self.ensure_target(cmd.tenant_id, cmd.transfer_id)?;

        if self.status != TransferStatus::Draft {
            return Err(DomainError::invalid_state(format!(
                "{} is {}; only draft transfers can be deleted",
                self.label(),
                self.status
            )));
        }

        Ok(vec![TransferEvent::TransferDeleted(TransferDeleted {
            tenant_id: cmd.tenant_id,
            transfer_id: cmd.transfer_id,
            occurred_at: cmd.occurred_at,
        })])
    }
}
