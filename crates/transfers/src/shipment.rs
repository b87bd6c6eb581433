use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use procura_core::{Aggregate, AggregateRoot, DomainError, TenantId, typed_aggregate_id};
use procura_events::Event;

use crate::transfer::TransferId;

typed_aggregate_id!(
    /// Shipment identifier.
    ShipmentId
);

/// Shipment status: `pending -> in_transit -> received`, or `cancelled`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShipmentStatus {
    Pending,
    InTransit,
    Received,
    Cancelled,
}

impl ShipmentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ShipmentStatus::Pending => "pending",
            ShipmentStatus::InTransit => "in_transit",
            ShipmentStatus::Received => "received",
            ShipmentStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, ShipmentStatus::Received | ShipmentStatus::Cancelled)
    }
}

impl core::fmt::Display for ShipmentStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Aggregate root: Shipment (one physical movement of a transfer's goods).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Shipment {
    id: ShipmentId,
    tenant_id: Option<TenantId>,
    transfer_id: Option<TransferId>,
    carrier: Option<String>,
    tracking_number: Option<String>,
    status: ShipmentStatus,
    received_at: Option<DateTime<Utc>>,
    version: u64,
    created: bool,
}

impl Shipment {
    pub fn empty(id: ShipmentId) -> Self {
        Self {
            id,
            tenant_id: None,
            transfer_id: None,
            carrier: None,
            tracking_number: None,
            status: ShipmentStatus::Pending,
            received_at: None,
            version: 0,
            created: false,
        }
    }

    pub fn id_typed(&self) -> ShipmentId {
        self.id
    }

    pub fn tenant_id(&self) -> Option<TenantId> {
        self.tenant_id
    }

    pub fn transfer_id(&self) -> Option<TransferId> {
        self.transfer_id
    }

    pub fn carrier(&self) -> Option<&str> {
        self.carrier.as_deref()
    }

    pub fn tracking_number(&self) -> Option<&str> {
        self.tracking_number.as_deref()
    }

    pub fn status(&self) -> ShipmentStatus {
        self.status
    }

    pub fn received_at(&self) -> Option<DateTime<Utc>> {
        self.received_at
    }

    pub fn exists(&self) -> bool {
        self.created
    }

    /// A shipment's goods can only be reconciled while it is in transit.
    pub fn ensure_receivable(&self) -> Result<(), DomainError> {
        self.ensure_exists()?;
        self.ensure_status(ShipmentStatus::InTransit, "received")
    }

    pub fn ensure_dispatchable(&self) -> Result<(), DomainError> {
        self.ensure_exists()?;
        self.ensure_status(ShipmentStatus::Pending, "marked in transit")
    }

    pub fn ensure_cancellable(&self) -> Result<(), DomainError> {
        self.ensure_exists()?;
        if self.status.is_terminal() {
            return Err(DomainError::invalid_state(format!(
                "{} is {}; only pending or in_transit shipments can be cancelled",
                self.label(),
                self.status
            )));
        }
        Ok(())
    }

    fn label(&self) -> String {
        format!("shipment {}", self.id)
    }

    fn ensure_exists(&self) -> Result<(), DomainError> {
        if !self.created {
            return Err(DomainError::not_found(self.label()));
        }
        Ok(())
    }

    fn ensure_status(&self, required: ShipmentStatus, action: &str) -> Result<(), DomainError> {
        if self.status != required {
            return Err(DomainError::invalid_state(format!(
                "{} is {}; only {required} shipments can be {action}",
                self.label(),
                self.status
            )));
        }
        Ok(())
    }

    fn ensure_target(&self, tenant_id: TenantId, shipment_id: ShipmentId) -> Result<(), DomainError> {
        self.ensure_exists()?;
        if self.tenant_id != Some(tenant_id) {
            return Err(DomainError::not_found(self.label()));
        }
        if self.id != shipment_id {
            return Err(DomainError::invariant("shipment_id mismatch"));
        }
        Ok(())
    }
}

impl AggregateRoot for Shipment {
    type Id = ShipmentId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateShipment {
    pub tenant_id: TenantId,
    pub shipment_id: ShipmentId,
    pub transfer_id: TransferId,
    pub carrier: Option<String>,
    pub tracking_number: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarkInTransit {
    pub tenant_id: TenantId,
    pub shipment_id: ShipmentId,
    pub occurred_at: DateTime<Utc>,
}

/// Stamps `received_at` with `occurred_at`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarkReceived {
    pub tenant_id: TenantId,
    pub shipment_id: ShipmentId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelShipment {
    pub tenant_id: TenantId,
    pub shipment_id: ShipmentId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShipmentCommand {
    CreateShipment(CreateShipment),
    MarkInTransit(MarkInTransit),
    MarkReceived(MarkReceived),
    CancelShipment(CancelShipment),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShipmentCreated {
    pub tenant_id: TenantId,
    pub shipment_id: ShipmentId,
    pub transfer_id: TransferId,
    pub carrier: Option<String>,
    pub tracking_number: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShipmentInTransit {
    pub tenant_id: TenantId,
    pub shipment_id: ShipmentId,
    pub transfer_id: TransferId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShipmentReceived {
    pub tenant_id: TenantId,
    pub shipment_id: ShipmentId,
    pub transfer_id: TransferId,
    pub received_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShipmentCancelled {
    pub tenant_id: TenantId,
    pub shipment_id: ShipmentId,
    pub transfer_id: TransferId,
    /// Status the shipment was in when it was cancelled.
    pub previous: ShipmentStatus,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShipmentEvent {
    ShipmentCreated(ShipmentCreated),
    ShipmentInTransit(ShipmentInTransit),
    ShipmentReceived(ShipmentReceived),
    ShipmentCancelled(ShipmentCancelled),
}

impl Event for ShipmentEvent {
    fn event_type(&self) -> &'static str {
        match self {
            ShipmentEvent::ShipmentCreated(_) => "transfers.shipment.created",
            ShipmentEvent::ShipmentInTransit(_) => "transfers.shipment.in_transit",
            ShipmentEvent::ShipmentReceived(_) => "transfers.shipment.received",
            ShipmentEvent::ShipmentCancelled(_) => "transfers.shipment.cancelled",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            ShipmentEvent::ShipmentCreated(e) => e.occurred_at,
            ShipmentEvent::ShipmentInTransit(e) => e.occurred_at,
            ShipmentEvent::ShipmentReceived(e) => e.received_at,
            ShipmentEvent::ShipmentCancelled(e) => e.occurred_at,
        }
    }
}

impl Aggregate for Shipment {
    type Command = ShipmentCommand;
    type Event = ShipmentEvent;
    type Error = DomainError;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            ShipmentEvent::ShipmentCreated(e) => {
                self.id = e.shipment_id;
                self.tenant_id = Some(e.tenant_id);
                self.transfer_id = Some(e.transfer_id);
                self.carrier = e.carrier.clone();
                self.tracking_number = e.tracking_number.clone();
                self.status = ShipmentStatus::Pending;
                self.created = true;
            }
            ShipmentEvent::ShipmentInTransit(_) => {
                self.status = ShipmentStatus::InTransit;
            }
            ShipmentEvent::ShipmentReceived(e) => {
                self.status = ShipmentStatus::Received;
                self.received_at = Some(e.received_at);
            }
            ShipmentEvent::ShipmentCancelled(_) => {
                self.status = ShipmentStatus::Cancelled;
            }
        }

        self.version += 1;
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        match command {
            ShipmentCommand::CreateShipment(cmd) => {
                if self.created {
                    return Err(DomainError::conflict(format!("{} already exists", self.label())));
                }
                if self.id != cmd.shipment_id {
                    return Err(DomainError::invariant("shipment_id mismatch"));
                }
                Ok(vec![ShipmentEvent::ShipmentCreated(ShipmentCreated {
                    tenant_id: cmd.tenant_id,
                    shipment_id: cmd.shipment_id,
                    transfer_id: cmd.transfer_id,
                    carrier: cmd.carrier.clone(),
                    tracking_number: cmd.tracking_number.clone(),
                    occurred_at: cmd.occurred_at,
                })])
            }
            ShipmentCommand::MarkInTransit(cmd) => {
                self.ensure_target(cmd.tenant_id, cmd.shipment_id)?;
                self.ensure_dispatchable()?;
                Ok(vec![ShipmentEvent::ShipmentInTransit(ShipmentInTransit {
                    tenant_id: cmd.tenant_id,
                    shipment_id: cmd.shipment_id,
                    transfer_id: self.owning_transfer()?,
                    occurred_at: cmd.occurred_at,
                })])
            }
            ShipmentCommand::MarkReceived(cmd) => {
                self.ensure_target(cmd.tenant_id, cmd.shipment_id)?;
                self.ensure_receivable()?;
                Ok(vec![ShipmentEvent::ShipmentReceived(ShipmentReceived {
                    tenant_id: cmd.tenant_id,
                    shipment_id: cmd.shipment_id,
                    transfer_id: self.owning_transfer()?,
                    received_at: cmd.occurred_at,
                })])
            }
            ShipmentCommand::CancelShipment(cmd) => {
                self.ensure_target(cmd.tenant_id, cmd.shipment_id)?;
                self.ensure_cancellable()?;
                Ok(vec![ShipmentEvent::ShipmentCancelled(ShipmentCancelled {
                    tenant_id: cmd.tenant_id,
                    shipment_id: cmd.shipment_id,
                    transfer_id: self.owning_transfer()?,
                    previous: self.status,
                    occurred_at: cmd.occurred_at,
                })])
            }
        }
    }
}

impl Shipment {
    fn owning_transfer(&self) -> Result<TransferId, DomainError> {
        self.transfer_id
            .ok_or_else(|| DomainError::invariant("shipment has no transfer"))
    }
}
