//! Keeps a Shipment and its Transfer moving in lockstep.
//!
//! Every operation touches two aggregates, each guarded by its own stream
//! version. The transfer is always written first:
//!
//! | operation        | first step (transfer)       | second step (shipment)         |
//! |------------------|-----------------------------|--------------------------------|
//! | create           | attach shipment             | create (detach on failure)     |
//! | mark in transit  | start transit               | in_transit                     |
//! | receive          | reconcile lines             | received                       |
//! | cancel           | detach shipment             | cancelled                      |
//!
//! The transfer records its active shipment and whether that shipment has left
//! the origin. Two operations on the same shipment therefore meet on the
//! transfer stream, and the loser stops there with nothing written. The
//! shipment step that follows was already validated against the state the
//! transfer vouched for; it is retried on version races a bounded number of
//! times before the error is surfaced.

use std::sync::Arc;

use chrono::Utc;
use serde_json::Value as JsonValue;
use tracing::{error, info, warn};

use procura_core::{AggregateRoot, TenantId};
use procura_events::{EventBus, EventEnvelope};
use procura_receiving::Adjustment;
use procura_transfers::{
    AttachShipment, CancelShipment, CreateShipment, DetachShipment, MarkInTransit, MarkReceived,
    ReceiveTransfer, Shipment, ShipmentCommand, ShipmentId, ShipmentStatus, StartTransit,
    Transfer, TransferCommand, TransferId, TransferStatus,
};

use crate::aggregate_types;
use crate::command_dispatcher::{CommandDispatcher, DispatchError};
use crate::config::ReceivingConfig;
use crate::event_store::EventStore;
use crate::receiving_service::{ReceiptOutcome, check_batch_size};

const SECOND_STEP_ATTEMPTS: usize = 3;

/// Both statuses after a coordinated transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShipmentTransition {
    pub shipment: ShipmentStatus,
    pub transfer: TransferStatus,
}

/// Result of receiving a shipment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShipmentReceipt {
    pub shipment: Shipment,
    pub transfer: ReceiptOutcome<TransferStatus>,
}

pub struct ShipmentCoordinator<S, B> {
    dispatcher: Arc<CommandDispatcher<S, B>>,
    config: ReceivingConfig,
}

impl<S, B> ShipmentCoordinator<S, B>
where
    S: EventStore,
    B: EventBus<EventEnvelope<JsonValue>>,
{
    pub fn new(dispatcher: Arc<CommandDispatcher<S, B>>, config: ReceivingConfig) -> Self {
        Self { dispatcher, config }
    }

    /// Create a pending shipment for a transfer.
    ///
    /// Fails with `InvalidState` when the transfer is not `ready_to_ship` or
    /// `in_progress`, or already has a pending or in-transit shipment.
    pub fn create_shipment(
        &self,
        tenant_id: TenantId,
        transfer_id: TransferId,
        carrier: Option<String>,
        tracking_number: Option<String>,
    ) -> Result<ShipmentId, DispatchError> {
        let shipment_id = ShipmentId::generate();

        self.dispatch_transfer(
            tenant_id,
            transfer_id,
            TransferCommand::AttachShipment(AttachShipment {
                tenant_id,
                transfer_id,
                shipment_id,
                occurred_at: Utc::now(),
            }),
        )?;

        let created = self.dispatch_shipment(
            tenant_id,
            shipment_id,
            ShipmentCommand::CreateShipment(CreateShipment {
                tenant_id,
                shipment_id,
                transfer_id,
                carrier,
                tracking_number,
                occurred_at: Utc::now(),
            }),
        );

        if let Err(err) = created {
            warn!(%tenant_id, %transfer_id, %shipment_id, error = %err, "shipment creation failed; releasing transfer slot");
            self.release_slot(tenant_id, transfer_id, shipment_id)?;
            return Err(err);
        }

        info!(%tenant_id, %transfer_id, %shipment_id, "shipment created");
        Ok(shipment_id)
    }

    /// `pending -> in_transit`; the transfer moves to `in_progress`.
    pub fn mark_in_transit(
        &self,
        tenant_id: TenantId,
        shipment_id: ShipmentId,
    ) -> Result<ShipmentTransition, DispatchError> {
        let shipment = self.shipment(tenant_id, shipment_id)?;
        shipment.ensure_dispatchable()?;
        let transfer_id = owning_transfer(&shipment)?;

        let transfer = self.dispatch_transfer(
            tenant_id,
            transfer_id,
            TransferCommand::StartTransit(StartTransit {
                tenant_id,
                transfer_id,
                shipment_id,
                occurred_at: Utc::now(),
            }),
        )?;

        let shipment = self.second_step("mark in transit", || {
            self.dispatch_shipment(
                tenant_id,
                shipment_id,
                ShipmentCommand::MarkInTransit(MarkInTransit {
                    tenant_id,
                    shipment_id,
                    occurred_at: Utc::now(),
                }),
            )
        })?;

        info!(%tenant_id, %shipment_id, %transfer_id, transfer_status = %transfer.status(), "shipment in transit");
        Ok(ShipmentTransition {
            shipment: shipment.status(),
            transfer: transfer.status(),
        })
    }

    /// Reconcile an in-transit shipment's goods against its transfer's lines.
    ///
    /// The shipment becomes `received` (stamped now) only after the transfer
    /// accepted the batch; a rejected batch leaves both aggregates untouched.
    /// Accepting the batch also releases the transfer's slot, so a concurrent
    /// cancel of this shipment can no longer detach it.
    pub fn receive(
        &self,
        tenant_id: TenantId,
        shipment_id: ShipmentId,
        adjustments: Vec<Adjustment>,
    ) -> Result<ShipmentReceipt, DispatchError> {
        check_batch_size(&self.config, &adjustments)?;

        let shipment = self.shipment(tenant_id, shipment_id)?;
        shipment.ensure_receivable()?;
        let transfer_id = owning_transfer(&shipment)?;
        let lines = adjustments.len();

        let transfer = self
            .dispatch_transfer(
                tenant_id,
                transfer_id,
                TransferCommand::ReceiveTransfer(ReceiveTransfer {
                    tenant_id,
                    transfer_id,
                    shipment_id,
                    adjustments,
                    occurred_at: Utc::now(),
                }),
            )
            .inspect_err(|err| {
                warn!(%tenant_id, %shipment_id, %transfer_id, lines, error = %err, "shipment receipt rejected");
            })?;

        let shipment = self.second_step("mark received", || {
            self.dispatch_shipment(
                tenant_id,
                shipment_id,
                ShipmentCommand::MarkReceived(MarkReceived {
                    tenant_id,
                    shipment_id,
                    occurred_at: Utc::now(),
                }),
            )
        })?;

        info!(
            %tenant_id,
            %shipment_id,
            %transfer_id,
            lines,
            transfer_status = %transfer.status(),
            remaining = transfer.ledger().total_remaining(),
            "shipment received"
        );

        Ok(ShipmentReceipt {
            shipment,
            transfer: ReceiptOutcome::new(transfer.status(), transfer.ledger(), transfer.version()),
        })
    }

    /// Cancel a pending or in-transit shipment and free its transfer's slot.
    ///
    /// Goods of a cancelled in-transit shipment stay counted as incoming at the
    /// destination; a follow-up shipment carries them.
    ///
    /// Fails with `InvalidState` when a receipt already claimed the shipment,
    /// and with `Conflict` when it went in transit after it was read.
    pub fn cancel_shipment(
        &self,
        tenant_id: TenantId,
        shipment_id: ShipmentId,
    ) -> Result<ShipmentStatus, DispatchError> {
        let shipment = self.shipment(tenant_id, shipment_id)?;
        shipment.ensure_cancellable()?;
        let transfer_id = owning_transfer(&shipment)?;
        let in_transit = shipment.status() == ShipmentStatus::InTransit;

        self.dispatch_transfer(
            tenant_id,
            transfer_id,
            TransferCommand::DetachShipment(DetachShipment {
                tenant_id,
                transfer_id,
                shipment_id,
                in_transit,
                occurred_at: Utc::now(),
            }),
        )?;

        let shipment = self.second_step("cancel shipment", || {
            self.dispatch_shipment(
                tenant_id,
                shipment_id,
                ShipmentCommand::CancelShipment(CancelShipment {
                    tenant_id,
                    shipment_id,
                    occurred_at: Utc::now(),
                }),
            )
        })?;

        info!(%tenant_id, %shipment_id, %transfer_id, "shipment cancelled");
        Ok(shipment.status())
    }

    pub fn shipment(
        &self,
        tenant_id: TenantId,
        shipment_id: ShipmentId,
    ) -> Result<Shipment, DispatchError> {
        let shipment = self
            .dispatcher
            .load(tenant_id, shipment_id.0, |_, id| Shipment::empty(ShipmentId::new(id)))?;
        if !shipment.exists() {
            return Err(DispatchError::NotFound(format!("shipment {shipment_id}")));
        }
        Ok(shipment)
    }

    /// Undo an attach whose shipment was never created.
    fn release_slot(
        &self,
        tenant_id: TenantId,
        transfer_id: TransferId,
        shipment_id: ShipmentId,
    ) -> Result<Transfer, DispatchError> {
        self.second_step("release slot", || {
            self.dispatch_transfer(
                tenant_id,
                transfer_id,
                TransferCommand::DetachShipment(DetachShipment {
                    tenant_id,
                    transfer_id,
                    shipment_id,
                    in_transit: false,
                    occurred_at: Utc::now(),
                }),
            )
        })
    }

    fn second_step<T>(
        &self,
        step: &'static str,
        mut run: impl FnMut() -> Result<T, DispatchError>,
    ) -> Result<T, DispatchError> {
        let mut attempt = 1;
        loop {
            match run() {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() && attempt < SECOND_STEP_ATTEMPTS => {
                    warn!(step, attempt, error = %err, "coordinated step lost a version race; retrying");
                    attempt += 1;
                }
                Err(err) => {
                    error!(step, attempt, error = %err, "coordinated step failed after first step committed");
                    return Err(err);
                }
            }
        }
    }

    fn dispatch_transfer(
        &self,
        tenant_id: TenantId,
        transfer_id: TransferId,
        command: TransferCommand,
    ) -> Result<Transfer, DispatchError> {
        self.dispatcher
            .dispatch_and_load(
                tenant_id,
                transfer_id.0,
                aggregate_types::TRANSFER,
                command,
                |_, id| Transfer::empty(TransferId::new(id)),
            )
            .map(|d| d.aggregate)
    }

    fn dispatch_shipment(
        &self,
        tenant_id: TenantId,
        shipment_id: ShipmentId,
        command: ShipmentCommand,
    ) -> Result<Shipment, DispatchError> {
        self.dispatcher
            .dispatch_and_load(
                tenant_id,
                shipment_id.0,
                aggregate_types::SHIPMENT,
                command,
                |_, id| Shipment::empty(ShipmentId::new(id)),
            )
            .map(|d| d.aggregate)
    }
}

fn owning_transfer(shipment: &Shipment) -> Result<TransferId, DispatchError> {
    shipment.transfer_id().ok_or_else(|| {
        DispatchError::InvariantViolation(format!(
            "shipment {} has no transfer",
            shipment.id_typed()
        ))
    })
}
