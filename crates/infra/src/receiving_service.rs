//! Application entry points for purchase orders and transfers.
//!
//! Each operation is one dispatch through [`CommandDispatcher`], so each runs
//! as load -> validate -> append under the stream version guard. Shipment
//! operations live in [`crate::shipment_coordinator`].

use std::sync::Arc;

use chrono::Utc;
use serde_json::Value as JsonValue;
use tracing::{info, warn};

use procura_core::{AggregateRoot, TenantId};
use procura_events::{EventBus, EventEnvelope};
use procura_purchasing::{
    CancelPurchaseOrder, CreatePurchaseOrder, DeletePurchaseOrder, MarkOrdered, PurchaseOrder,
    PurchaseOrderCommand, PurchaseOrderId, PurchaseOrderStatus, ReceiveGoods, SupplierId,
};
use procura_receiving::{Adjustment, LineLedger, LineRemaining, LocationId, NewLine};
use procura_transfers::{
    CancelTransfer, CreateTransfer, DeleteTransfer, MarkReadyToShip, Transfer, TransferCommand,
    TransferId, TransferStatus,
};

use crate::aggregate_types;
use crate::command_dispatcher::{CommandDispatcher, DispatchError};
use crate::config::ReceivingConfig;
use crate::event_store::EventStore;

/// Result of a committed receive batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiptOutcome<S> {
    pub status: S,
    pub remaining: Vec<LineRemaining>,
    /// Aggregate version after the batch.
    pub version: u64,
}

impl<S> ReceiptOutcome<S> {
    pub(crate) fn new(status: S, ledger: &LineLedger, version: u64) -> Self {
        Self {
            status,
            remaining: ledger.remaining(),
            version,
        }
    }
}

/// Reject oversized batches before any state is loaded.
pub(crate) fn check_batch_size(
    config: &ReceivingConfig,
    adjustments: &[Adjustment],
) -> Result<(), DispatchError> {
    if adjustments.len() > config.max_batch_lines() {
        return Err(DispatchError::Validation(format!(
            "receive batch has {} adjustments; at most {} are allowed",
            adjustments.len(),
            config.max_batch_lines()
        )));
    }
    Ok(())
}

pub struct ReceivingService<S, B> {
    dispatcher: Arc<CommandDispatcher<S, B>>,
    config: ReceivingConfig,
}

impl<S, B> ReceivingService<S, B>
where
    S: EventStore,
    B: EventBus<EventEnvelope<JsonValue>>,
{
    pub fn new(dispatcher: Arc<CommandDispatcher<S, B>>, config: ReceivingConfig) -> Self {
        Self { dispatcher, config }
    }

    pub fn config(&self) -> &ReceivingConfig {
        &self.config
    }

    // ---- purchase orders ----

    pub fn create_purchase_order(
        &self,
        tenant_id: TenantId,
        supplier_id: SupplierId,
        destination: LocationId,
        lines: Vec<NewLine>,
    ) -> Result<PurchaseOrderId, DispatchError> {
        let order_id = PurchaseOrderId::generate();
        self.dispatch_order(
            tenant_id,
            order_id,
            PurchaseOrderCommand::CreatePurchaseOrder(CreatePurchaseOrder {
                tenant_id,
                order_id,
                supplier_id,
                destination,
                lines,
                occurred_at: Utc::now(),
            }),
        )?;
        info!(%tenant_id, %order_id, "purchase order created");
        Ok(order_id)
    }

    pub fn mark_ordered(
        &self,
        tenant_id: TenantId,
        order_id: PurchaseOrderId,
    ) -> Result<PurchaseOrderStatus, DispatchError> {
        let order = self.dispatch_order(
            tenant_id,
            order_id,
            PurchaseOrderCommand::MarkOrdered(MarkOrdered {
                tenant_id,
                order_id,
                occurred_at: Utc::now(),
            }),
        )?;
        info!(%tenant_id, %order_id, status = %order.status(), "purchase order placed");
        Ok(order.status())
    }

    /// Apply a batch of accept/reject adjustments to a purchase order.
    ///
    /// All-or-nothing: on any error no line changes and the order keeps its
    /// status and version.
    pub fn receive_purchase_order(
        &self,
        tenant_id: TenantId,
        order_id: PurchaseOrderId,
        adjustments: Vec<Adjustment>,
    ) -> Result<ReceiptOutcome<PurchaseOrderStatus>, DispatchError> {
        check_batch_size(&self.config, &adjustments)?;
        let lines = adjustments.len();

        let result = self.dispatch_order(
            tenant_id,
            order_id,
            PurchaseOrderCommand::ReceiveGoods(ReceiveGoods {
                tenant_id,
                order_id,
                adjustments,
                occurred_at: Utc::now(),
            }),
        );

        match result {
            Ok(order) => {
                info!(
                    %tenant_id,
                    %order_id,
                    lines,
                    status = %order.status(),
                    remaining = order.ledger().total_remaining(),
                    "purchase order receipt committed"
                );
                Ok(ReceiptOutcome::new(
                    order.status(),
                    order.ledger(),
                    order.version(),
                ))
            }
            Err(err) => {
                warn!(%tenant_id, %order_id, lines, error = %err, "purchase order receipt rejected");
                Err(err)
            }
        }
    }

    pub fn cancel_purchase_order(
        &self,
        tenant_id: TenantId,
        order_id: PurchaseOrderId,
    ) -> Result<PurchaseOrderStatus, DispatchError> {
        let order = self.dispatch_order(
            tenant_id,
            order_id,
            PurchaseOrderCommand::CancelPurchaseOrder(CancelPurchaseOrder {
                tenant_id,
                order_id,
                occurred_at: Utc::now(),
            }),
        )?;
        info!(%tenant_id, %order_id, "purchase order cancelled");
        Ok(order.status())
    }

    pub fn delete_purchase_order(
        &self,
        tenant_id: TenantId,
        order_id: PurchaseOrderId,
    ) -> Result<(), DispatchError> {
        self.dispatch_order(
            tenant_id,
            order_id,
            PurchaseOrderCommand::DeletePurchaseOrder(DeletePurchaseOrder {
                tenant_id,
                order_id,
                occurred_at: Utc::now(),
            }),
        )?;
        info!(%tenant_id, %order_id, "purchase order deleted");
        Ok(())
    }

    /// Current state of a purchase order; deleted or unknown orders are `NotFound`.
    pub fn purchase_order(
        &self,
        tenant_id: TenantId,
        order_id: PurchaseOrderId,
    ) -> Result<PurchaseOrder, DispatchError> {
        let order = self
            .dispatcher
            .load(tenant_id, order_id.0, |_, id| PurchaseOrder::empty(PurchaseOrderId::new(id)))?;
        if !order.exists() {
            return Err(DispatchError::NotFound(format!("purchase order {order_id}")));
        }
        Ok(order)
    }

    fn dispatch_order(
        &self,
        tenant_id: TenantId,
        order_id: PurchaseOrderId,
        command: PurchaseOrderCommand,
    ) -> Result<PurchaseOrder, DispatchError> {
        self.dispatcher
            .dispatch_and_load(
                tenant_id,
                order_id.0,
                aggregate_types::PURCHASE_ORDER,
                command,
                |_, id| PurchaseOrder::empty(PurchaseOrderId::new(id)),
            )
            .map(|d| d.aggregate)
    }

    // ---- transfers ----

    pub fn create_transfer(
        &self,
        tenant_id: TenantId,
        origin: LocationId,
        destination: LocationId,
        lines: Vec<NewLine>,
    ) -> Result<TransferId, DispatchError> {
        let transfer_id = TransferId::generate();
        self.dispatch_transfer(
            tenant_id,
            transfer_id,
            TransferCommand::CreateTransfer(CreateTransfer {
                tenant_id,
                transfer_id,
                origin,
                destination,
                lines,
                occurred_at: Utc::now(),
            }),
        )?;
        info!(%tenant_id, %transfer_id, "transfer created");
        Ok(transfer_id)
    }

    /// Reserve the transfer's quantities at the origin.
    pub fn mark_ready_to_ship(
        &self,
        tenant_id: TenantId,
        transfer_id: TransferId,
    ) -> Result<TransferStatus, DispatchError> {
        let transfer = self.dispatch_transfer(
            tenant_id,
            transfer_id,
            TransferCommand::MarkReadyToShip(MarkReadyToShip {
                tenant_id,
                transfer_id,
                occurred_at: Utc::now(),
            }),
        )?;
        info!(%tenant_id, %transfer_id, "transfer ready to ship");
        Ok(transfer.status())
    }

    pub fn cancel_transfer(
        &self,
        tenant_id: TenantId,
        transfer_id: TransferId,
    ) -> Result<TransferStatus, DispatchError> {
        let transfer = self.dispatch_transfer(
            tenant_id,
            transfer_id,
            TransferCommand::CancelTransfer(CancelTransfer {
                tenant_id,
                transfer_id,
                occurred_at: Utc::now(),
            }),
        )?;
        info!(%tenant_id, %transfer_id, "transfer cancelled");
        Ok(transfer.status())
    }

    pub fn delete_transfer(
        &self,
        tenant_id: TenantId,
        transfer_id: TransferId,
    ) -> Result<(), DispatchError> {
        self.dispatch_transfer(
            tenant_id,
            transfer_id,
            TransferCommand::DeleteTransfer(DeleteTransfer {
                tenant_id,
                transfer_id,
                occurred_at: Utc::now(),
            }),
        )?;
        info!(%tenant_id, %transfer_id, "transfer deleted");
        Ok(())
    }

    pub fn transfer(
        &self,
        tenant_id: TenantId,
        transfer_id: TransferId,
    ) -> Result<Transfer, DispatchError> {
        let transfer = self
            .dispatcher
            .load(tenant_id, transfer_id.0, |_, id| Transfer::empty(TransferId::new(id)))?;
        if !transfer.exists() {
            return Err(DispatchError::NotFound(format!("transfer {transfer_id}")));
        }
        Ok(transfer)
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
}
