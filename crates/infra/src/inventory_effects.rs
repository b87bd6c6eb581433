//! Outbound inventory side effects of receiving and transfer lifecycles.
//!
//! Committed events reach [`InventoryEffects`] through the bus; it turns each
//! into a batch of stock movements for the inventory-location collaborator.
//!
//! | event                         | movement                                              |
//! |-------------------------------|-------------------------------------------------------|
//! | transfer ready to ship        | origin `available -= q`, `unavailable += q`           |
//! | transfer dispatched           | origin `unavailable -= q`, `on_hand -= q`, destination `incoming += q` |
//! | transfer received             | destination `incoming -= accepted + rejected`, `on_hand += accepted`, `available += accepted` |
//! | transfer cancelled (reserved) | origin `unavailable -= q`, `available += q`           |
//! | purchase order goods received | destination `on_hand += accepted`, `available += accepted` |
//!
//! Rejected units are dropped. Failed movements are reported to the caller and
//! never retried here.
//!
//! Only purchase order and transfer streams are tracked. A stream's cursor is
//! dropped once it reaches a terminal event, since nothing is appended after
//! one.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::debug;

use procura_core::{AggregateId, TenantId};
use procura_events::EventEnvelope;
use procura_purchasing::PurchaseOrderEvent;
use procura_receiving::{Closure, LineReceipt, LocationId, ProductId};
use procura_transfers::{StockLine, TransferEvent};

use crate::aggregate_types;

/// Quantities of one product at one location.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StockLevel {
    pub available: i64,
    pub unavailable: i64,
    pub incoming: i64,
    pub on_hand: i64,
}

impl StockLevel {
    fn add(&mut self, delta: &StockLevel) {
        self.available = self.available.saturating_add(delta.available);
        self.unavailable = self.unavailable.saturating_add(delta.unavailable);
        self.incoming = self.incoming.saturating_add(delta.incoming);
        self.on_hand = self.on_hand.saturating_add(delta.on_hand);
    }
}

/// One signed change to a `(location, product)` stock level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StockMovement {
    pub location: LocationId,
    pub product: ProductId,
    pub delta: StockLevel,
}

#[derive(Debug, Error)]
pub enum InventoryError {
    #[error("inventory collaborator unavailable: {0}")]
    Unavailable(String),
}

/// Inventory-location collaborator.
pub trait InventoryLocations: Send + Sync {
    /// Apply all movements of one event, or none of them.
    fn apply(&self, tenant_id: TenantId, movements: &[StockMovement]) -> Result<(), InventoryError>;

    fn level(&self, tenant_id: TenantId, location: LocationId, product: ProductId) -> StockLevel;
}

impl<L> InventoryLocations for Arc<L>
where
    L: InventoryLocations + ?Sized,
{
    fn apply(&self, tenant_id: TenantId, movements: &[StockMovement]) -> Result<(), InventoryError> {
        (**self).apply(tenant_id, movements)
    }

    fn level(&self, tenant_id: TenantId, location: LocationId, product: ProductId) -> StockLevel {
        (**self).level(tenant_id, location, product)
    }
}

/// In-memory, tenant-isolated stock levels.
#[derive(Debug, Default)]
pub struct InMemoryInventoryLocations {
    levels: RwLock<HashMap<(TenantId, LocationId, ProductId), StockLevel>>,
}

impl InMemoryInventoryLocations {
    pub fn new() -> Self {
        Self::default()
    }
}

impl InventoryLocations for InMemoryInventoryLocations {
    fn apply(&self, tenant_id: TenantId, movements: &[StockMovement]) -> Result<(), InventoryError> {
        let mut levels = self
            .levels
            .write()
            .map_err(|_| InventoryError::Unavailable("inventory lock poisoned".to_string()))?;
        for m in movements {
            levels
                .entry((tenant_id, m.location, m.product))
                .or_default()
                .add(&m.delta);
        }
        Ok(())
    }

    fn level(&self, tenant_id: TenantId, location: LocationId, product: ProductId) -> StockLevel {
        self.levels
            .read()
            .ok()
            .and_then(|levels| levels.get(&(tenant_id, location, product)).copied())
            .unwrap_or_default()
    }
}

#[derive(Debug, Error)]
pub enum InventoryEffectError {
    #[error("failed to deserialize {aggregate_type} event: {message}")]
    Deserialize {
        aggregate_type: String,
        message: String,
    },

    #[error("tenant isolation violation: {0}")]
    TenantIsolation(String),

    #[error(transparent)]
    Inventory(#[from] InventoryError),
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
struct CursorKey {
    tenant_id: TenantId,
    aggregate_id: AggregateId,
}

/// Movements decided for one event.
struct Effect {
    tenant_id: TenantId,
    movements: Vec<StockMovement>,
    closes_stream: bool,
}

impl Effect {
    fn new(tenant_id: TenantId, movements: Vec<StockMovement>) -> Self {
        Self {
            tenant_id,
            movements,
            closes_stream: false,
        }
    }

    fn closing(mut self, closes_stream: bool) -> Self {
        self.closes_stream = closes_stream;
        self
    }
}

/// Translates committed events into inventory movements.
///
/// Delivery is at-least-once, so a per-stream cursor drops envelopes at or
/// below the last sequence number already handled.
#[derive(Debug)]
pub struct InventoryEffects<L> {
    inventory: L,
    cursors: RwLock<HashMap<CursorKey, u64>>,
}

impl<L> InventoryEffects<L>
where
    L: InventoryLocations,
{
    pub fn new(inventory: L) -> Self {
        Self {
            inventory,
            cursors: RwLock::new(HashMap::new()),
        }
    }

    pub fn inventory(&self) -> &L {
        &self.inventory
    }

    /// Handle one published envelope.
    ///
    /// The cursor advances before the collaborator is called, so a failed
    /// movement is reported once and not replayed on redelivery.
    pub fn apply_envelope(&self, envelope: &EventEnvelope<JsonValue>) -> Result<(), InventoryEffectError> {
        let tenant_id = envelope.tenant_id();
        let seq = envelope.sequence_number();

        let Some(effect) = effect_for(envelope)? else {
            return Ok(());
        };

        if effect.tenant_id != tenant_id {
            return Err(InventoryEffectError::TenantIsolation(
                "event tenant_id does not match envelope tenant_id".to_string(),
            ));
        }

        let key = CursorKey {
            tenant_id,
            aggregate_id: envelope.aggregate_id(),
        };
        {
            let mut cursors = self
                .cursors
                .write()
                .map_err(|_| InventoryError::Unavailable("cursor lock poisoned".to_string()))?;
            let last = cursors.get(&key).copied().unwrap_or(0);
            if seq <= last {
                debug!(%tenant_id, seq, last, "duplicate envelope ignored");
                return Ok(());
            }
            if effect.closes_stream {
                cursors.remove(&key);
            } else {
                cursors.insert(key, seq);
            }
        }

        let movements = effect.movements;
        if movements.is_empty() {
            return Ok(());
        }

        debug!(
            %tenant_id,
            aggregate_type = envelope.aggregate_type(),
            seq,
            movements = movements.len(),
            "applying inventory movements"
        );
        self.inventory.apply(tenant_id, &movements)?;
        Ok(())
    }

    #[cfg(test)]
    fn tracked_streams(&self) -> usize {
        self.cursors.read().map(|c| c.len()).unwrap_or(0)
    }
}

/// Effect of an envelope, or `None` when its stream has no inventory effect.
fn effect_for(envelope: &EventEnvelope<JsonValue>) -> Result<Option<Effect>, InventoryEffectError> {
    match envelope.aggregate_type() {
        aggregate_types::PURCHASE_ORDER => {
            let event: PurchaseOrderEvent = decode(envelope)?;
            Ok(Some(purchase_order_effect(&event)))
        }
        aggregate_types::TRANSFER => {
            let event: TransferEvent = decode(envelope)?;
            Ok(Some(transfer_effect(&event)))
        }
        _ => Ok(None),
    }
}

fn decode<E: serde::de::DeserializeOwned>(
    envelope: &EventEnvelope<JsonValue>,
) -> Result<E, InventoryEffectError> {
    serde_json::from_value(envelope.payload().clone()).map_err(|e| InventoryEffectError::Deserialize {
        aggregate_type: envelope.aggregate_type().to_string(),
        message: e.to_string(),
    })
}

fn purchase_order_effect(event: &PurchaseOrderEvent) -> Effect {
    match event {
        PurchaseOrderEvent::GoodsReceived(e) => Effect::new(e.tenant_id, put_away(e.destination, &e.receipts, false))
            .closing(e.ledger.closure() == Closure::Closed),
        PurchaseOrderEvent::PurchaseOrderCreated(e) => Effect::new(e.tenant_id, vec![]),
        PurchaseOrderEvent::PurchaseOrderMarkedOrdered(e) => Effect::new(e.tenant_id, vec![]),
        PurchaseOrderEvent::PurchaseOrderCancelled(e) => Effect::new(e.tenant_id, vec![]).closing(true),
        PurchaseOrderEvent::PurchaseOrderDeleted(e) => Effect::new(e.tenant_id, vec![]).closing(true),
    }
}

fn transfer_effect(event: &TransferEvent) -> Effect {
    match event {
        TransferEvent::TransferReadyToShip(e) => Effect::new(
            e.tenant_id,
            each(&e.reserved, |s| StockMovement {
                location: e.origin,
                product: s.product_id,
                delta: StockLevel {
                    available: -s.quantity,
                    unavailable: s.quantity,
                    ..StockLevel::default()
                },
            }),
        ),
        TransferEvent::TransferDispatched(e) => {
            let mut movements = each(&e.dispatched, |s| StockMovement {
                location: e.origin,
                product: s.product_id,
                delta: StockLevel {
                    unavailable: -s.quantity,
                    on_hand: -s.quantity,
                    ..StockLevel::default()
                },
            });
            movements.extend(each(&e.dispatched, |s| StockMovement {
                location: e.destination,
                product: s.product_id,
                delta: StockLevel {
                    incoming: s.quantity,
                    ..StockLevel::default()
                },
            }));
            Effect::new(e.tenant_id, movements)
        }
        TransferEvent::TransferReceived(e) => Effect::new(e.tenant_id, put_away(e.destination, &e.receipts, true))
            .closing(e.ledger.closure() == Closure::Closed),
        TransferEvent::TransferCancelled(e) => Effect::new(
            e.tenant_id,
            each(&e.released, |s| StockMovement {
                location: e.origin,
                product: s.product_id,
                delta: StockLevel {
                    available: s.quantity,
                    unavailable: -s.quantity,
                    ..StockLevel::default()
                },
            }),
        )
        .closing(true),
        TransferEvent::TransferCreated(e) => Effect::new(e.tenant_id, vec![]),
        TransferEvent::ShipmentAttached(e) => Effect::new(e.tenant_id, vec![]),
        TransferEvent::ShipmentDetached(e) => Effect::new(e.tenant_id, vec![]),
        TransferEvent::TransferDeleted(e) => Effect::new(e.tenant_id, vec![]).closing(true),
    }
}

fn each(lines: &[StockLine], f: impl Fn(&StockLine) -> StockMovement) -> Vec<StockMovement> {
    lines.iter().map(f).collect()
}

/// Accepted units go on hand and become available; rejected units are dropped.
/// For transfers both also leave `incoming`.
fn put_away(destination: LocationId, receipts: &[LineReceipt], from_incoming: bool) -> Vec<StockMovement> {
    receipts
        .iter()
        .map(|r| StockMovement {
            location: destination,
            product: r.product_id,
            delta: StockLevel {
                available: r.accepted,
                on_hand: r.accepted,
                incoming: if from_incoming { -(r.accepted + r.rejected) } else { 0 },
                unavailable: 0,
            },
        })
        .collect()
}
