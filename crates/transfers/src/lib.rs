//! Transfers domain module (stock transfers between locations and the
//! shipments that carry them, event-sourced).
//!
//! A [`Transfer`] owns its lines and status; a [`Shipment`] owns only its own
//! lifecycle and points back at one transfer. Keeping the two consistent is the
//! job of the infrastructure-level shipment coordinator, which drives both
//! aggregates through their commands.

pub mod shipment;
pub mod transfer;

pub use shipment::{
    CancelShipment, CreateShipment, MarkInTransit, MarkReceived, Shipment, ShipmentCancelled,
    ShipmentCommand, ShipmentCreated, ShipmentEvent, ShipmentId, ShipmentInTransit,
    ShipmentReceived, ShipmentStatus,
};
pub use transfer::{
    AttachShipment, CancelTransfer, CreateTransfer, DeleteTransfer, DetachShipment,
    MarkReadyToShip, ReceiveTransfer, ShipmentAttached, ShipmentDetached, StartTransit, StockLine,
    Transfer, TransferCancelled, TransferCommand, TransferCreated, TransferDeleted,
    TransferDispatched, TransferEvent, TransferId, TransferReadyToShip, TransferReceived,
    TransferStatus,
};
