//! Stream names stored with every event and carried on bus envelopes.

pub const PURCHASE_ORDER: &str = "purchasing.order";
pub const TRANSFER: &str = "transfers.transfer";
pub const SHIPMENT: &str = "transfers.shipment";
