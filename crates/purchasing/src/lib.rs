//! Purchasing domain module (Purchase Orders, event-sourced).
//!
//! Business rules for ordering from a supplier and receiving the goods in one
//! or more partial receipts. Pure domain logic: no IO, no HTTP, no storage.

pub mod order;

pub use order::{
    CancelPurchaseOrder, CreatePurchaseOrder, DeletePurchaseOrder, GoodsReceived, MarkOrdered,
    PurchaseOrder, PurchaseOrderCancelled, PurchaseOrderCommand, PurchaseOrderCreated,
    PurchaseOrderDeleted, PurchaseOrderEvent, PurchaseOrderId, PurchaseOrderMarkedOrdered,
    PurchaseOrderStatus, ReceiveGoods, SupplierId,
};
