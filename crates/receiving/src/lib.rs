//! Receiving domain kernel: line-item ledger, batch reconciliation and closure
//! derivation.
//!
//! Everything here is deterministic domain logic (no IO, no storage). Purchase
//! orders and transfers embed a [`LineLedger`] and route every receipt through
//! [`reconcile`], so both parents share one set of quantity rules.

pub mod closure;
pub mod ledger;
pub mod line;
pub mod reconcile;

pub use closure::{Closure, LineRemaining};
pub use ledger::LineLedger;
pub use line::{LineId, LineItem, LocationId, NewLine, ProductId};
pub use reconcile::{Adjustment, LineReceipt, Reconciliation, reconcile};
