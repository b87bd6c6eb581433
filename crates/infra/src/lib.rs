//! Infrastructure layer: event store, command pipeline, application services,
//! inventory side effects and configuration.

pub mod aggregate_types;
pub mod command_dispatcher;
pub mod config;
pub mod event_store;
pub mod inventory_effects;
pub mod receiving_service;
pub mod shipment_coordinator;
pub mod workers;

mod integration_tests;

pub use command_dispatcher::{CommandDispatcher, DispatchError, Dispatched};
pub use config::ReceivingConfig;
pub use inventory_effects::{
    InMemoryInventoryLocations, InventoryEffects, InventoryLocations, StockLevel, StockMovement,
};
pub use receiving_service::{ReceiptOutcome, ReceivingService};
pub use shipment_coordinator::{ShipmentCoordinator, ShipmentReceipt, ShipmentTransition};
