//! Background workers consuming the event bus.

pub mod effects_worker;

pub use effects_worker::{EffectsWorker, WorkerHandle, spawn_inventory_effects};
