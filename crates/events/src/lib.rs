//! `procura-events`: event contracts and pub/sub mechanics.
//!
//! Domain crates implement [`Event`] for their event enums; infrastructure wraps
//! committed events in [`EventEnvelope`]s and fans them out over an [`EventBus`].

pub mod bus;
pub mod envelope;
pub mod event;
pub mod handler;
pub mod in_memory_bus;
pub mod tenant;

pub use bus::{EventBus, Subscription};
pub use envelope::EventEnvelope;
pub use event::Event;
pub use handler::execute;
pub use in_memory_bus::{InMemoryBusError, InMemoryEventBus};
pub use tenant::TenantScoped;
