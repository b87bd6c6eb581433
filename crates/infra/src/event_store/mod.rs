//! Append-only event store boundary.
//!
//! Aggregates are persisted as tenant-scoped event streams. The stream's last
//! sequence number is the aggregate version the dispatcher guards appends with.

pub mod in_memory;
pub mod r#trait;

pub use in_memory::InMemoryEventStore;
pub use r#trait::{EventStore, EventStoreError, StoredEvent, UncommittedEvent};
