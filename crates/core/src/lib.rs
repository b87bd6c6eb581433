//! `procura-core`: building blocks shared by the receiving domain.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns):
//! aggregate traits, the optimistic concurrency expectation, the domain error
//! taxonomy and strongly-typed identifiers.

pub mod aggregate;
pub mod entity;
pub mod error;
pub mod id;
pub mod value_object;

pub use aggregate::{Aggregate, AggregateRoot, ExpectedVersion};
pub use entity::Entity;
pub use error::{DomainError, DomainResult};
pub use id::{AggregateId, TenantId};
pub use value_object::ValueObject;
