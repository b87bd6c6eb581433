//! Value object trait: equality by value, not identity.

/// Marker trait for value objects.
///
/// A receive adjustment (`line, accept, reject`) is a value object: two
/// adjustments with the same numbers are interchangeable, and "changing" one
/// means building a new one.
pub trait ValueObject: Clone + PartialEq + core::fmt::Debug {}
