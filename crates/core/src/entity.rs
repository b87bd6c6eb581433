//! Entity trait: identity that survives state changes.

/// Entity marker + minimal interface.
///
/// Line items are entities: a line keeps its id while its received and
/// rejected counts move.
pub trait Entity {
    type Id: Clone + Eq + core::hash::Hash + core::fmt::Debug;

    fn id(&self) -> &Self::Id;
}
