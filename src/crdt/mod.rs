//! The replicated sequence and the pieces it is built from.

pub mod clock;
pub mod id;
pub mod op;
pub mod pending;
pub mod rga;

/// A CRDT is a data type with a merge operator that is commutative,
/// associative, and idempotent.
pub trait Crdt {
    /// Merge another instance into this one.
    fn merge(&mut self, other: &Self);
}
