//! Version vectors.
//!
//! A version vector maps each replica to the highest operation sequence
//! number from that replica reflected in some state. Operations from one
//! replica are applied in sequence order with no gaps, so `v[r] = n` means
//! exactly operations `1..=n` of replica `r` are included.
//!
//! Complexity:
//! - observe: O(log n) where n is number of replicas
//! - merge: O(n)
//! - dominates: O(n)

use std::collections::BTreeMap;

use serde::Deserialize;
use serde::Serialize;

use crate::key::ReplicaId;

/// Highest applied sequence number per replica.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VersionVector {
    entries: BTreeMap<ReplicaId, u64>,
}

impl VersionVector {
    /// Create an empty version vector.
    pub fn new() -> VersionVector {
        return VersionVector {
            entries: BTreeMap::new(),
        };
    }

    /// Highest sequence number seen from `replica` (0 if none).
    pub fn get(&self, replica: &ReplicaId) -> u64 {
        return *self.entries.get(replica).unwrap_or(&0);
    }

    /// Whether operation `seq` of `replica` is already reflected.
    pub fn contains(&self, replica: &ReplicaId, seq: u64) -> bool {
        return seq <= self.get(replica);
    }

    /// Raise the entry for `replica` to at least `seq`.
    pub fn observe(&mut self, replica: ReplicaId, seq: u64) {
        let entry = self.entries.entry(replica).or_insert(0);
        *entry = (*entry).max(seq);
    }

    /// Pointwise maximum.
    pub fn merge(&mut self, other: &VersionVector) {
        for (replica, seq) in &other.entries {
            self.observe(*replica, *seq);
        }
    }

    /// True if every entry of `other` is reflected in `self`.
    pub fn dominates(&self, other: &VersionVector) -> bool {
        return other
            .entries
            .iter()
            .all(|(replica, seq)| self.get(replica) >= *seq);
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ReplicaId, &u64)> {
        return self.entries.iter();
    }

    pub fn len(&self) -> usize {
        return self.entries.len();
    }

    pub fn is_empty(&self) -> bool {
        return self.entries.is_empty();
    }
}
