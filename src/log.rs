//! Append-only operation log.
//!
//! Every operation a document applies, local or remote, is appended exactly
//! once, in application order. Application order respects causal
//! dependencies, so replaying the log front to back from an empty sequence
//! rebuilds the document exactly.
//!
//! Compaction trades history for space: entries covered by a checkpoint
//! (the full element set, tombstones included, plus its version vector) are
//! dropped and the checkpoint becomes the base that replay starts from.
//! Replaying from a version older than the base is no longer possible and
//! reports [`Error::LogCompacted`]. A peer that far behind is sent a whole
//! checkpoint instead, signed by the replica that sends it.

use rustc_hash::FxHashSet;
use serde::Deserialize;
use serde::Serialize;

use crate::crdt::clock::VersionVector;
use crate::crdt::op::Operation;
use crate::crdt::rga::Element;
use crate::error::Error;
use crate::error::Result;
use crate::key::ReplicaId;

/// Domain tag mixed into the digest of a checkpoint sent to a peer.
const STATE_CONTEXT: &[u8] = b"cowrite.state.v1";

/// Materialized base state for a compacted log.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub version: VersionVector,
    pub elements: Vec<Element>,
}

impl Checkpoint {
    /// Digest signed when sending this checkpoint to the replica `to`.
    pub fn digest(&self, to: &ReplicaId) -> Result<Vec<u8>> {
        let body = serde_json::to_vec(&(to, self))?;
        let mut hasher = blake3::Hasher::new();
        hasher.update(STATE_CONTEXT);
        hasher.update(&(body.len() as u64).to_le_bytes());
        hasher.update(&body);
        return Ok(hasher.finalize().as_bytes().to_vec());
    }
}

#[derive(Clone, Debug, Default)]
pub struct OpLog {
    entries: Vec<Operation>,
    keys: FxHashSet<(ReplicaId, u64)>,
    base: Option<Checkpoint>,
}

impl OpLog {
    /// Create a new empty log.
    pub fn new() -> OpLog {
        return OpLog::default();
    }

    /// Create a log whose history starts at `checkpoint`.
    pub fn from_checkpoint(checkpoint: Checkpoint) -> OpLog {
        return OpLog {
            entries: Vec::new(),
            keys: FxHashSet::default(),
            base: Some(checkpoint),
        };
    }

    /// Number of retained entries.
    pub fn len(&self) -> usize {
        return self.entries.len();
    }

    pub fn is_empty(&self) -> bool {
        return self.entries.is_empty();
    }

    /// Retained entries in application order.
    pub fn entries(&self) -> &[Operation] {
        return &self.entries;
    }

    pub fn checkpoint(&self) -> Option<&Checkpoint> {
        return self.base.as_ref();
    }

    /// Whether the operation with this key is recorded, either as an entry
    /// or inside the checkpoint.
    pub fn contains(&self, key: (ReplicaId, u64)) -> bool {
        if self.keys.contains(&key) {
            return true;
        }
        return self
            .base
            .as_ref()
            .is_some_and(|base| base.version.contains(&key.0, key.1));
    }

    /// Append an applied operation. Returns false if it was already recorded.
    pub fn append(&mut self, op: Operation) -> bool {
        if self.contains(op.key()) {
            return false;
        }
        self.keys.insert(op.key());
        self.entries.push(op);
        return true;
    }

    /// Version vector of everything the log reflects.
    pub fn version(&self) -> VersionVector {
        let mut version = match &self.base {
            Some(base) => base.version.clone(),
            None => VersionVector::new(),
        };
        for op in &self.entries {
            version.observe(op.replica, op.seq);
        }
        return version;
    }

    /// Every logged operation not reflected in `from`, in causal order.
    pub fn replay_from(&self, from: &VersionVector) -> Result<Vec<Operation>> {
        if let Some(base) = &self.base {
            for (replica, floor) in base.version.iter() {
                let requested = from.get(replica);
                if requested < *floor {
                    return Err(Error::LogCompacted {
                        replica: *replica,
                        requested,
                        floor: *floor,
                    });
                }
            }
        }
        return Ok(self
            .entries
            .iter()
            .filter(|op| !from.contains(&op.replica, op.seq))
            .cloned()
            .collect());
    }

    /// Drop entries covered by `checkpoint` and make it the new base.
    ///
    /// Returns the number of entries dropped. A checkpoint older than the
    /// current base is ignored.
    pub fn compact(&mut self, checkpoint: Checkpoint) -> usize {
        if let Some(base) = &self.base {
            if !checkpoint.version.dominates(&base.version) {
                return 0;
            }
        }
        let before = self.entries.len();
        let version = &checkpoint.version;
        self.entries.retain(|op| !version.contains(&op.replica, op.seq));
        self.keys.retain(|(replica, seq)| !version.contains(replica, *seq));
        self.base = Some(checkpoint);
        return before - self.entries.len();
    }
}
