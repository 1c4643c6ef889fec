//! Point-in-time snapshots of a document.
//!
//! A snapshot records the materialized text together with the version vector
//! it reflects, so it names an exact prefix of the operation log. Snapshots
//! never change once taken, and the store only ever reads the document.
//! Reverting to one does not rewind history: the coordinator applies a
//! forward `Replace` operation that turns the current text into the
//! snapshot's text, and that operation replicates like any other.

use std::collections::BTreeMap;
use std::str::FromStr;

use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use tracing::info;

use crate::crdt::clock::VersionVector;
use crate::document::Document;
use crate::error::Error;
use crate::error::Result;
use crate::key::Hash;
use crate::key::hash;
use crate::log::Checkpoint;

/// Snapshot identifier. Ids are issued in increasing order, so they sort
/// chronologically.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SnapshotId(pub u64);

impl std::fmt::Display for SnapshotId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        return write!(f, "snap-{:06}", self.0);
    }
}

impl FromStr for SnapshotId {
    type Err = Error;

    fn from_str(s: &str) -> Result<SnapshotId> {
        let digits = s.strip_prefix("snap-").unwrap_or(s);
        return digits
            .parse::<u64>()
            .map(SnapshotId)
            .map_err(|_| Error::MalformedSnapshotId(s.to_string()));
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: SnapshotId,
    pub timestamp: DateTime<Utc>,
    pub text: String,
    pub version: VersionVector,
    /// blake3 of `text`.
    pub digest: Hash,
    /// Full element set at `version`, used as a log base when compacting.
    #[serde(skip)]
    pub checkpoint: Option<Checkpoint>,
}

#[derive(Debug, Default)]
pub struct SnapshotStore {
    snapshots: BTreeMap<SnapshotId, Snapshot>,
    next_id: u64,
}

impl SnapshotStore {
    pub fn new() -> SnapshotStore {
        return SnapshotStore::default();
    }

    pub fn len(&self) -> usize {
        return self.snapshots.len();
    }

    pub fn is_empty(&self) -> bool {
        return self.snapshots.is_empty();
    }

    /// Record the document's current state under a fresh id.
    pub fn create(&mut self, doc: &Document) -> &Snapshot {
        self.next_id += 1;
        let id = SnapshotId(self.next_id);
        let text = doc.materialize();
        let snapshot = Snapshot {
            id,
            timestamp: Utc::now(),
            digest: hash(text.as_bytes()),
            text,
            version: doc.version().clone(),
            checkpoint: Some(doc.checkpoint()),
        };
        info!(%id, len = snapshot.text.chars().count(), "snapshot created");
        return self.snapshots.entry(id).or_insert(snapshot);
    }

    /// Snapshot ids, most recent first.
    pub fn list(&self) -> Vec<SnapshotId> {
        return self.snapshots.keys().rev().copied().collect();
    }

    pub fn get(&self, id: SnapshotId) -> Result<&Snapshot> {
        return self.snapshots.get(&id).ok_or(Error::SnapshotNotFound(id));
    }

    pub fn latest(&self) -> Option<&Snapshot> {
        return self.snapshots.values().next_back();
    }

    /// The text a revert to snapshot `id` restores.
    pub fn text_of(&self, id: SnapshotId) -> Result<&str> {
        return Ok(&self.get(id)?.text);
    }
}
