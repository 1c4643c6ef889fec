//! Errors surfaced by documents, logs, snapshots, and coordinators.

use crate::key::ReplicaId;
use crate::snapshot::SnapshotId;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An edit referenced a visible index outside the document.
    #[error("position {position} is out of range (visible length {len})")]
    InvalidPosition { position: usize, len: usize },

    /// A buffered operation never had its prerequisites arrive.
    #[error("operation {replica:?}#{seq} timed out waiting for its dependencies")]
    DependencyTimeout { replica: ReplicaId, seq: u64 },

    #[error("snapshot {0} not found")]
    SnapshotNotFound(SnapshotId),

    #[error("malformed snapshot id {0:?}")]
    MalformedSnapshotId(String),

    /// Publishing to or subscribing from the broker failed.
    #[error("broker unavailable: {0}")]
    BrokerUnavailable(String),

    /// The sequence reached a state its invariants rule out. The document
    /// has to be rebuilt from its operation log.
    #[error("document is inconsistent: {0}")]
    Inconsistent(String),

    /// A replay was requested from before the log's compaction floor.
    #[error("log compacted past {replica:?}#{requested} (floor {floor})")]
    LogCompacted { replica: ReplicaId, requested: u64, floor: u64 },

    #[error("operation {replica:?}#{seq} failed verification")]
    BadSignature { replica: ReplicaId, seq: u64 },

    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The coordinator task for a document has stopped.
    #[error("coordinator closed")]
    CoordinatorClosed,
}
