//! A replicated text document.
//!
//! [`Document`] ties the sequence to everything needed to replicate it: the
//! identifier generator, the version vector, the operation log, and the
//! buffer of remote operations waiting on dependencies. Local edits and
//! remote operations both end in the same apply path, which integrates the
//! operation, advances the version vector, and appends to the log.
//!
//! # Example
//!
//! ```
//! use std::time::Instant;
//! use cowrite::document::Document;
//! use cowrite::key::ReplicaKey;
//!
//! let mut alice = Document::new(ReplicaKey::generate(), 64);
//! let mut bob = Document::new(ReplicaKey::generate(), 64);
//!
//! for op in alice.insert_str_local(0, "hello").unwrap() {
//!     bob.apply_remote(op, Instant::now()).unwrap();
//! }
//! assert_eq!(bob.materialize(), "hello");
//! ```

use std::time::Duration;
use std::time::Instant;

use tracing::debug;
use tracing::warn;

use crate::crdt::Crdt;
use crate::crdt::clock::VersionVector;
use crate::crdt::id::IdGenerator;
use crate::crdt::id::Identifier;
use crate::crdt::op::Insert;
use crate::crdt::op::OpKind;
use crate::crdt::op::Operation;
use crate::crdt::pending::PendingBuffer;
use crate::crdt::rga::Rga;
use crate::error::Error;
use crate::error::Result;
use crate::key::ReplicaId;
use crate::key::ReplicaKey;
use crate::log::Checkpoint;
use crate::log::OpLog;

/// What happened to a remote operation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Delivery {
    /// The operation was applied, followed by any buffered operations it
    /// unblocked, in application order.
    Applied(Vec<Operation>),
    /// Dependencies are missing; the operation is waiting.
    Buffered,
    /// Already applied or already waiting.
    Duplicate,
}

pub struct Document {
    key: ReplicaKey,
    ids: IdGenerator,
    rga: Rga,
    version: VersionVector,
    log: OpLog,
    pending: PendingBuffer,
    needs_resync: bool,
}

fn is_ready(version: &VersionVector, rga: &Rga, op: &Operation) -> bool {
    if op.seq != version.get(&op.replica) + 1 {
        return false;
    }
    return op.dependencies().iter().all(|id| rga.contains(id));
}

impl Document {
    /// Create an empty document owned by `key`'s replica.
    pub fn new(key: ReplicaKey, pending_capacity: usize) -> Document {
        let ids = IdGenerator::new(key.id());
        return Document {
            key,
            ids,
            rga: Rga::new(),
            version: VersionVector::new(),
            log: OpLog::new(),
            pending: PendingBuffer::new(pending_capacity),
            needs_resync: false,
        };
    }

    /// Rebuild a document by replaying `log` from its checkpoint (or from
    /// empty if it has none).
    pub fn from_log(key: ReplicaKey, log: &OpLog, pending_capacity: usize) -> Result<Document> {
        let mut doc = Document::new(key, pending_capacity);
        if let Some(checkpoint) = log.checkpoint() {
            doc.rga = Rga::import(&checkpoint.elements)?;
            doc.version = checkpoint.version.clone();
            for element in &checkpoint.elements {
                doc.ids.observe(element.id.counter);
            }
            doc.log = OpLog::from_checkpoint(checkpoint.clone());
        }
        for op in log.entries() {
            if !is_ready(&doc.version, &doc.rga, op) {
                return Err(Error::Inconsistent(format!(
                    "log entry {:?}#{} replayed out of order",
                    op.replica, op.seq
                )));
            }
            doc.apply_ready(op.clone())?;
        }
        return Ok(doc);
    }

    /// Rebuild this document from its own log, keeping waiting operations.
    pub fn rebuild(&self) -> Result<Document> {
        let mut doc = Document::from_log(self.key.clone(), &self.log, 1)?;
        doc.pending = self.pending.clone();
        doc.needs_resync = self.needs_resync;
        return Ok(doc);
    }

    pub fn replica(&self) -> ReplicaId {
        return self.key.id();
    }

    pub fn key(&self) -> &ReplicaKey {
        return &self.key;
    }

    /// Visible length in characters.
    pub fn len(&self) -> usize {
        return self.rga.len();
    }

    pub fn is_empty(&self) -> bool {
        return self.rga.is_empty();
    }

    /// The visible text.
    pub fn materialize(&self) -> String {
        return self.rga.materialize();
    }

    pub fn sequence(&self) -> &Rga {
        return &self.rga;
    }

    pub fn log(&self) -> &OpLog {
        return &self.log;
    }

    pub fn version(&self) -> &VersionVector {
        return &self.version;
    }

    pub fn pending_len(&self) -> usize {
        return self.pending.len();
    }

    /// Whether operations were dropped and the document may be missing data.
    pub fn needs_resync(&self) -> bool {
        return self.needs_resync;
    }

    pub fn clear_resync(&mut self) {
        self.needs_resync = false;
    }

    fn next_seq(&self) -> u64 {
        return self.version.get(&self.key.id()) + 1;
    }

    // =========================================================================
    // Local edits
    // =========================================================================

    /// Insert one character at visible position `pos`.
    pub fn insert_local(&mut self, pos: usize, value: char) -> Result<Operation> {
        let (origin_left, origin_right) = self.rga.anchors(pos)?;
        let insert = Insert {
            id: self.ids.next(),
            value,
            origin_left,
            origin_right,
        };
        let op = Operation {
            replica: self.key.id(),
            seq: self.next_seq(),
            kind: OpKind::Insert(insert),
        };
        self.apply_ready(op.clone())?;
        return Ok(op);
    }

    /// Insert a string at visible position `pos`, one operation per character.
    pub fn insert_str_local(&mut self, pos: usize, text: &str) -> Result<Vec<Operation>> {
        if pos > self.rga.len() {
            return Err(Error::InvalidPosition { position: pos, len: self.rga.len() });
        }
        let mut ops = Vec::with_capacity(text.len());
        for (i, value) in text.chars().enumerate() {
            ops.push(self.insert_local(pos + i, value)?);
        }
        return Ok(ops);
    }

    /// Delete the live character at visible position `pos`.
    pub fn delete_local(&mut self, pos: usize) -> Result<Operation> {
        let id = self
            .rga
            .id_at(pos)
            .ok_or(Error::InvalidPosition { position: pos, len: self.rga.len() })?;
        let op = Operation {
            replica: self.key.id(),
            seq: self.next_seq(),
            kind: OpKind::Delete { id },
        };
        self.apply_ready(op.clone())?;
        return Ok(op);
    }

    /// Delete `len` characters starting at visible position `pos`.
    pub fn delete_range_local(&mut self, pos: usize, len: usize) -> Result<Vec<Operation>> {
        let in_bounds = pos.checked_add(len).is_some_and(|end| end <= self.rga.len());
        if !in_bounds {
            return Err(Error::InvalidPosition { position: pos.saturating_add(len), len: self.rga.len() });
        }
        let mut ops = Vec::with_capacity(len);
        for _ in 0..len {
            ops.push(self.delete_local(pos)?);
        }
        return Ok(ops);
    }

    /// Replace the whole visible text with `text` as one forward operation.
    ///
    /// Every live element is tombstoned and `text` is inserted as fresh
    /// elements right after the head.
    pub fn replace_local(&mut self, text: &str) -> Result<Operation> {
        let deletes = self.rga.live_ids();
        let (_, origin_right) = self.rga.anchors(0)?;
        let mut origin_left = Identifier::HEAD;
        let mut inserts = Vec::with_capacity(text.len());
        for value in text.chars() {
            let id = self.ids.next();
            inserts.push(Insert { id, value, origin_left, origin_right });
            origin_left = id;
        }
        let op = Operation {
            replica: self.key.id(),
            seq: self.next_seq(),
            kind: OpKind::Replace { deletes, inserts },
        };
        self.apply_ready(op.clone())?;
        return Ok(op);
    }

    // =========================================================================
    // Remote operations
    // =========================================================================

    /// Apply an operation from another replica, or buffer it until it can be.
    ///
    /// An `Inconsistent` error means the sequence is damaged and the
    /// document should be rebuilt from its log.
    pub fn apply_remote(&mut self, op: Operation, now: Instant) -> Result<Delivery> {
        if self.version.contains(&op.replica, op.seq) || self.pending.contains(op.key()) {
            return Ok(Delivery::Duplicate);
        }

        if !is_ready(&self.version, &self.rga, &op) {
            debug!(replica = ?op.replica, seq = op.seq, "buffering operation with missing dependencies");
            if let Some(evicted) = self.pending.push(op, now) {
                warn!(
                    replica = ?evicted.replica,
                    seq = evicted.seq,
                    "pending buffer full, evicted oldest operation"
                );
                self.needs_resync = true;
            }
            return Ok(Delivery::Buffered);
        }

        let mut applied = vec![op.clone()];
        self.apply_ready(op)?;
        self.drain_pending(&mut applied)?;
        return Ok(Delivery::Applied(applied));
    }

    /// Apply every buffered operation that has become ready, then drop
    /// buffered copies of anything already applied.
    fn drain_pending(&mut self, applied: &mut Vec<Operation>) -> Result<()> {
        loop {
            let (version, rga) = (&self.version, &self.rga);
            let Some(next) = self.pending.take_ready(|o| is_ready(version, rga, o)) else {
                break;
            };
            applied.push(next.clone());
            self.apply_ready(next)?;
        }

        let version = &self.version;
        self.pending.discard(|o| version.contains(&o.replica, o.seq));
        return Ok(());
    }

    /// Drop buffered operations that have waited longer than `timeout`.
    ///
    /// Each dropped operation is reported as [`Error::DependencyTimeout`]
    /// and the document is flagged for resync.
    pub fn expire_pending(&mut self, now: Instant, timeout: Duration) -> Vec<Error> {
        let expired = self.pending.expire(now, timeout);
        if !expired.is_empty() {
            self.needs_resync = true;
        }
        return expired
            .into_iter()
            .map(|op| Error::DependencyTimeout { replica: op.replica, seq: op.seq })
            .collect();
    }

    fn apply_ready(&mut self, op: Operation) -> Result<()> {
        match &op.kind {
            OpKind::Insert(insert) => {
                self.rga.integrate(insert)?;
                self.ids.observe(insert.id.counter);
            }
            OpKind::Delete { id } => {
                self.rga.tombstone(id)?;
            }
            OpKind::Replace { deletes, inserts } => {
                for id in deletes {
                    self.rga.tombstone(id)?;
                }
                for insert in inserts {
                    self.rga.integrate(insert)?;
                    self.ids.observe(insert.id.counter);
                }
            }
        }
        self.version.observe(op.replica, op.seq);
        self.log.append(op);
        return Ok(());
    }

    // =========================================================================
    // History
    // =========================================================================

    /// Operations a peer at version `from` is missing.
    pub fn catch_up(&self, from: &VersionVector) -> Result<Vec<Operation>> {
        return self.log.replay_from(from);
    }

    /// The current element set and version, as a log base.
    pub fn checkpoint(&self) -> Checkpoint {
        return Checkpoint {
            version: self.version.clone(),
            elements: self.rga.export(),
        };
    }

    /// Compact the log up to `checkpoint`. Returns the entries dropped.
    pub fn compact(&mut self, checkpoint: Checkpoint) -> usize {
        return self.log.compact(checkpoint);
    }

    /// Adopt a peer's full state as the new base.
    ///
    /// Used when the peer's log no longer reaches back to this replica's
    /// version. Logged operations the checkpoint does not cover, and any
    /// still waiting in the buffer, are reapplied on top of it. Returns
    /// false if there was nothing to adopt, or if the checkpoint is older
    /// than this document's own log base.
    pub fn install(&mut self, checkpoint: Checkpoint, now: Instant) -> Result<bool> {
        if self.version.dominates(&checkpoint.version) {
            return Ok(false);
        }
        if let Some(base) = self.log.checkpoint() {
            if !checkpoint.version.dominates(&base.version) {
                warn!("peer state predates the local log base, not installing");
                return Ok(false);
            }
        }

        let base = OpLog::from_checkpoint(checkpoint);
        let mut doc = Document::from_log(self.key.clone(), &base, 1)?;
        doc.pending = self.pending.clone();
        doc.ids.observe(self.ids.counter());
        for op in self.log.entries() {
            doc.apply_remote(op.clone(), now)?;
        }
        doc.drain_pending(&mut Vec::new())?;

        debug!(
            elements = doc.rga.element_count(),
            pending = doc.pending.len(),
            "installed peer state"
        );
        *self = doc;
        return Ok(true);
    }
}

impl Crdt for Document {
    /// Apply everything `other` has logged that this document lacks.
    fn merge(&mut self, other: &Self) {
        let now = Instant::now();
        let missing = match other.catch_up(&self.version) {
            Ok(ops) => ops,
            Err(Error::LogCompacted { .. }) => {
                if let Err(e) = self.install(other.checkpoint(), now) {
                    warn!(%e, "merge needs a full resync");
                    self.needs_resync = true;
                }
                return;
            }
            Err(e) => {
                warn!(%e, "merge needs a full resync");
                self.needs_resync = true;
                return;
            }
        };
        for op in missing {
            if let Err(e) = self.apply_remote(op, now) {
                warn!(%e, "merge stopped");
                return;
            }
        }
    }
}
