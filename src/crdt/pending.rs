//! Bounded buffer for operations whose dependencies have not arrived.
//!
//! A remote operation waits here when one of its origins or its delete
//! target is unknown, or when an earlier operation from the same replica is
//! still missing. The buffer is bounded: pushing into a full buffer evicts
//! the oldest entry, and entries older than the dependency timeout are
//! expired. Both outcomes mean the document may be missing data and needs a
//! full resync.

use std::collections::VecDeque;
use std::time::Duration;
use std::time::Instant;

use crate::crdt::op::Operation;
use crate::key::ReplicaId;

#[derive(Clone, Debug)]
struct Waiting {
    op: Operation,
    since: Instant,
}

#[derive(Clone, Debug)]
pub struct PendingBuffer {
    entries: VecDeque<Waiting>,
    capacity: usize,
}

impl PendingBuffer {
    pub fn new(capacity: usize) -> PendingBuffer {
        return PendingBuffer {
            entries: VecDeque::new(),
            capacity: capacity.max(1),
        };
    }

    pub fn len(&self) -> usize {
        return self.entries.len();
    }

    pub fn is_empty(&self) -> bool {
        return self.entries.is_empty();
    }

    /// Whether an operation with this log key is already waiting.
    pub fn contains(&self, key: (ReplicaId, u64)) -> bool {
        return self.entries.iter().any(|w| w.op.key() == key);
    }

    /// Buffer an operation. Returns the evicted oldest entry if the buffer was full.
    pub fn push(&mut self, op: Operation, now: Instant) -> Option<Operation> {
        let evicted = if self.entries.len() >= self.capacity {
            self.entries.pop_front().map(|w| w.op)
        } else {
            None
        };
        self.entries.push_back(Waiting { op, since: now });
        return evicted;
    }

    /// Remove and return the oldest operation for which `ready` holds.
    pub fn take_ready(&mut self, mut ready: impl FnMut(&Operation) -> bool) -> Option<Operation> {
        let idx = self.entries.iter().position(|w| ready(&w.op))?;
        return self.entries.remove(idx).map(|w| w.op);
    }

    /// Remove every operation for which `stale` holds.
    pub fn discard(&mut self, mut stale: impl FnMut(&Operation) -> bool) -> usize {
        let before = self.entries.len();
        self.entries.retain(|w| !stale(&w.op));
        return before - self.entries.len();
    }

    /// Remove and return operations that have waited longer than `timeout`.
    pub fn expire(&mut self, now: Instant, timeout: Duration) -> Vec<Operation> {
        let mut expired = Vec::new();
        let mut kept = VecDeque::with_capacity(self.entries.len());
        for waiting in self.entries.drain(..) {
            if now.saturating_duration_since(waiting.since) > timeout {
                expired.push(waiting.op);
            } else {
                kept.push_back(waiting);
            }
        }
        self.entries = kept;
        return expired;
    }
}
