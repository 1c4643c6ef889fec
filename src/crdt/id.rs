//! Element identifiers and the generator that issues them.
//!
//! An [`Identifier`] is a `(counter, replica)` pair. Identifiers are
//! globally unique because replica ids are, and totally ordered by counter
//! first with the replica id breaking ties.
//!
//! The generator behaves like a Lamport clock: it ticks for every local
//! insert and jumps past any counter it observes in remote inserts. An
//! element therefore always has a larger id than every element its author
//! could see when inserting it, which is what the sequence's ordering rule
//! relies on.

use std::cmp::Ordering;

use serde::Deserialize;
use serde::Serialize;

use crate::key::ReplicaId;

/// A unique, totally ordered element identifier.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identifier {
    pub counter: u64,
    pub replica: ReplicaId,
}

impl Identifier {
    /// The fixed start-of-document sentinel.
    pub const HEAD: Identifier = Identifier {
        counter: 0,
        replica: ReplicaId::MIN,
    };

    /// The fixed end-of-document sentinel.
    pub const TAIL: Identifier = Identifier {
        counter: 0,
        replica: ReplicaId::MAX,
    };

    pub fn new(counter: u64, replica: ReplicaId) -> Identifier {
        return Identifier { counter, replica };
    }

    /// True for the head and tail sentinels.
    pub fn is_sentinel(&self) -> bool {
        return *self == Identifier::HEAD || *self == Identifier::TAIL;
    }
}

impl PartialOrd for Identifier {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        return Some(self.cmp(other));
    }
}

impl Ord for Identifier {
    fn cmp(&self, other: &Self) -> Ordering {
        match self.counter.cmp(&other.counter) {
            Ordering::Equal => self.replica.cmp(&other.replica),
            other => other,
        }
    }
}

impl std::fmt::Debug for Identifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if *self == Identifier::HEAD {
            return write!(f, "HEAD");
        }
        if *self == Identifier::TAIL {
            return write!(f, "TAIL");
        }
        return write!(f, "{}@{:?}", self.counter, self.replica);
    }
}

/// Issues identifiers for one replica.
#[derive(Clone, Debug)]
pub struct IdGenerator {
    replica: ReplicaId,
    counter: u64,
}

impl IdGenerator {
    /// Create a generator. The first issued counter is 1; 0 belongs to the sentinels.
    pub fn new(replica: ReplicaId) -> IdGenerator {
        return IdGenerator { replica, counter: 0 };
    }

    pub fn replica(&self) -> ReplicaId {
        return self.replica;
    }

    /// The counter of the most recently issued or observed identifier.
    pub fn counter(&self) -> u64 {
        return self.counter;
    }

    /// Issue an identifier greater than every identifier issued or observed so far.
    pub fn next(&mut self) -> Identifier {
        self.counter += 1;
        return Identifier::new(self.counter, self.replica);
    }

    /// Record a counter seen in a remote insert.
    pub fn observe(&mut self, counter: u64) {
        self.counter = self.counter.max(counter);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::ReplicaKey;

    #[test]
    fn counter_is_primary_key() {
        let low = ReplicaKey::from_secret([1; 32]).id();
        let high = ReplicaKey::from_secret([2; 32]).id();
        let (low, high) = if low < high { (low, high) } else { (high, low) };

        assert!(Identifier::new(1, high) < Identifier::new(2, low));
        assert!(Identifier::new(3, low) < Identifier::new(3, high));
    }

    #[test]
    fn next_is_strictly_increasing() {
        let mut ids = IdGenerator::new(ReplicaKey::from_secret([1; 32]).id());
        let mut last = ids.next();
        for _ in 0..100 {
            let id = ids.next();
            assert!(id > last);
            last = id;
        }
    }

    #[test]
    fn observe_jumps_past_remote_counters() {
        let mut ids = IdGenerator::new(ReplicaKey::from_secret([1; 32]).id());
        ids.next();
        ids.observe(41);
        assert_eq!(ids.next().counter, 42);

        // Observing an older counter never moves the clock backwards.
        ids.observe(3);
        assert_eq!(ids.next().counter, 43);
    }

    #[test]
    fn issued_ids_are_never_sentinels() {
        let mut ids = IdGenerator::new(ReplicaId::MIN);
        let id = ids.next();
        assert!(!id.is_sentinel());
        assert!(Identifier::HEAD.is_sentinel());
        assert!(Identifier::TAIL.is_sentinel());
    }
}
