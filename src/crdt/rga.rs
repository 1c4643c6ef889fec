//! Replicated Growable Array (RGA) for text.
//!
//! The sequence holds one element per inserted character, bounded by fixed
//! head and tail sentinels. Key design decisions:
//!
//! 1. **Arena storage**: elements live in a flat `Vec` and are linked in
//!    document order by slot index. Origins are stored as identifiers and
//!    resolved through an id-to-slot map, so nothing points into the arena
//!    structurally.
//!
//! 2. **Tombstones**: deleting only flips a flag. Deleted elements stay in
//!    the sequence so later inserts can still anchor on them.
//!
//! 3. **Ordering rule**: an insert goes after its left origin, skipping
//!    every following element whose id is larger than its own, and never
//!    past its right origin. Because ids come from a Lamport-style counter,
//!    the skipped elements are exactly the concurrent inserts at the same
//!    gap that sort first (larger `(counter, replica)` first) together with
//!    everything inserted after them.
//!
//! Position lookups walk the list and are O(n) in the element count,
//! tombstones included.

use rustc_hash::FxHashMap;
use serde::Deserialize;
use serde::Serialize;

use crate::crdt::id::Identifier;
use crate::crdt::op::Insert;
use crate::error::Error;
use crate::error::Result;

/// Sentinel value for "no next slot".
const NONE: u32 = u32::MAX;

const HEAD_SLOT: u32 = 0;
const TAIL_SLOT: u32 = 1;

/// One character of the document, live or tombstoned.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Element {
    pub id: Identifier,
    /// The character, or `None` for the sentinels.
    pub value: Option<char>,
    pub origin_left: Identifier,
    pub origin_right: Identifier,
    pub deleted: bool,
}

impl Element {
    fn sentinel(id: Identifier) -> Element {
        return Element {
            id,
            value: None,
            origin_left: Identifier::HEAD,
            origin_right: Identifier::TAIL,
            deleted: false,
        };
    }

    fn from_insert(insert: &Insert) -> Element {
        return Element {
            id: insert.id,
            value: Some(insert.value),
            origin_left: insert.origin_left,
            origin_right: insert.origin_right,
            deleted: false,
        };
    }

    /// True for a non-sentinel element that has not been deleted.
    pub fn is_live(&self) -> bool {
        return self.value.is_some() && !self.deleted;
    }
}

#[derive(Clone, Debug)]
struct Slot {
    element: Element,
    next: u32,
}

/// The replicated sequence.
#[derive(Clone, Debug)]
pub struct Rga {
    /// Arena of elements; slots 0 and 1 are the head and tail.
    slots: Vec<Slot>,
    /// Maps element id to arena slot.
    index: FxHashMap<Identifier, u32>,
    /// Number of live elements.
    live: usize,
}

impl Rga {
    /// Create an empty sequence holding only the sentinels.
    pub fn new() -> Rga {
        let mut index = FxHashMap::default();
        index.insert(Identifier::HEAD, HEAD_SLOT);
        index.insert(Identifier::TAIL, TAIL_SLOT);
        return Rga {
            slots: vec![
                Slot { element: Element::sentinel(Identifier::HEAD), next: TAIL_SLOT },
                Slot { element: Element::sentinel(Identifier::TAIL), next: NONE },
            ],
            index,
            live: 0,
        };
    }

    /// Visible length in characters.
    pub fn len(&self) -> usize {
        return self.live;
    }

    pub fn is_empty(&self) -> bool {
        return self.live == 0;
    }

    /// Number of elements ever inserted, tombstones included.
    pub fn element_count(&self) -> usize {
        return self.slots.len() - 2;
    }

    /// Whether an element (or sentinel) with this id exists.
    pub fn contains(&self, id: &Identifier) -> bool {
        return self.index.contains_key(id);
    }

    pub fn get(&self, id: &Identifier) -> Option<&Element> {
        let slot = *self.index.get(id)?;
        return Some(&self.slots[slot as usize].element);
    }

    pub fn is_live(&self, id: &Identifier) -> bool {
        return self.get(id).is_some_and(Element::is_live);
    }

    /// Elements in document order, tombstones included, sentinels excluded.
    pub fn iter(&self) -> Iter<'_> {
        return Iter {
            rga: self,
            cursor: self.slots[HEAD_SLOT as usize].next,
        };
    }

    /// The visible text.
    pub fn materialize(&self) -> String {
        return self.iter().filter(|e| !e.deleted).filter_map(|e| e.value).collect();
    }

    /// Ids of the live elements, in visible order.
    pub fn live_ids(&self) -> Vec<Identifier> {
        return self.iter().filter(|e| e.is_live()).map(|e| e.id).collect();
    }

    fn slot_of(&self, id: &Identifier) -> Result<u32> {
        return self
            .index
            .get(id)
            .copied()
            .ok_or_else(|| Error::Inconsistent(format!("unknown element {id:?}")));
    }

    /// Slot of the live element at visible position `pos`.
    fn live_slot_at(&self, pos: usize) -> Option<u32> {
        let mut seen = 0;
        let mut cursor = self.slots[HEAD_SLOT as usize].next;
        while cursor != TAIL_SLOT && cursor != NONE {
            let slot = &self.slots[cursor as usize];
            if slot.element.is_live() {
                if seen == pos {
                    return Some(cursor);
                }
                seen += 1;
            }
            cursor = slot.next;
        }
        return None;
    }

    /// Id of the live element at visible position `pos`.
    pub fn id_at(&self, pos: usize) -> Option<Identifier> {
        let slot = self.live_slot_at(pos)?;
        return Some(self.slots[slot as usize].element.id);
    }

    /// Origins for a new element at visible position `pos`.
    ///
    /// The left origin is the live element just before `pos` (or the head).
    /// The right origin is whatever immediately follows the left origin,
    /// which may be a tombstone or the tail.
    pub fn anchors(&self, pos: usize) -> Result<(Identifier, Identifier)> {
        if pos > self.live {
            return Err(Error::InvalidPosition { position: pos, len: self.live });
        }
        let left = if pos == 0 {
            HEAD_SLOT
        } else {
            self.live_slot_at(pos - 1)
                .ok_or_else(|| Error::Inconsistent(format!("live count disagrees at {pos}")))?
        };
        let right = self.slots[left as usize].next;
        return Ok((
            self.slots[left as usize].element.id,
            self.slots[right as usize].element.id,
        ));
    }

    /// Number of live elements at or before `id` in document order.
    ///
    /// Inserting at this visible position places the new text right after
    /// `id`, or after its nearest live predecessor if `id` is a tombstone.
    pub fn position_after(&self, id: &Identifier) -> Option<usize> {
        let target = *self.index.get(id)?;
        let mut count = 0;
        let mut cursor = HEAD_SLOT;
        loop {
            let slot = &self.slots[cursor as usize];
            if slot.element.is_live() {
                count += 1;
            }
            if cursor == target {
                return Some(count);
            }
            cursor = slot.next;
            if cursor == NONE {
                return None;
            }
        }
    }

    /// Splice an insert into the sequence.
    ///
    /// Returns `Ok(false)` if the element is already present. Both origins
    /// must exist; callers check dependencies before integrating.
    pub fn integrate(&mut self, insert: &Insert) -> Result<bool> {
        if self.index.contains_key(&insert.id) {
            return Ok(false);
        }
        if insert.id.is_sentinel() {
            return Err(Error::Inconsistent("insert reuses a sentinel id".to_string()));
        }

        let left = self.slot_of(&insert.origin_left)?;
        let right = self.slot_of(&insert.origin_right)?;
        if left == TAIL_SLOT {
            return Err(Error::Inconsistent(format!("{:?} anchored after the tail", insert.id)));
        }

        // Skip concurrent inserts that sort before this one, and their descendants.
        let mut prev = left;
        let mut cursor = self.slots[left as usize].next;
        while cursor != right && cursor != TAIL_SLOT && cursor != NONE {
            let slot = &self.slots[cursor as usize];
            if slot.element.id < insert.id {
                break;
            }
            prev = cursor;
            cursor = slot.next;
        }

        self.link_after(prev, Element::from_insert(insert))?;
        return Ok(true);
    }

    fn link_after(&mut self, prev: u32, element: Element) -> Result<()> {
        let slot = u32::try_from(self.slots.len())
            .ok()
            .filter(|slot| *slot != NONE)
            .ok_or_else(|| Error::Inconsistent("sequence is full".to_string()))?;
        let next = self.slots[prev as usize].next;
        if element.is_live() {
            self.live += 1;
        }
        self.index.insert(element.id, slot);
        self.slots.push(Slot { element, next });
        self.slots[prev as usize].next = slot;
        return Ok(());
    }

    /// Tombstone an element.
    ///
    /// Returns `Ok(false)` if it was already deleted.
    pub fn tombstone(&mut self, id: &Identifier) -> Result<bool> {
        if id.is_sentinel() {
            return Err(Error::Inconsistent("sentinels cannot be deleted".to_string()));
        }
        let slot = self.slot_of(id)?;
        let element = &mut self.slots[slot as usize].element;
        if element.deleted {
            return Ok(false);
        }
        element.deleted = true;
        self.live -= 1;
        return Ok(true);
    }

    /// Every element in document order, for checkpoints.
    pub fn export(&self) -> Vec<Element> {
        return self.iter().cloned().collect();
    }

    /// Rebuild a sequence from exported elements, keeping their order.
    pub fn import(elements: &[Element]) -> Result<Rga> {
        let mut rga = Rga::new();
        let mut last = HEAD_SLOT;
        for element in elements {
            if element.id.is_sentinel() || element.value.is_none() {
                return Err(Error::Inconsistent("checkpoint contains a sentinel".to_string()));
            }
            if rga.index.contains_key(&element.id) {
                return Err(Error::Inconsistent(format!("duplicate element {:?}", element.id)));
            }
            rga.link_after(last, element.clone())?;
            last = (rga.slots.len() - 1) as u32;
        }
        return Ok(rga);
    }
}

impl Default for Rga {
    fn default() -> Self {
        return Self::new();
    }
}

/// Iterator over non-sentinel elements in document order.
pub struct Iter<'a> {
    rga: &'a Rga,
    cursor: u32,
}

impl<'a> Iterator for Iter<'a> {
    type Item = &'a Element;

    fn next(&mut self) -> Option<&'a Element> {
        if self.cursor == TAIL_SLOT || self.cursor == NONE {
            return None;
        }
        let slot = &self.rga.slots[self.cursor as usize];
        self.cursor = slot.next;
        return Some(&slot.element);
    }
}
