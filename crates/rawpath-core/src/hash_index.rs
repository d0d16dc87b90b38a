//! Chained hash index keyed by a 64-bit signature.
//!
//! Entries live in an arena (a `Vec` of slots with a free list) and buckets
//! chain through slot indices, so insert and remove are O(1) once the bucket
//! chain is found and no entry ever moves in memory.
//!
//! Several entries may share a signature (e.g. a wildcard listener and a
//! connected flow on the same port). Lookups return every entry with the
//! matching signature through a cursor; callers compare their full keys.
//!
//! ```text
//!  buckets            slots
//!  ┌────┐        ┌──────────────┐    ┌──────────────┐
//!  │ 0  │──────▶ │ sig=443 next─┼──▶ │ sig=443 next─┼──▶ ∅
//!  ├────┤        └──────────────┘    └──────────────┘
//!  │ 1  │──▶ ∅
//!  ├────┤        ┌──────────────┐
//!  │ 2  │──────▶ │ sig=4433     │──▶ ∅
//!  └────┘        └──────────────┘
//! ```

/// Initial number of buckets.
const INITIAL_BUCKETS: usize = 16;

/// Average chain length that triggers a bucket array doubling.
const MAX_LOAD_FACTOR: usize = 4;

/// Stable handle to an inserted entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntryId {
    index: u32,
    generation: u32,
}

/// Position within a signature chain, used to continue a lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cursor {
    signature: u64,
    index: u32,
}

impl Cursor {
    /// Entry the cursor currently points at.
    pub fn entry(&self, index: &AddressHashIndex<impl Sized>) -> Option<EntryId> {
        index.slots.get(self.index as usize).map(|slot| EntryId {
            index: self.index,
            generation: slot.generation,
        })
    }
}

#[derive(Debug)]
struct Slot<T> {
    value: Option<T>,
    signature: u64,
    generation: u32,
    next: Option<u32>,
}

/// Chained hash table of `T` keyed by signature.
#[derive(Debug)]
pub struct AddressHashIndex<T> {
    buckets: Vec<Option<u32>>,
    slots: Vec<Slot<T>>,
    free_head: Option<u32>,
    len: usize,
    resizable: bool,
}

impl<T> Default for AddressHashIndex<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> AddressHashIndex<T> {
    /// Create an empty index that grows its bucket array on demand.
    pub fn new() -> Self {
        Self::with_buckets(INITIAL_BUCKETS, true)
    }

    /// Create an index with a fixed bucket count (rounded up to a power of two).
    pub fn with_fixed_buckets(buckets: usize) -> Self {
        Self::with_buckets(buckets, false)
    }

    fn with_buckets(buckets: usize, resizable: bool) -> Self {
        let buckets = buckets.max(1).next_power_of_two();
        Self {
            buckets: vec![None; buckets],
            slots: Vec::new(),
            free_head: None,
            len: 0,
            resizable,
        }
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the index holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Current bucket count.
    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    fn bucket_of(&self, signature: u64) -> usize {
        // Fibonacci hashing spreads small sequential signatures (ports).
        let hash = signature.wrapping_mul(0x9E37_79B9_7F4A_7C15);
        let bits = self.buckets.len().trailing_zeros();
        if bits == 0 {
            0
        } else {
            (hash >> (64 - bits)) as usize
        }
    }

    /// Insert `value` under `signature`.
    pub fn insert(&mut self, value: T, signature: u64) -> EntryId {
        if self.resizable && self.len >= self.buckets.len() * MAX_LOAD_FACTOR {
            self.grow();
        }

        let bucket = self.bucket_of(signature);
        let head = self.buckets[bucket];

        let index = match self.free_head {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                self.free_head = slot.next;
                slot.value = Some(value);
                slot.signature = signature;
                slot.next = head;
                index
            }
            None => {
                let index = self.slots.len() as u32;
                self.slots.push(Slot {
                    value: Some(value),
                    signature,
                    generation: 0,
                    next: head,
                });
                index
            }
        };

        self.buckets[bucket] = Some(index);
        self.len += 1;

        EntryId {
            index,
            generation: self.slots[index as usize].generation,
        }
    }

    /// Remove an entry, returning its value if the handle is still live.
    pub fn remove(&mut self, id: EntryId) -> Option<T> {
        let slot = self.slots.get(id.index as usize)?;
        if slot.generation != id.generation || slot.value.is_none() {
            return None;
        }

        let bucket = self.bucket_of(slot.signature);
        let mut prev: Option<u32> = None;
        let mut current = self.buckets[bucket];
        while let Some(index) = current {
            if index == id.index {
                let next = self.slots[index as usize].next;
                match prev {
                    Some(p) => self.slots[p as usize].next = next,
                    None => self.buckets[bucket] = next,
                }
                break;
            }
            prev = current;
            current = self.slots[index as usize].next;
        }

        let slot = &mut self.slots[id.index as usize];
        let value = slot.value.take();
        slot.generation = slot.generation.wrapping_add(1);
        slot.next = self.free_head;
        self.free_head = Some(id.index);
        self.len -= 1;
        value
    }

    /// Borrow an entry by handle.
    pub fn get(&self, id: EntryId) -> Option<&T> {
        self.slots
            .get(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.value.as_ref())
    }

    /// First entry with `signature`, and a cursor to continue from.
    pub fn lookup(&self, signature: u64) -> Option<(Cursor, &T)> {
        let head = self.buckets[self.bucket_of(signature)];
        self.scan_from(head, signature)
    }

    /// Next entry after `cursor` sharing its signature.
    pub fn lookup_next(&self, cursor: Cursor) -> Option<(Cursor, &T)> {
        let next = self.slots.get(cursor.index as usize)?.next;
        self.scan_from(next, cursor.signature)
    }

    fn scan_from(&self, mut current: Option<u32>, signature: u64) -> Option<(Cursor, &T)> {
        while let Some(index) = current {
            let slot = &self.slots[index as usize];
            if slot.signature == signature {
                if let Some(value) = slot.value.as_ref() {
                    return Some((Cursor { signature, index }, value));
                }
            }
            current = slot.next;
        }
        None
    }

    /// Iterate every entry with `signature`.
    pub fn matches(&self, signature: u64) -> Matches<'_, T> {
        Matches {
            index: self,
            next: self.lookup(signature),
        }
    }

    /// Weak enumeration of every entry.
    ///
    /// Holding `&self` for the duration rules out concurrent mutation.
    pub fn enumerate(&self) -> Enumeration<'_, T> {
        Enumeration {
            slots: self.slots.iter().enumerate(),
        }
    }

    fn grow(&mut self) {
        let new_len = self.buckets.len() * 2;
        self.buckets = vec![None; new_len];
        for index in 0..self.slots.len() {
            if self.slots[index].value.is_none() {
                continue;
            }
            let bucket = self.bucket_of(self.slots[index].signature);
            self.slots[index].next = self.buckets[bucket];
            self.buckets[bucket] = Some(index as u32);
        }
        tracing::debug!(buckets = new_len, entries = self.len, "hash index resized");
    }
}

/// Iterator over entries sharing one signature.
pub struct Matches<'a, T> {
    index: &'a AddressHashIndex<T>,
    next: Option<(Cursor, &'a T)>,
}

impl<'a, T> Iterator for Matches<'a, T> {
    type Item = (EntryId, &'a T);

    fn next(&mut self) -> Option<Self::Item> {
        let (cursor, value) = self.next.take()?;
        self.next = self.index.lookup_next(cursor);
        let id = cursor.entry(self.index)?;
        Some((id, value))
    }
}

/// Iterator over every entry in the index.
pub struct Enumeration<'a, T> {
    slots: std::iter::Enumerate<std::slice::Iter<'a, Slot<T>>>,
}

impl<'a, T> Iterator for Enumeration<'a, T> {
    type Item = (EntryId, &'a T);

    fn next(&mut self) -> Option<Self::Item> {
        for (index, slot) in self.slots.by_ref() {
            if let Some(value) = slot.value.as_ref() {
                return Some((
                    EntryId {
                        index: index as u32,
                        generation: slot.generation,
                    },
                    value,
                ));
            }
        }
        None
    }
}
