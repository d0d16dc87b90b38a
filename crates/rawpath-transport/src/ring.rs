//! Software descriptor rings.
//!
//! A [`SoftRing`] follows the single-producer/single-consumer protocol of
//! AF_XDP rings: the producer reserves slots, writes them and submits; the
//! consumer peeks at ready slots, takes them and releases. Indices are free
//! running `u32`s masked by the power-of-two size.
//!
//! ```text
//!         consumer    cached_cons          cached_prod    producer ─┐
//!            │            │                     │                   │
//!   ... ─────┴────────────┴─────────────────────┴───────────────────┘
//!            └ taken, not released ┘└── ready ──┘└ reserved, unsubmitted
//! ```

/// Fixed-size ring of owned descriptors.
#[derive(Debug)]
pub struct SoftRing<T> {
    /// Ring size (power of 2)
    size: u32,
    slots: Vec<Option<T>>,
    /// Producer index
    producer: u32,
    /// Consumer index
    consumer: u32,
    /// Producer index including unsubmitted reservations
    cached_prod: u32,
    /// Consumer index including unreleased peeks
    cached_cons: u32,
}

impl<T> SoftRing<T> {
    /// Create a ring with `size` slots.
    ///
    /// # Panics
    ///
    /// If `size` is not a power of two.
    pub fn new(size: u32) -> Self {
        assert!(size.is_power_of_two(), "Ring size must be power of 2");

        Self {
            size,
            slots: (0..size).map(|_| None).collect(),
            producer: 0,
            consumer: 0,
            cached_prod: 0,
            cached_cons: 0,
        }
    }

    /// Number of slots.
    pub fn size(&self) -> u32 {
        self.size
    }

    /// Slots free for production.
    pub fn available(&self) -> u32 {
        self.size - self.cached_prod.wrapping_sub(self.consumer)
    }

    /// Submitted entries not yet peeked.
    pub fn ready(&self) -> u32 {
        self.producer.wrapping_sub(self.cached_cons)
    }

    /// Whether nothing is waiting for the consumer.
    pub fn is_empty(&self) -> bool {
        self.ready() == 0
    }

    /// Reserve `count` slots, returning the first index.
    pub fn reserve(&mut self, count: u32) -> Option<u32> {
        if self.available() < count {
            return None;
        }

        let idx = self.cached_prod;
        self.cached_prod = self.cached_prod.wrapping_add(count);
        Some(idx)
    }

    /// Fill a reserved slot.
    pub fn write(&mut self, idx: u32, value: T) {
        let slot = (idx & (self.size - 1)) as usize;
        self.slots[slot] = Some(value);
    }

    /// Publish `count` reserved slots to the consumer.
    pub fn submit(&mut self, count: u32) {
        self.producer = self.producer.wrapping_add(count);
    }

    /// Claim `count` ready entries, returning the first index.
    pub fn peek(&mut self, count: u32) -> Option<u32> {
        if self.ready() < count {
            return None;
        }

        let idx = self.cached_cons;
        self.cached_cons = self.cached_cons.wrapping_add(count);
        Some(idx)
    }

    /// Move a peeked entry out of its slot.
    pub fn take(&mut self, idx: u32) -> Option<T> {
        let slot = (idx & (self.size - 1)) as usize;
        self.slots[slot].take()
    }

    /// Hand `count` consumed slots back to the producer.
    pub fn release(&mut self, count: u32) {
        self.consumer = self.consumer.wrapping_add(count);
    }

    /// Reserve, write and submit one entry. Gives the value back when full.
    pub fn push(&mut self, value: T) -> Result<(), T> {
        match self.reserve(1) {
            Some(idx) => {
                self.write(idx, value);
                self.submit(1);
                Ok(())
            }
            None => Err(value),
        }
    }

    /// Peek, take and release one entry.
    pub fn pop(&mut self) -> Option<T> {
        let idx = self.peek(1)?;
        let value = self.take(idx);
        self.release(1);
        value
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_ring_creation() {
        let ring: SoftRing<u32> = SoftRing::new(8);
        assert_eq!(ring.size(), 8);
        assert_eq!(ring.available(), 8);
        assert_eq!(ring.ready(), 0);
    }

    #[test]
    #[should_panic(expected = "power of 2")]
    fn test_ring_rejects_odd_size() {
        let _ring: SoftRing<u32> = SoftRing::new(6);
    }

    #[test]
    fn test_reserve_submit_peek_release() {
        let mut ring = SoftRing::new(4);
        let idx = ring.reserve(3).unwrap();
        for i in 0..3 {
            ring.write(idx + i, i * 10);
        }
        assert_eq!(ring.ready(), 0, "unsubmitted entries are invisible");
        assert_eq!(ring.available(), 1);
        ring.submit(3);
        assert_eq!(ring.ready(), 3);

        let idx = ring.peek(2).unwrap();
        assert_eq!(ring.take(idx), Some(0));
        assert_eq!(ring.take(idx + 1), Some(10));
        assert_eq!(ring.available(), 1, "slots stay owned until released");
        ring.release(2);
        assert_eq!(ring.available(), 3);
        assert_eq!(ring.pop(), Some(20));
        assert!(ring.is_empty());
    }

    #[test]
    fn test_push_full_returns_value() {
        let mut ring = SoftRing::new(2);
        ring.push('a').unwrap();
        ring.push('b').unwrap();
        assert_eq!(ring.push('c'), Err('c'));
        assert_eq!(ring.pop(), Some('a'));
        ring.push('c').unwrap();
        assert_eq!(ring.pop(), Some('b'));
        assert_eq!(ring.pop(), Some('c'));
        assert_eq!(ring.pop(), None);
    }

    #[test]
    fn test_indices_wrap() {
        let mut ring = SoftRing::new(2);
        ring.producer = u32::MAX;
        ring.consumer = u32::MAX;
        ring.cached_prod = u32::MAX;
        ring.cached_cons = u32::MAX;
        for i in 0..10u8 {
            ring.push(i).unwrap();
            assert_eq!(ring.pop(), Some(i));
        }
    }

    proptest! {
        #[test]
        fn prop_ring_is_fifo(values in proptest::collection::vec(any::<u16>(), 0..64)) {
            let mut ring = SoftRing::new(16);
            let mut expected = std::collections::VecDeque::new();
            for value in values {
                if ring.push(value).is_ok() {
                    expected.push_back(value);
                } else {
                    prop_assert_eq!(ring.pop(), expected.pop_front());
                }
            }
            while let Some(value) = ring.pop() {
                prop_assert_eq!(Some(value), expected.pop_front());
            }
            prop_assert!(expected.is_empty());
        }
    }
}
