//! Shared ring buffer behind a broadcast hub.
//!
//! Positions are monotonic `u64` offsets; a slot is `offset & mask`. Only the
//! hub logic writes. Consumers read concurrently at their own offsets.
//!
//! Publication order: the slot is written before `tail` is advanced with
//! `Release`, and readers load `tail` with `Acquire` before touching a slot,
//! so `offset < tail` guarantees the slot holds the element for `offset`.
//! A slot is only cleared after every consumer has moved past it.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;

/// Content of one ring slot.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Slot<T> {
    Element(T),
    /// Upstream completed; written once, at the final tail position.
    Completed,
}

pub(crate) struct RingBuffer<T> {
    slots: Box<[RwLock<Option<Slot<T>>>]>,
    mask: u64,
    head: AtomicU64,
    tail: AtomicU64,
}

impl<T: Clone> RingBuffer<T> {
    /// `capacity` must be a power of two.
    pub(crate) fn new(capacity: usize) -> Self {
        debug_assert!(capacity.is_power_of_two());
        let slots = (0..capacity).map(|_| RwLock::new(None)).collect::<Vec<_>>().into_boxed_slice();
        Self { slots, mask: capacity as u64 - 1, head: AtomicU64::new(0), tail: AtomicU64::new(0) }
    }

    pub(crate) fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Oldest retained offset.
    pub(crate) fn head(&self) -> u64 {
        self.head.load(Ordering::Acquire)
    }

    /// Next write offset.
    pub(crate) fn tail(&self) -> u64 {
        self.tail.load(Ordering::Acquire)
    }

    /// Retained elements (`tail - head`).
    ///
    /// Safe from any thread: `head` is loaded first, and both offsets only
    /// grow, so the later `tail` is never behind it.
    pub(crate) fn len(&self) -> usize {
        let head = self.head();
        let tail = self.tail();
        tail.saturating_sub(head) as usize
    }

    pub(crate) fn is_full(&self) -> bool {
        self.len() >= self.capacity()
    }

    /// Writes at `tail` and publishes it. Hub logic only.
    pub(crate) fn publish(&self, slot: Slot<T>) -> u64 {
        let tail = self.tail.load(Ordering::Relaxed);
        debug_assert!(!self.is_full());
        *self.slots[(tail & self.mask) as usize].write() = Some(slot);
        self.tail.store(tail + 1, Ordering::Release);
        tail
    }

    /// Clears the slot at `head` and advances it. Hub logic only.
    pub(crate) fn discard_head(&self) {
        let head = self.head.load(Ordering::Relaxed);
        debug_assert!(head < self.tail.load(Ordering::Relaxed));
        *self.slots[(head & self.mask) as usize].write() = None;
        self.head.store(head + 1, Ordering::Release);
    }

    /// Reads the slot at `offset`; `None` when `offset == tail` (nothing yet).
    pub(crate) fn poll(&self, offset: u64) -> Option<Slot<T>> {
        if offset >= self.tail() {
            return None;
        }
        self.slots[(offset & self.mask) as usize].read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_poll_at_tail_is_empty() {
        let buffer = RingBuffer::<u32>::new(4);
        assert_eq!(buffer.poll(0), None);

        buffer.publish(Slot::Element(7));
        assert_eq!(buffer.poll(0), Some(Slot::Element(7)));
        assert_eq!(buffer.poll(1), None);
    }

    #[test]
    fn test_wraps_after_discard() {
        let buffer = RingBuffer::<u32>::new(2);
        buffer.publish(Slot::Element(1));
        buffer.publish(Slot::Element(2));
        assert!(buffer.is_full());

        buffer.discard_head();
        assert_eq!(buffer.len(), 1);
        buffer.publish(Slot::Completed);

        assert_eq!(buffer.poll(1), Some(Slot::Element(2)));
        assert_eq!(buffer.poll(2), Some(Slot::Completed));
        assert_eq!((buffer.head(), buffer.tail()), (1, 3));
    }

    #[test]
    fn test_len_stays_within_capacity_while_advancing() {
        let buffer = RingBuffer::<u64>::new(1);
        std::thread::scope(|scope| {
            scope.spawn(|| {
                for value in 0..100_000 {
                    buffer.publish(Slot::Element(value));
                    buffer.discard_head();
                }
            });
            scope.spawn(|| {
                for _ in 0..100_000 {
                    assert!(buffer.len() <= buffer.capacity());
                }
            });
        });
        assert_eq!(buffer.len(), 0);
    }
}
