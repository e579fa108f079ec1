//! Bucket queue of broadcast consumers keyed by read offset.
//!
//! The wheel has `2 * buffer_size` buckets. Live consumers always sit between
//! `head` and `tail`, which are at most `buffer_size` apart, so two distinct
//! offsets never share a bucket. A consumer only moves when it crosses a
//! demand threshold, parks at the tail, or leaves.

use crate::callback::AsyncCallback;
use crate::events::ConsumerEvent;
use crate::hub_state::PeerId;

#[derive(Debug, Clone)]
pub(crate) struct WheelConsumer {
    pub(crate) id: PeerId,
    pub(crate) callback: AsyncCallback<ConsumerEvent>,
}

pub(crate) struct ConsumerWheel {
    buckets: Box<[Vec<WheelConsumer>]>,
    mask: u64,
}

impl ConsumerWheel {
    pub(crate) fn new(buffer_size: usize) -> Self {
        let size = buffer_size * 2;
        let buckets = (0..size).map(|_| Vec::new()).collect::<Vec<_>>().into_boxed_slice();
        Self { buckets, mask: size as u64 - 1 }
    }

    pub(crate) fn add(&mut self, consumer: WheelConsumer, offset: u64) {
        self.buckets[self.slot(offset)].push(consumer);
    }

    pub(crate) fn remove(&mut self, id: PeerId, offset: u64) -> Option<WheelConsumer> {
        let bucket = &mut self.buckets[(offset & self.mask) as usize];
        let position = bucket.iter().position(|c| c.id == id)?;
        Some(bucket.swap_remove(position))
    }

    /// Slow path for a consumer that left before learning its start offset.
    pub(crate) fn remove_anywhere(&mut self, id: PeerId) -> Option<WheelConsumer> {
        self.buckets.iter_mut().find_map(|bucket| {
            let position = bucket.iter().position(|c| c.id == id)?;
            Some(bucket.swap_remove(position))
        })
    }

    pub(crate) fn is_empty_at(&self, offset: u64) -> bool {
        self.buckets[self.slot(offset)].is_empty()
    }

    pub(crate) fn at(&self, offset: u64) -> &[WheelConsumer] {
        &self.buckets[self.slot(offset)]
    }

    pub(crate) fn drain_all(&mut self) -> Vec<WheelConsumer> {
        self.buckets.iter_mut().flat_map(std::mem::take).collect()
    }

    fn slot(&self, offset: u64) -> usize {
        (offset & self.mask) as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn consumer(id: PeerId) -> WheelConsumer {
        WheelConsumer { id, callback: AsyncCallback::new() }
    }

    #[test]
    fn test_move_between_buckets() {
        let mut wheel = ConsumerWheel::new(4);
        wheel.add(consumer(1), 0);
        wheel.add(consumer(2), 0);

        let moved = wheel.remove(1, 0).unwrap();
        wheel.add(moved, 2);

        assert_eq!(wheel.at(0).len(), 1);
        assert!(!wheel.is_empty_at(2));
        assert!(wheel.remove(1, 0).is_none());
    }

    #[test]
    fn test_offsets_wrap_modulo_wheel() {
        let mut wheel = ConsumerWheel::new(2);
        wheel.add(consumer(9), 5);
        // Wheel size 4: offset 5 and 1 share bucket 1.
        assert!(!wheel.is_empty_at(1));
        assert_eq!(wheel.remove_anywhere(9).map(|c| c.id), Some(9));
        assert_eq!(wheel.drain_all().len(), 0);
    }
}
