//! Per-consumer queues of a partition hub.
//!
//! The hub logic offers into a consumer's queue; only that consumer polls it.
//! `total` counts buffered elements across every queue (completion markers are
//! not counted) and is what bounds upstream pulling.

use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam::queue::SegQueue;
use dashmap::DashMap;

use crate::hub_state::PeerId;

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum QueueItem<T> {
    Element(T),
    /// Upstream completed; always the last item of a queue.
    Completed,
}

pub(crate) struct PartitionQueue<T> {
    queues: DashMap<PeerId, SegQueue<QueueItem<T>>>,
    total: AtomicUsize,
}

impl<T> PartitionQueue<T> {
    pub(crate) fn new() -> Self {
        Self { queues: DashMap::new(), total: AtomicUsize::new(0) }
    }

    pub(crate) fn init(&self, id: PeerId) {
        self.queues.insert(id, SegQueue::new());
    }

    /// Drops the queue of `id` together with whatever it still holds.
    pub(crate) fn remove(&self, id: PeerId) {
        if let Some((_, queue)) = self.queues.remove(&id) {
            while let Some(item) = queue.pop() {
                if matches!(item, QueueItem::Element(_)) {
                    self.total.fetch_sub(1, Ordering::AcqRel);
                }
            }
        }
    }

    /// Returns false if `id` has no queue.
    pub(crate) fn offer(&self, id: PeerId, element: T) -> bool {
        match self.queues.get(&id) {
            Some(queue) => {
                // Count first so a racing poll never underflows.
                self.total.fetch_add(1, Ordering::AcqRel);
                queue.push(QueueItem::Element(element));
                true
            }
            None => false,
        }
    }

    pub(crate) fn offer_completion(&self, id: PeerId) {
        if let Some(queue) = self.queues.get(&id) {
            queue.push(QueueItem::Completed);
        }
    }

    /// Pops the next item of `id`, with the total size observed before the pop.
    pub(crate) fn poll(&self, id: PeerId) -> Option<(QueueItem<T>, usize)> {
        let queue = self.queues.get(&id)?;
        let item = queue.pop()?;
        let previous_total = match item {
            QueueItem::Element(_) => self.total.fetch_sub(1, Ordering::AcqRel),
            QueueItem::Completed => self.total.load(Ordering::Acquire),
        };
        Some((item, previous_total))
    }

    pub(crate) fn queue_size(&self, id: PeerId) -> usize {
        self.queues.get(&id).map(|queue| queue.len()).unwrap_or(0)
    }

    pub(crate) fn is_empty(&self, id: PeerId) -> bool {
        self.queue_size(id) == 0
    }

    /// Buffered elements across every queue.
    pub(crate) fn size(&self) -> usize {
        self.total.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queues_are_independent() {
        let queue = PartitionQueue::new();
        queue.init(1);
        queue.init(2);

        assert!(queue.offer(1, "a"));
        assert!(queue.offer(2, "b"));
        assert!(queue.offer(1, "c"));
        assert!(!queue.offer(3, "lost"));
        assert_eq!(queue.size(), 3);

        assert_eq!(queue.poll(1), Some((QueueItem::Element("a"), 3)));
        assert_eq!(queue.poll(1), Some((QueueItem::Element("c"), 2)));
        assert_eq!(queue.poll(1), None);
        assert_eq!(queue.queue_size(2), 1);
        assert_eq!(queue.size(), 1);
    }

    #[test]
    fn test_remove_releases_capacity() {
        let queue = PartitionQueue::new();
        queue.init(7);
        queue.offer(7, 1);
        queue.offer(7, 2);
        queue.offer_completion(7);
        assert_eq!(queue.size(), 2);

        queue.remove(7);
        assert_eq!(queue.size(), 0);
        assert!(queue.is_empty(7));
    }

    #[test]
    fn test_completion_is_not_counted() {
        let queue = PartitionQueue::<u32>::new();
        queue.init(0);
        queue.offer_completion(0);
        assert_eq!(queue.size(), 0);
        assert_eq!(queue.poll(0), Some((QueueItem::Completed, 0)));
    }
}
