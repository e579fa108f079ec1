//! Cross-thread hand-off of events into a single-threaded owner.
//!
//! An [`AsyncCallback`] is the only channel through which peers and hub logic
//! talk to each other. Any thread may [`invoke`](AsyncCallback::invoke) it;
//! exactly one owner drains it, either by polling from a task or by calling
//! [`drain`](AsyncCallback::drain) directly.
//!
//! # Design
//! - Unbounded lock-free FIFO (`crossbeam` `SegQueue`), so `invoke` never blocks
//! - One "needs wakeup" bit: set only while the owner is idle, cleared by the
//!   first `invoke` that observes it, so an idle owner is woken exactly once
//! - After arming the bit the owner polls the queue one more time. An event
//!   enqueued after the owner saw an empty queue but before the bit was armed
//!   is picked up by that second poll instead of waiting for the next wakeup.

use std::future::poll_fn;
use std::sync::atomic::{fence, AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use crossbeam::queue::SegQueue;
use futures_util::task::AtomicWaker;

/// Thread-safe, order-preserving callback into a single-threaded owner.
pub struct AsyncCallback<E> {
    inner: Arc<Inner<E>>,
}

struct Inner<E> {
    queue: SegQueue<E>,
    needs_wakeup: AtomicBool,
    waker: AtomicWaker,
}

impl<E> AsyncCallback<E> {
    /// Creates an empty callback with no owner waiting.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                queue: SegQueue::new(),
                needs_wakeup: AtomicBool::new(false),
                waker: AtomicWaker::new(),
            }),
        }
    }

    /// Enqueues an event. Callable from any thread; never blocks.
    pub fn invoke(&self, event: E) {
        self.inner.queue.push(event);
        // Pairs with the fence in `arm`: either the owner sees the event on its
        // second poll or we see the armed bit.
        fence(Ordering::SeqCst);
        if self.inner.needs_wakeup.swap(false, Ordering::AcqRel) {
            self.inner.waker.wake();
        }
    }

    /// Pops one event without arming the wakeup bit.
    pub fn try_recv(&self) -> Option<E> {
        self.inner.queue.pop()
    }

    /// Pops one event, or registers the task to be woken by the next `invoke`.
    pub fn poll_recv(&self, cx: &mut Context<'_>) -> Poll<E> {
        if let Some(event) = self.inner.queue.pop() {
            return Poll::Ready(event);
        }
        self.inner.waker.register(cx.waker());
        self.arm();
        match self.inner.queue.pop() {
            Some(event) => {
                self.disarm();
                Poll::Ready(event)
            }
            None => Poll::Pending,
        }
    }

    /// Waits for the next event.
    pub async fn recv(&self) -> E {
        poll_fn(|cx| self.poll_recv(cx)).await
    }

    /// Processes events until the queue is empty, returning how many were handled.
    ///
    /// The wakeup bit is left armed, so the next `invoke` wakes whichever task
    /// last registered through [`poll_recv`](Self::poll_recv).
    pub fn drain<F: FnMut(E)>(&self, mut handler: F) -> usize {
        let mut drained = 0;
        loop {
            while let Some(event) = self.inner.queue.pop() {
                handler(event);
                drained += 1;
            }
            self.arm();
            match self.inner.queue.pop() {
                Some(event) => {
                    self.disarm();
                    handler(event);
                    drained += 1;
                }
                None => return drained,
            }
        }
    }

    /// Number of queued events. Only a snapshot.
    pub fn len(&self) -> usize {
        self.inner.queue.len()
    }

    /// Returns true when nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.inner.queue.is_empty()
    }

    fn arm(&self) {
        self.inner.needs_wakeup.store(true, Ordering::SeqCst);
        fence(Ordering::SeqCst);
    }

    fn disarm(&self) {
        self.inner.needs_wakeup.store(false, Ordering::Release);
    }
}

impl<E> Clone for AsyncCallback<E> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

impl<E> Default for AsyncCallback<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> std::fmt::Debug for AsyncCallback<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncCallback")
            .field("queued", &self.inner.queue.len())
            .field("needs_wakeup", &self.inner.needs_wakeup.load(Ordering::Relaxed))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;
    use std::sync::atomic::AtomicU64;
    use std::thread;
    use std::time::Duration;
    use tokio_test::{assert_pending, assert_ready_eq, task};

    #[test]
    fn test_fifo_per_caller() {
        let callback = AsyncCallback::new();
        for i in 0..10 {
            callback.invoke(i);
        }

        let mut seen = Vec::new();
        assert_eq!(callback.drain(|e| seen.push(e)), 10);
        assert_eq!(seen, (0..10).collect::<Vec<_>>());
        assert!(callback.is_empty());
    }

    #[test]
    fn test_idle_owner_is_woken_once() {
        let callback = AsyncCallback::<u32>::new();
        let mut recv = task::spawn(callback.recv());

        assert_pending!(recv.poll());
        assert!(!recv.is_woken());

        callback.invoke(7);
        assert!(recv.is_woken());
        // The bit was consumed by the first invoke; the second one does not wake again.
        assert!(!callback.inner.needs_wakeup.load(Ordering::SeqCst));

        callback.invoke(8);
        assert_ready_eq!(recv.poll(), 7);
        assert_eq!(callback.try_recv(), Some(8));
    }

    #[test]
    fn test_busy_owner_is_not_woken() {
        let callback = AsyncCallback::<u32>::new();
        callback.invoke(1);

        let mut recv = task::spawn(callback.recv());
        assert_ready_eq!(recv.poll(), 1);

        // Never armed, so nothing to wake.
        callback.invoke(2);
        assert!(!callback.inner.needs_wakeup.load(Ordering::SeqCst));
        assert_eq!(callback.len(), 1);
    }

    #[test]
    fn test_drain_leaves_wakeup_armed() {
        let callback = AsyncCallback::<u32>::new();
        let mut recv = task::spawn(callback.recv());
        assert_pending!(recv.poll());

        assert_eq!(callback.drain(|_| {}), 0);
        callback.invoke(3);
        assert!(recv.is_woken());
        assert_ready_eq!(recv.poll(), 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_no_lost_wakeup_under_concurrent_producers() {
        const PRODUCERS: u64 = 8;
        const PER_PRODUCER: u64 = 5_000;

        let callback = AsyncCallback::<u64>::new();
        let enqueued_sum = Arc::new(AtomicU64::new(0));

        let handles: Vec<_> = (0..PRODUCERS)
            .map(|_| {
                let callback = callback.clone();
                let enqueued_sum = enqueued_sum.clone();
                tokio::task::spawn_blocking(move || {
                    let mut rng = rand::thread_rng();
                    for _ in 0..PER_PRODUCER {
                        let payload = rng.gen_range(1..1_000u64);
                        enqueued_sum.fetch_add(payload, Ordering::Relaxed);
                        callback.invoke(payload);
                        if rng.gen_bool(0.01) {
                            thread::yield_now();
                        }
                    }
                })
            })
            .collect();

        let consumer = {
            let callback = callback.clone();
            tokio::spawn(async move {
                let mut count = 0u64;
                let mut sum = 0u64;
                while count < PRODUCERS * PER_PRODUCER {
                    // Every await must be satisfied promptly; a stranded event would stall here.
                    let event = tokio::time::timeout(Duration::from_secs(5), callback.recv())
                        .await
                        .expect("event stranded in queue");
                    count += 1;
                    sum += event;
                }
                (count, sum)
            })
        };

        for handle in handles {
            handle.await.unwrap();
        }
        let (count, sum) = consumer.await.unwrap();

        assert_eq!(count, PRODUCERS * PER_PRODUCER);
        assert_eq!(sum, enqueued_sum.load(Ordering::Relaxed));
        assert!(callback.is_empty());
    }
}
