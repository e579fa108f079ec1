//! Broadcast hub: one upstream, many dynamically attached consumers.
//!
//! Every element is delivered to every consumer that is attached when it is
//! produced, in upstream order. The hub moves at the pace of the slowest
//! consumer: the upstream is only pulled while the shared ring has room.
//!
//! # Design
//! - The hub logic runs as its own tokio task and is the only writer of the
//!   [`RingBuffer`]. Consumers read the ring directly at their own offsets.
//! - Consumers report progress only once per demand threshold (half the
//!   buffer). The logic keeps them in a [`ConsumerWheel`] keyed by the last
//!   reported offset and frees the head of the ring once its bucket is empty.
//! - A consumer that runs out of data parks itself with `NeedWakeup`; the
//!   logic wakes the bucket at the offset it publishes next.
//! - Upstream completion is written into the ring as a marker so consumers
//!   finish after the elements already in front of them. Upstream failure
//!   skips the buffer and fails every consumer immediately.
//!
//! ## Example
//!
//! ```rust,ignore
//! let hub = BroadcastHub::<u64>::with_start_after(2, 256)?;
//! let consumers = hub.attach(futures_util::stream::iter(0..1000));
//!
//! let mut left = consumers.consumer();
//! let mut right = consumers.consumer();
//! while let Some(value) = left.next().await {
//!     println!("left saw {}", value?);
//! }
//! ```

use std::convert::Infallible;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures_util::stream::{Stream, StreamExt};
use tracing::{debug, warn};

use crate::callback::AsyncCallback;
use crate::config::{demand_threshold, validate_broadcast_buffer_size, HubConfig};
use crate::consumer_wheel::{ConsumerWheel, WheelConsumer};
use crate::error::HubError;
use crate::events::{BroadcastEvent, ConsumerEvent};
use crate::hub_state::{HubState, PeerId, PeerRegistration};
use crate::ring_buffer::{RingBuffer, Slot};

/// Builder for broadcast-hub materializations.
#[derive(Debug, Clone)]
pub struct BroadcastHub<T> {
    buffer_size: usize,
    start_after_nr_of_consumers: usize,
    _marker: PhantomData<fn() -> T>,
}

impl<T> BroadcastHub<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Hub that starts pulling upstream immediately.
    ///
    /// `buffer_size` must be a power of two in `1..=4095`.
    pub fn new(buffer_size: usize) -> Result<Self, HubError> {
        Self::with_start_after(0, buffer_size)
    }

    /// Hub that does not pull upstream until `start_after_nr_of_consumers`
    /// consumers have attached. Once started it never pauses for that reason
    /// again.
    pub fn with_start_after(start_after_nr_of_consumers: usize, buffer_size: usize) -> Result<Self, HubError> {
        validate_broadcast_buffer_size(buffer_size)?;
        Ok(Self { buffer_size, start_after_nr_of_consumers, _marker: PhantomData })
    }

    /// Builds a hub from the broadcast section of a [`HubConfig`].
    pub fn from_config(config: &HubConfig) -> Result<Self, HubError> {
        Self::with_start_after(config.broadcast_start_after_nr_of_consumers, config.broadcast_buffer_size)
    }

    /// Spawns the hub logic over an infallible upstream.
    ///
    /// Must be called from within a tokio runtime.
    pub fn attach<S>(&self, upstream: S) -> BroadcastConsumerFactory<T>
    where
        S: Stream<Item = T> + Send + 'static,
    {
        self.attach_fallible(upstream.map(Ok::<T, Infallible>))
    }

    /// Spawns the hub logic over an upstream that may fail.
    ///
    /// An `Err` item fails the hub; every consumer then ends with
    /// [`HubError::UpstreamFailed`].
    pub fn attach_fallible<S, E>(&self, upstream: S) -> BroadcastConsumerFactory<T>
    where
        S: Stream<Item = Result<T, E>> + Send + 'static,
        E: Into<anyhow::Error> + Send + 'static,
    {
        let shared = Arc::new(BroadcastShared {
            buffer: RingBuffer::new(self.buffer_size),
            state: HubState::new(),
            callback: AsyncCallback::new(),
            threshold: demand_threshold(self.buffer_size),
        });
        let logic = BroadcastLogic::new(shared.clone(), self.buffer_size, self.start_after_nr_of_consumers);
        debug!(
            "Materialized broadcast hub (buffer {}, start after {} consumers)",
            self.buffer_size, self.start_after_nr_of_consumers
        );
        tokio::spawn(logic.run(upstream));
        BroadcastConsumerFactory { shared }
    }
}

struct BroadcastShared<T> {
    buffer: RingBuffer<T>,
    state: HubState<AsyncCallback<ConsumerEvent>>,
    callback: AsyncCallback<BroadcastEvent>,
    threshold: usize,
}

/// Hub-side state. Owned by the spawned task; never shared.
struct BroadcastLogic<T> {
    shared: Arc<BroadcastShared<T>>,
    wheel: ConsumerWheel,
    active_consumers: usize,
    start_after: usize,
    started: bool,
    upstream_finished: bool,
    completion_published: bool,
    stopped: bool,
}

impl<T> BroadcastLogic<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn new(shared: Arc<BroadcastShared<T>>, buffer_size: usize, start_after: usize) -> Self {
        Self {
            shared,
            wheel: ConsumerWheel::new(buffer_size),
            active_consumers: 0,
            start_after,
            started: start_after == 0,
            upstream_finished: false,
            completion_published: false,
            stopped: false,
        }
    }

    async fn run<S, E>(mut self, upstream: S)
    where
        S: Stream<Item = Result<T, E>>,
        E: Into<anyhow::Error>,
    {
        let mut upstream = std::pin::pin!(upstream);
        let callback = self.shared.callback.clone();

        while !self.stopped {
            tokio::select! {
                biased;

                event = callback.recv() => {
                    self.on_event(event);
                    while !self.stopped {
                        match callback.try_recv() {
                            Some(event) => self.on_event(event),
                            None => break,
                        }
                    }
                }
                item = upstream.next(), if self.wants_upstream() => match item {
                    Some(Ok(element)) => self.publish(Slot::Element(element)),
                    Some(Err(error)) => self.stop(Some(HubError::upstream(error))),
                    None => self.on_upstream_finish(),
                },
            }
        }
    }

    fn wants_upstream(&self) -> bool {
        self.started && !self.upstream_finished && !self.stopped && !self.shared.buffer.is_full()
    }

    fn publish(&mut self, slot: Slot<T>) {
        let offset = self.shared.buffer.publish(slot);
        // Consumers parked at the old tail are waiting for exactly this slot.
        for consumer in self.wheel.at(offset) {
            consumer.callback.invoke(ConsumerEvent::Wakeup);
        }
    }

    fn on_event(&mut self, event: BroadcastEvent) {
        match event {
            BroadcastEvent::RegistrationPending => self.register_pending(),
            BroadcastEvent::Advance { id, previous_offset } => {
                let new_offset = previous_offset + self.shared.threshold as u64;
                if let Some(consumer) = self.wheel.remove(id, previous_offset) {
                    self.wheel.add(consumer, new_offset);
                }
                self.check_unblock(previous_offset);
            }
            BroadcastEvent::NeedWakeup { id, previous_offset, current_offset } => {
                if let Some(consumer) = self.wheel.remove(id, previous_offset) {
                    // Something was published between the consumer's read and this event.
                    if current_offset != self.shared.buffer.tail() {
                        consumer.callback.invoke(ConsumerEvent::Wakeup);
                    }
                    self.wheel.add(consumer, current_offset);
                }
                self.check_unblock(previous_offset);
            }
            BroadcastEvent::Unregister { id, previous_offset, final_offset } => {
                let (removed, offset) = match previous_offset {
                    Some(offset) => (self.wheel.remove(id, offset), offset),
                    None => (self.wheel.remove_anywhere(id), self.shared.buffer.head()),
                };
                if removed.is_some() {
                    self.active_consumers -= 1;
                    debug!("Consumer {} left broadcast hub, {} remaining", id, self.active_consumers);
                }
                if self.active_consumers == 0 {
                    if self.completion_published {
                        self.stop(None);
                        return;
                    }
                    if let Some(final_offset) = final_offset {
                        self.roll_forward(final_offset);
                    }
                    self.try_publish_completion();
                } else {
                    self.check_unblock(offset);
                }
            }
        }
    }

    fn register_pending(&mut self) {
        for registration in self.shared.state.take_pending() {
            let offset = self.shared.buffer.head();
            registration.callback.invoke(ConsumerEvent::Initialize { offset });
            self.wheel.add(WheelConsumer { id: registration.id, callback: registration.callback }, offset);
            self.active_consumers += 1;
            debug!("Consumer {} registered with broadcast hub at offset {}", registration.id, offset);
        }
        if !self.started && self.active_consumers >= self.start_after {
            debug!("Broadcast hub started with {} consumers", self.active_consumers);
            self.started = true;
        }
    }

    /// Frees ring slots once the bucket at `head` is empty.
    fn check_unblock(&mut self, offset: u64) {
        let buffer = &self.shared.buffer;
        if offset == buffer.head() {
            while buffer.head() != buffer.tail() && self.wheel.is_empty_at(buffer.head()) {
                buffer.discard_head();
            }
        }
        self.try_publish_completion();
    }

    /// Drops what the last consumer already read, keeping everything it had
    /// not reached for whoever attaches next.
    fn roll_forward(&mut self, final_offset: u64) {
        let buffer = &self.shared.buffer;
        while buffer.head() < final_offset.min(buffer.tail()) {
            buffer.discard_head();
        }
    }

    fn on_upstream_finish(&mut self) {
        debug!("Broadcast hub upstream completed");
        self.upstream_finished = true;
        self.try_publish_completion();
    }

    fn try_publish_completion(&mut self) {
        if !self.upstream_finished || self.completion_published || self.shared.buffer.is_full() {
            return;
        }
        self.publish(Slot::Completed);
        self.completion_published = true;
        if self.active_consumers == 0 {
            self.stop(None);
        }
    }
}

impl<T> BroadcastLogic<T> {
    fn stop(&mut self, cause: Option<HubError>) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        match &cause {
            Some(error) => warn!("Broadcast hub failed: {}", error),
            None => debug!("Broadcast hub completed"),
        }
        if let Some(pending) = self.shared.state.close(cause.clone()) {
            for registration in pending {
                registration.callback.invoke(ConsumerEvent::HubCompleted(cause.clone()));
            }
        }
        for consumer in self.wheel.drain_all() {
            consumer.callback.invoke(ConsumerEvent::HubCompleted(cause.clone()));
        }
    }
}

impl<T> Drop for BroadcastLogic<T> {
    fn drop(&mut self) {
        // Task aborted or runtime shut down.
        self.stop(Some(HubError::HubClosed));
    }
}

/// Materialized value of a broadcast hub: attaches new consumers.
pub struct BroadcastConsumerFactory<T> {
    shared: Arc<BroadcastShared<T>>,
}

impl<T: Clone> BroadcastConsumerFactory<T> {
    /// Attaches a new consumer. It sees elements produced from its start
    /// offset (the ring head when the hub picks it up) onwards.
    pub fn consumer(&self) -> BroadcastHubSource<T> {
        BroadcastHubSource::attach(self.shared.clone())
    }

    /// Elements currently retained in the ring.
    pub fn buffered_len(&self) -> usize {
        self.shared.buffer.len()
    }

    /// True once the hub completed or failed.
    pub fn is_closed(&self) -> bool {
        self.shared.state.is_closed()
    }
}

impl<T> Clone for BroadcastConsumerFactory<T> {
    fn clone(&self) -> Self {
        Self { shared: self.shared.clone() }
    }
}

#[derive(Debug)]
enum Phase {
    AwaitingInit,
    Reading,
    Parked,
    Failed(HubError),
    Done,
}

/// One dynamically attached broadcast consumer.
///
/// Yields `Ok` elements in upstream order, then ends; or yields a single
/// `Err` when the hub fails. Dropping it detaches from the hub.
pub struct BroadcastHubSource<T> {
    id: PeerId,
    shared: Arc<BroadcastShared<T>>,
    callback: AsyncCallback<ConsumerEvent>,
    phase: Phase,
    offset: u64,
    previous_published_offset: u64,
    until_next_advance: usize,
    initialized: bool,
    detached: bool,
}

impl<T> BroadcastHubSource<T> {
    fn attach(shared: Arc<BroadcastShared<T>>) -> Self {
        let id = shared.state.next_peer_id();
        let callback = AsyncCallback::new();
        let (phase, detached) = match shared.state.register(PeerRegistration::new(id, callback.clone())) {
            Ok(()) => {
                shared.callback.invoke(BroadcastEvent::RegistrationPending);
                (Phase::AwaitingInit, false)
            }
            Err(cause) => {
                debug!("Consumer {} attached to closed broadcast hub", id);
                (terminal_phase(cause), true)
            }
        };
        let until_next_advance = shared.threshold;
        Self {
            id,
            shared,
            callback,
            phase,
            offset: 0,
            previous_published_offset: 0,
            until_next_advance,
            initialized: false,
            detached,
        }
    }

    /// Peer id of this consumer.
    pub fn id(&self) -> PeerId {
        self.id
    }

    fn on_event(&mut self, event: ConsumerEvent) {
        match event {
            ConsumerEvent::Initialize { offset } => {
                if matches!(self.phase, Phase::AwaitingInit) {
                    self.offset = offset;
                    self.previous_published_offset = offset;
                    self.initialized = true;
                    self.phase = Phase::Reading;
                }
            }
            ConsumerEvent::Wakeup => {
                if matches!(self.phase, Phase::Parked) {
                    self.phase = Phase::Reading;
                }
            }
            ConsumerEvent::HubCompleted(cause) => {
                self.detached = true;
                if !matches!(self.phase, Phase::Done) {
                    self.phase = terminal_phase(cause);
                }
            }
        }
    }

    fn finish(&mut self) {
        self.phase = Phase::Done;
        self.detach();
    }

    fn detach(&mut self) {
        if self.detached {
            return;
        }
        self.detached = true;
        while let Some(event) = self.callback.try_recv() {
            if let ConsumerEvent::Initialize { offset } = event {
                self.offset = offset;
                self.previous_published_offset = offset;
                self.initialized = true;
            }
        }
        if self.initialized {
            self.shared.callback.invoke(BroadcastEvent::Unregister {
                id: self.id,
                previous_offset: Some(self.previous_published_offset),
                final_offset: Some(self.offset),
            });
        } else if !self.shared.state.remove_pending(self.id) {
            // Already picked up, but Initialize has not arrived; the hub finds us by id.
            self.shared.callback.invoke(BroadcastEvent::Unregister {
                id: self.id,
                previous_offset: None,
                final_offset: None,
            });
        }
    }
}

fn terminal_phase(cause: Option<HubError>) -> Phase {
    match cause {
        Some(error) => Phase::Failed(error),
        None => Phase::Done,
    }
}

impl<T: Clone> Stream for BroadcastHubSource<T> {
    type Item = Result<T, HubError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        while let Some(event) = this.callback.try_recv() {
            this.on_event(event);
        }
        loop {
            match this.phase {
                Phase::Done => return Poll::Ready(None),
                Phase::Failed(_) => {
                    if let Phase::Failed(error) = std::mem::replace(&mut this.phase, Phase::Done) {
                        return Poll::Ready(Some(Err(error)));
                    }
                }
                Phase::AwaitingInit | Phase::Parked => match this.callback.poll_recv(cx) {
                    Poll::Ready(event) => this.on_event(event),
                    Poll::Pending => return Poll::Pending,
                },
                Phase::Reading => match this.shared.buffer.poll(this.offset) {
                    Some(Slot::Element(element)) => {
                        this.offset += 1;
                        this.until_next_advance -= 1;
                        if this.until_next_advance == 0 {
                            this.until_next_advance = this.shared.threshold;
                            let previous_offset = this.previous_published_offset;
                            this.previous_published_offset += this.shared.threshold as u64;
                            this.shared.callback.invoke(BroadcastEvent::Advance { id: this.id, previous_offset });
                        }
                        return Poll::Ready(Some(Ok(element)));
                    }
                    Some(Slot::Completed) => {
                        this.finish();
                        return Poll::Ready(None);
                    }
                    None => {
                        this.shared.callback.invoke(BroadcastEvent::NeedWakeup {
                            id: this.id,
                            previous_offset: this.previous_published_offset,
                            current_offset: this.offset,
                        });
                        this.previous_published_offset = this.offset;
                        this.until_next_advance = this.shared.threshold;
                        this.phase = Phase::Parked;
                    }
                },
            }
        }
    }
}

impl<T> Drop for BroadcastHubSource<T> {
    fn drop(&mut self) {
        self.detach();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::time::{sleep, timeout};

    const WAIT: Duration = Duration::from_secs(5);

    async fn next_ok<T: Clone>(source: &mut BroadcastHubSource<T>) -> T {
        timeout(WAIT, source.next()).await.unwrap().unwrap().unwrap()
    }

    #[test]
    fn test_buffer_size_validation() {
        assert!(BroadcastHub::<u32>::new(0).is_err());
        assert!(BroadcastHub::<u32>::new(3).is_err());
        assert!(BroadcastHub::<u32>::new(4095).is_err());
        assert!(BroadcastHub::<u32>::new(4096).is_err());
        assert!(BroadcastHub::<u32>::new(2048).is_ok());
        assert!(BroadcastHub::<u32>::new(1).is_ok());
    }

    #[tokio::test]
    async fn test_slow_consumer_bounds_upstream_pulls() {
        crate::testing::init_tracing();
        let pulled = Arc::new(AtomicUsize::new(0));
        let counter = pulled.clone();
        let upstream = stream::iter(1..=5u32).inspect(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let factory = BroadcastHub::new(4).unwrap().attach(upstream);

        timeout(WAIT, async {
            while pulled.load(Ordering::SeqCst) < 4 {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        sleep(Duration::from_millis(50)).await;
        assert_eq!(pulled.load(Ordering::SeqCst), 4);
        assert_eq!(factory.buffered_len(), 4);

        let mut consumer = factory.consumer();
        assert_eq!(next_ok(&mut consumer).await, 1);
        // One read is below the threshold of 2: the head does not move yet.
        sleep(Duration::from_millis(20)).await;
        assert_eq!(pulled.load(Ordering::SeqCst), 4);

        assert_eq!(next_ok(&mut consumer).await, 2);
        let mut rest = Vec::new();
        while let Some(item) = timeout(WAIT, consumer.next()).await.unwrap() {
            rest.push(item.unwrap());
        }
        assert_eq!(rest, vec![3, 4, 5]);
        assert_eq!(pulled.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn test_every_consumer_sees_identical_sequence() {
        let factory = BroadcastHub::with_start_after(3, 8).unwrap().attach(stream::iter(0..100u32));

        let handles: Vec<_> = (0..3)
            .map(|_| {
                let consumer = factory.consumer();
                tokio::spawn(async move {
                    let items: Vec<u32> = consumer.map(|r| r.unwrap()).collect().await;
                    items
                })
            })
            .collect();

        for handle in handles {
            let items = timeout(WAIT, handle).await.unwrap().unwrap();
            assert_eq!(items, (0..100).collect::<Vec<_>>());
        }

        timeout(WAIT, async {
            while !factory.is_closed() {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        let mut late = factory.consumer();
        assert!(late.next().await.is_none());
    }

    #[tokio::test]
    async fn test_late_consumer_never_sees_discarded_elements() {
        let factory = BroadcastHub::with_start_after(1, 2).unwrap().attach(stream::iter(0u64..));
        let mut early = factory.consumer();
        for expected in 0..10 {
            assert_eq!(next_ok(&mut early).await, expected);
        }

        let mut late = factory.consumer();
        let first = next_ok(&mut late).await;
        assert!(first >= 10, "late consumer saw {first}");
        let second = next_ok(&mut late).await;
        assert_eq!(second, first + 1);
    }

    #[tokio::test]
    async fn test_cancelled_consumer_releases_the_ring() {
        let factory = BroadcastHub::with_start_after(2, 2).unwrap().attach(stream::iter(0u32..));
        let stalled = factory.consumer();
        let mut reader = factory.consumer();

        assert_eq!(next_ok(&mut reader).await, 0);
        assert_eq!(next_ok(&mut reader).await, 1);
        // The stalled consumer pins the ring.
        assert!(timeout(Duration::from_millis(50), reader.next()).await.is_err());
        assert_eq!(factory.buffered_len(), 2);

        drop(stalled);
        for expected in 2..10 {
            assert_eq!(next_ok(&mut reader).await, expected);
        }
    }

    #[tokio::test]
    async fn test_upstream_failure_fails_every_consumer() {
        crate::testing::init_tracing();
        let upstream = stream::iter(vec![Ok(1u32), Ok(2), Err(anyhow::anyhow!("boom"))]);
        let factory = BroadcastHub::with_start_after(2, 8).unwrap().attach_fallible(upstream);
        let consumers = vec![factory.consumer(), factory.consumer()];

        for mut consumer in consumers {
            let mut last = None;
            while let Some(item) = timeout(WAIT, consumer.next()).await.unwrap() {
                last = Some(item);
            }
            assert!(matches!(last, Some(Err(HubError::UpstreamFailed(_)))));
        }

        assert!(factory.is_closed());
        let mut late = factory.consumer();
        assert!(matches!(late.next().await, Some(Err(HubError::UpstreamFailed(_)))));
        assert!(late.next().await.is_none());
    }

    #[tokio::test]
    async fn test_consumer_dropped_before_pickup() {
        let factory = BroadcastHub::with_start_after(1, 4).unwrap().attach(stream::iter(0u32..3));
        drop(factory.consumer());

        let mut consumer = factory.consumer();
        let items: Vec<u32> = timeout(WAIT, (&mut consumer).map(|r| r.unwrap()).collect()).await.unwrap();
        assert_eq!(items, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_attached_consumer_paces_upstream() {
        let pulled = Arc::new(AtomicUsize::new(0));
        let counter = pulled.clone();
        let upstream = stream::iter(1..=5u32).inspect(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let factory = BroadcastHub::with_start_after(1, 4).unwrap().attach(upstream);
        let mut consumer = factory.consumer();

        timeout(WAIT, async {
            while pulled.load(Ordering::SeqCst) < 4 {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        sleep(Duration::from_millis(50)).await;
        assert_eq!(pulled.load(Ordering::SeqCst), 4);
        assert_eq!(factory.buffered_len(), 4);

        assert_eq!(next_ok(&mut consumer).await, 1);
        assert_eq!(next_ok(&mut consumer).await, 2);
        timeout(WAIT, async {
            while pulled.load(Ordering::SeqCst) < 5 {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(pulled.load(Ordering::SeqCst), 5);

        let mut rest = Vec::new();
        while let Some(item) = timeout(WAIT, consumer.next()).await.unwrap() {
            rest.push(item.unwrap());
        }
        assert_eq!(rest, vec![3, 4, 5]);
    }

    #[tokio::test]
    async fn test_last_consumer_leaving_keeps_unread_elements() {
        crate::testing::init_tracing();
        let factory = BroadcastHub::with_start_after(1, 4).unwrap().attach(stream::iter(0u32..));
        let mut first = factory.consumer();
        assert_eq!(next_ok(&mut first).await, 0);

        timeout(WAIT, async {
            while factory.buffered_len() < 4 {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        drop(first);

        let mut second = factory.consumer();
        assert_eq!(next_ok(&mut second).await, 1);
        assert_eq!(next_ok(&mut second).await, 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_buffered_len_never_exceeds_capacity() {
        let factory = BroadcastHub::new(1).unwrap().attach(stream::iter(0u64..));
        let mut consumer = factory.consumer();

        let observer = {
            let factory = factory.clone();
            tokio::task::spawn_blocking(move || {
                for _ in 0..200_000 {
                    assert!(factory.buffered_len() <= 1);
                }
            })
        };
        while !observer.is_finished() {
            next_ok(&mut consumer).await;
        }
        observer.await.unwrap();
    }

    #[test]
    fn test_runtime_shutdown_closes_every_consumer() {
        let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        let (factory, mut attached, mut pending) = runtime.block_on(async {
            let factory = BroadcastHub::<u32>::new(4).unwrap().attach(stream::pending());
            let attached = factory.consumer();
            sleep(Duration::from_millis(20)).await;
            let pending = factory.consumer();
            (factory, attached, pending)
        });
        drop(runtime);

        assert!(factory.is_closed());
        for consumer in [&mut attached, &mut pending] {
            let mut next = tokio_test::task::spawn(consumer.next());
            assert!(matches!(next.poll(), Poll::Ready(Some(Err(HubError::HubClosed)))));
        }
        let mut late = factory.consumer();
        let mut next = tokio_test::task::spawn(late.next());
        assert!(matches!(next.poll(), Poll::Ready(Some(Err(HubError::HubClosed)))));
    }
}
