//! Partition hub: one upstream, many dynamically attached consumers, each
//! element routed to exactly one of them.
//!
//! A routing function sees a [`ConsumerInfo`] snapshot of the attached
//! consumers (sorted by id) and picks one. It is never called while no
//! consumer is attached; elements wait in the hub until one is.
//!
//! # Design
//! - Like the broadcast hub, the logic is one tokio task multiplexing consumer
//!   events and upstream pulls.
//! - Each consumer owns a queue in [`PartitionQueue`]. The hub stops pulling
//!   once the sum of every queue plus the unrouted elements reaches the buffer
//!   size, so one slow consumer can hold back the others.
//! - A consumer that drains the total down to half the buffer asks the hub to
//!   pull again. An empty consumer parks with `NeedWakeup`.
//! - A route naming a consumer that is not attached fails the hub.
//!
//! ## Example
//!
//! ```rust,ignore
//! // Even numbers to the first consumer, odd numbers to the second.
//! let hub = PartitionHub::new(|consumers, n: &u64| (*n % consumers as u64) as usize, 2, 256)?;
//! let consumers = hub.attach(futures_util::stream::iter(0..100));
//!
//! let evens = consumers.consumer();
//! let odds = consumers.consumer();
//! ```

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::convert::Infallible;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use futures_util::stream::{Stream, StreamExt};
use tracing::{debug, warn};

use crate::callback::AsyncCallback;
use crate::config::{demand_threshold, validate_positive, HubConfig};
use crate::error::HubError;
use crate::events::{PartitionConsumerEvent, PartitionEvent};
use crate::hub_state::{HubState, PeerId, PeerRegistration};
use crate::partition_queue::{PartitionQueue, QueueItem};

/// What a routing function knows about the attached consumers.
pub trait ConsumerInfo {
    /// Attached consumer ids, ascending.
    fn consumer_ids(&self) -> &[PeerId];

    /// Number of attached consumers. Never zero when routing.
    fn size(&self) -> usize {
        self.consumer_ids().len()
    }

    /// Id at position `idx` of [`consumer_ids`](Self::consumer_ids).
    fn consumer_id_by_idx(&self, idx: usize) -> Option<PeerId> {
        self.consumer_ids().get(idx).copied()
    }

    /// Elements currently queued for consumer `id`.
    fn queue_size(&self, id: PeerId) -> usize;
}

struct ConsumerSnapshot<'a, T> {
    ids: &'a [PeerId],
    queue: &'a PartitionQueue<T>,
}

impl<T> ConsumerInfo for ConsumerSnapshot<'_, T> {
    fn consumer_ids(&self) -> &[PeerId] {
        self.ids
    }

    fn queue_size(&self, id: PeerId) -> usize {
        self.queue.queue_size(id)
    }
}

type Router<T> = Box<dyn FnMut(&dyn ConsumerInfo, &T) -> Result<PeerId, HubError> + Send>;
type RouterFactory<T> = Arc<dyn Fn() -> Router<T> + Send + Sync>;

/// Builder for partition-hub materializations.
pub struct PartitionHub<T> {
    router_factory: RouterFactory<T>,
    start_after_nr_of_consumers: usize,
    buffer_size: usize,
}

impl<T> PartitionHub<T>
where
    T: Send + 'static,
{
    /// Hub with a stateless router: `partitioner(consumer_count, element)`
    /// returns an index into the sorted consumer ids.
    pub fn new<F>(partitioner: F, start_after_nr_of_consumers: usize, buffer_size: usize) -> Result<Self, HubError>
    where
        F: Fn(usize, &T) -> usize + Send + Sync + 'static,
    {
        let partitioner = Arc::new(partitioner);
        let router_factory: RouterFactory<T> = Arc::new(move || -> Router<T> {
            let partitioner = partitioner.clone();
            Box::new(move |info: &dyn ConsumerInfo, element: &T| {
                let index = partitioner(info.size(), element);
                info.consumer_id_by_idx(index).ok_or(HubError::InvalidRoute { index, consumers: info.size() })
            })
        });
        Self::with_router_factory(router_factory, start_after_nr_of_consumers, buffer_size)
    }

    /// Hub with a stateful router. `factory` runs once per materialization, so
    /// the returned closure may keep state such as a round-robin counter.
    pub fn stateful<F, R>(factory: F, start_after_nr_of_consumers: usize, buffer_size: usize) -> Result<Self, HubError>
    where
        F: Fn() -> R + Send + Sync + 'static,
        R: FnMut(&dyn ConsumerInfo, &T) -> PeerId + Send + 'static,
    {
        let router_factory: RouterFactory<T> = Arc::new(move || -> Router<T> {
            let mut route = factory();
            Box::new(move |info: &dyn ConsumerInfo, element: &T| Ok(route(info, element)))
        });
        Self::with_router_factory(router_factory, start_after_nr_of_consumers, buffer_size)
    }

    /// Stateless hub sized from the partition section of a [`HubConfig`].
    pub fn from_config<F>(partitioner: F, config: &HubConfig) -> Result<Self, HubError>
    where
        F: Fn(usize, &T) -> usize + Send + Sync + 'static,
    {
        Self::new(partitioner, config.partition_start_after_nr_of_consumers, config.partition_buffer_size)
    }

    fn with_router_factory(
        router_factory: RouterFactory<T>,
        start_after_nr_of_consumers: usize,
        buffer_size: usize,
    ) -> Result<Self, HubError> {
        validate_positive("partition_buffer_size", buffer_size)?;
        Ok(Self { router_factory, start_after_nr_of_consumers, buffer_size })
    }

    /// Spawns the hub logic over an infallible upstream.
    ///
    /// Must be called from within a tokio runtime.
    pub fn attach<S>(&self, upstream: S) -> PartitionConsumerFactory<T>
    where
        S: Stream<Item = T> + Send + 'static,
    {
        self.attach_fallible(upstream.map(Ok::<T, Infallible>))
    }

    /// Spawns the hub logic over an upstream that may fail.
    pub fn attach_fallible<S, E>(&self, upstream: S) -> PartitionConsumerFactory<T>
    where
        S: Stream<Item = Result<T, E>> + Send + 'static,
        E: Into<anyhow::Error> + Send + 'static,
    {
        let shared = Arc::new(PartitionShared {
            queue: PartitionQueue::new(),
            state: HubState::new(),
            callback: AsyncCallback::new(),
            unrouted: AtomicUsize::new(0),
            pull_threshold: demand_threshold(self.buffer_size),
        });
        let logic = PartitionLogic {
            shared: shared.clone(),
            router: (self.router_factory)(),
            consumers: BTreeMap::new(),
            ids: Vec::new(),
            pending: VecDeque::new(),
            need_wakeup: HashSet::new(),
            buffer_size: self.buffer_size,
            start_after: self.start_after_nr_of_consumers,
            initialized: false,
            upstream_finished: false,
            completed: false,
            stopped: false,
        };
        debug!(
            "Materialized partition hub (buffer {}, start after {} consumers)",
            self.buffer_size, self.start_after_nr_of_consumers
        );
        tokio::spawn(logic.run(upstream));
        PartitionConsumerFactory { shared }
    }
}

impl<T> Clone for PartitionHub<T> {
    fn clone(&self) -> Self {
        Self {
            router_factory: self.router_factory.clone(),
            start_after_nr_of_consumers: self.start_after_nr_of_consumers,
            buffer_size: self.buffer_size,
        }
    }
}

struct PartitionShared<T> {
    queue: PartitionQueue<T>,
    state: HubState<AsyncCallback<PartitionConsumerEvent>>,
    callback: AsyncCallback<PartitionEvent>,
    /// Elements pulled from upstream but not routed yet.
    unrouted: AtomicUsize,
    pull_threshold: usize,
}

struct PartitionLogic<T> {
    shared: Arc<PartitionShared<T>>,
    router: Router<T>,
    consumers: BTreeMap<PeerId, AsyncCallback<PartitionConsumerEvent>>,
    ids: Vec<PeerId>,
    pending: VecDeque<T>,
    need_wakeup: HashSet<PeerId>,
    buffer_size: usize,
    start_after: usize,
    initialized: bool,
    upstream_finished: bool,
    completed: bool,
    stopped: bool,
}

impl<T> PartitionLogic<T>
where
    T: Send + 'static,
{
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
                    Some(Ok(element)) => {
                        self.pending.push_back(element);
                        self.route_pending();
                    }
                    Some(Err(error)) => self.stop(Some(HubError::upstream(error))),
                    None => {
                        debug!("Partition hub upstream completed");
                        self.upstream_finished = true;
                        self.try_complete();
                    }
                },
            }
        }
    }

    fn is_full(&self) -> bool {
        self.shared.queue.size() + self.pending.len() >= self.buffer_size
    }

    fn wants_upstream(&self) -> bool {
        !self.upstream_finished && !self.stopped && !self.is_full()
    }

    fn on_event(&mut self, event: PartitionEvent) {
        match event {
            PartitionEvent::RegistrationPending => self.register_pending(),
            PartitionEvent::NeedWakeup { id } => {
                if !self.shared.queue.is_empty(id) {
                    if let Some(callback) = self.consumers.get(&id) {
                        callback.invoke(PartitionConsumerEvent::Wakeup);
                    }
                } else if self.consumers.contains_key(&id) {
                    self.need_wakeup.insert(id);
                }
            }
            // Capacity is re-checked before the next pull.
            PartitionEvent::TryPull => {}
            PartitionEvent::Unregister { id } => {
                if self.consumers.remove(&id).is_some() {
                    self.shared.queue.remove(id);
                    self.need_wakeup.remove(&id);
                    self.ids = self.consumers.keys().copied().collect();
                    debug!("Consumer {} left partition hub, {} remaining", id, self.consumers.len());
                }
                if self.completed && self.consumers.is_empty() {
                    self.stop(None);
                }
            }
        }
    }

    fn register_pending(&mut self) {
        for registration in self.shared.state.take_pending() {
            self.shared.queue.init(registration.id);
            registration.callback.invoke(PartitionConsumerEvent::Initialize);
            self.consumers.insert(registration.id, registration.callback);
            debug!("Consumer {} registered with partition hub", registration.id);
        }
        self.ids = self.consumers.keys().copied().collect();
        if !self.initialized && self.consumers.len() >= self.start_after {
            debug!("Partition hub started with {} consumers", self.consumers.len());
            self.initialized = true;
        }
        self.route_pending();
    }

    fn route_pending(&mut self) {
        if self.initialized && !self.ids.is_empty() {
            while let Some(element) = self.pending.pop_front() {
                let snapshot = ConsumerSnapshot { ids: &self.ids, queue: &self.shared.queue };
                let routed = (self.router)(&snapshot, &element);
                let target = match routed {
                    Ok(id) if self.consumers.contains_key(&id) => id,
                    Ok(id) => return self.stop(Some(HubError::UnknownConsumer { id })),
                    Err(error) => return self.stop(Some(error)),
                };
                self.shared.queue.offer(target, element);
                self.wake(target);
            }
        }
        self.shared.unrouted.store(self.pending.len(), Ordering::Release);
        self.try_complete();
    }

    fn wake(&mut self, id: PeerId) {
        if self.need_wakeup.remove(&id) {
            if let Some(callback) = self.consumers.get(&id) {
                callback.invoke(PartitionConsumerEvent::Wakeup);
            }
        }
    }

    fn try_complete(&mut self) {
        if !self.upstream_finished || self.completed || !self.pending.is_empty() || self.stopped {
            return;
        }
        // Unrouted elements only drain once enough consumers are attached.
        self.completed = true;
        let ids = self.ids.clone();
        for id in ids {
            self.shared.queue.offer_completion(id);
            self.wake(id);
        }
        if let Some(pending) = self.shared.state.close(None) {
            for registration in pending {
                registration.callback.invoke(PartitionConsumerEvent::HubCompleted(None));
            }
        }
        debug!("Partition hub completed, {} consumers finishing", self.consumers.len());
        if self.consumers.is_empty() {
            self.stop(None);
        }
    }
}

impl<T> PartitionLogic<T> {
    fn stop(&mut self, cause: Option<HubError>) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        if let Some(error) = &cause {
            warn!("Partition hub failed: {}", error);
        }
        if let Some(pending) = self.shared.state.close(cause.clone()) {
            for registration in pending {
                registration.callback.invoke(PartitionConsumerEvent::HubCompleted(cause.clone()));
            }
        }
        for (_, callback) in std::mem::take(&mut self.consumers) {
            callback.invoke(PartitionConsumerEvent::HubCompleted(cause.clone()));
        }
    }
}

impl<T> Drop for PartitionLogic<T> {
    fn drop(&mut self) {
        // Task aborted or runtime shut down.
        self.stop(Some(HubError::HubClosed));
    }
}

/// Materialized value of a partition hub: attaches new consumers.
pub struct PartitionConsumerFactory<T> {
    shared: Arc<PartitionShared<T>>,
}

impl<T> PartitionConsumerFactory<T> {
    /// Attaches a new consumer.
    pub fn consumer(&self) -> PartitionHubSource<T> {
        PartitionHubSource::attach(self.shared.clone())
    }

    /// Elements held by the hub: queued for consumers plus not yet routed.
    pub fn buffered_len(&self) -> usize {
        self.shared.queue.size() + self.shared.unrouted.load(Ordering::Acquire)
    }

    /// True once the hub completed or failed.
    pub fn is_closed(&self) -> bool {
        self.shared.state.is_closed()
    }
}

impl<T> Clone for PartitionConsumerFactory<T> {
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

/// One dynamically attached partition consumer. Yields the elements routed to
/// it, in upstream order.
pub struct PartitionHubSource<T> {
    id: PeerId,
    shared: Arc<PartitionShared<T>>,
    callback: AsyncCallback<PartitionConsumerEvent>,
    phase: Phase,
    detached: bool,
}

impl<T> PartitionHubSource<T> {
    fn attach(shared: Arc<PartitionShared<T>>) -> Self {
        let id = shared.state.next_peer_id();
        let callback = AsyncCallback::new();
        let (phase, detached) = match shared.state.register(PeerRegistration::new(id, callback.clone())) {
            Ok(()) => {
                shared.callback.invoke(PartitionEvent::RegistrationPending);
                (Phase::AwaitingInit, false)
            }
            Err(Some(error)) => (Phase::Failed(error), true),
            Err(None) => (Phase::Done, true),
        };
        Self { id, shared, callback, phase, detached }
    }

    /// Peer id of this consumer; what a stateful router returns to select it.
    pub fn id(&self) -> PeerId {
        self.id
    }

    fn on_event(&mut self, event: PartitionConsumerEvent) {
        match event {
            PartitionConsumerEvent::Initialize => {
                if matches!(self.phase, Phase::AwaitingInit) {
                    self.phase = Phase::Reading;
                }
            }
            PartitionConsumerEvent::Wakeup => {
                if matches!(self.phase, Phase::Parked) {
                    self.phase = Phase::Reading;
                }
            }
            PartitionConsumerEvent::HubCompleted(cause) => {
                self.detached = true;
                if !matches!(self.phase, Phase::Done) {
                    self.phase = match cause {
                        Some(error) => Phase::Failed(error),
                        None => Phase::Done,
                    };
                }
            }
        }
    }

    fn detach(&mut self) {
        if self.detached {
            return;
        }
        self.detached = true;
        if !self.shared.state.remove_pending(self.id) {
            self.shared.callback.invoke(PartitionEvent::Unregister { id: self.id });
        }
    }
}

impl<T> Stream for PartitionHubSource<T> {
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
                Phase::Reading => match this.shared.queue.poll(this.id) {
                    Some((QueueItem::Element(element), previous_total)) => {
                        if previous_total == this.shared.pull_threshold {
                            this.shared.callback.invoke(PartitionEvent::TryPull);
                        }
                        return Poll::Ready(Some(Ok(element)));
                    }
                    Some((QueueItem::Completed, _)) => {
                        this.phase = Phase::Done;
                        this.detach();
                        return Poll::Ready(None);
                    }
                    None => {
                        this.shared.callback.invoke(PartitionEvent::NeedWakeup { id: this.id });
                        this.phase = Phase::Parked;
                    }
                },
            }
        }
    }
}

impl<T> Drop for PartitionHubSource<T> {
    fn drop(&mut self) {
        self.detach();
    }
}
