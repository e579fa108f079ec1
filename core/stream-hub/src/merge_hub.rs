//! Merge hub: many dynamically attached producers, one fixed consumer.
//!
//! Materializing a [`MergeHub`] yields the fixed side, a [`MergeHubSource`]
//! stream, together with a [`ProducerFactory`]. Every call to
//! [`ProducerFactory::sink`] attaches one more independent [`MergeHubSink`],
//! from any thread, at any time.
//!
//! # Design
//! - All producers push into one shared FIFO ([`AsyncCallback`]); the hub logic
//!   runs inside `poll_next`, so the queue is only drained while the consumer
//!   has demand. Not polling is the idle state.
//! - Each producer starts with a threshold of credit and is granted another
//!   threshold every time the hub has consumed that many of its elements.
//! - A failing producer is removed and logged; the consumer never sees it.
//! - Dropping the source shuts the hub down: every attached and pending
//!   producer is told to stop and no producer may attach afterwards.
//!
//! ## Example
//!
//! ```rust,ignore
//! let (mut merged, producers) = MergeHub::<u64>::new(16)?.materialize();
//!
//! for worker in 0..4 {
//!     let sink = producers.sink();
//!     tokio::spawn(sink.run(futures_util::stream::iter(worker * 100..worker * 100 + 10)));
//! }
//!
//! while let Some(value) = merged.next().await {
//!     println!("merged {value}");
//! }
//! ```

use std::collections::HashMap;
use std::future::poll_fn;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use futures_util::stream::{Stream, StreamExt};
use tracing::{debug, warn};

use crate::callback::AsyncCallback;
use crate::config::{demand_threshold, validate_positive, HubConfig};
use crate::demand::{Credit, DemandTracker};
use crate::error::HubError;
use crate::events::{MergeEvent, ProducerEvent};
use crate::hub_state::{HubState, PeerId, PeerRegistration};

/// Builder for merge-hub materializations.
#[derive(Debug, Clone)]
pub struct MergeHub<T> {
    per_producer_buffer_size: usize,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Send + 'static> MergeHub<T> {
    /// Validates `per_producer_buffer_size` (must be positive).
    pub fn new(per_producer_buffer_size: usize) -> Result<Self, HubError> {
        validate_positive("per_producer_buffer_size", per_producer_buffer_size)?;
        Ok(Self { per_producer_buffer_size, _marker: PhantomData })
    }

    /// Builds a hub from [`HubConfig::per_producer_buffer_size`].
    pub fn from_config(config: &HubConfig) -> Result<Self, HubError> {
        Self::new(config.per_producer_buffer_size)
    }

    /// Materializes the fixed side and its producer factory.
    pub fn materialize(&self) -> (MergeHubSource<T>, ProducerFactory<T>) {
        let shared = Arc::new(MergeShared {
            queue: AsyncCallback::new(),
            state: HubState::new(),
            threshold: demand_threshold(self.per_producer_buffer_size),
            draining: AtomicBool::new(false),
        });
        debug!("Materialized merge hub (per-producer buffer {})", self.per_producer_buffer_size);
        (MergeHubSource::new(shared.clone()), ProducerFactory { shared })
    }

    /// Like [`materialize`](Self::materialize), plus a handle to drain the hub.
    pub fn materialize_with_draining(&self) -> (MergeHubSource<T>, ProducerFactory<T>, DrainingControl<T>) {
        let (source, factory) = self.materialize();
        let control = DrainingControl { shared: factory.shared.clone() };
        (source, factory, control)
    }
}

struct MergeShared<T> {
    queue: AsyncCallback<MergeEvent<T>>,
    state: HubState<AsyncCallback<ProducerEvent>>,
    threshold: usize,
    draining: AtomicBool,
}

impl<T> MergeShared<T> {
    fn request_drain(&self) {
        if !self.draining.swap(true, Ordering::AcqRel) {
            self.queue.invoke(MergeEvent::Drain);
        }
    }
}

struct Producer {
    callback: AsyncCallback<ProducerEvent>,
    demand: DemandTracker,
}

/// Fixed side of a merge hub: the merged stream of every attached producer.
///
/// Elements of one producer keep their order; no order is imposed across
/// producers.
pub struct MergeHubSource<T> {
    shared: Arc<MergeShared<T>>,
    producers: HashMap<PeerId, Producer>,
    draining: bool,
    finished: bool,
}

impl<T> MergeHubSource<T> {
    fn new(shared: Arc<MergeShared<T>>) -> Self {
        Self { shared, producers: HashMap::new(), draining: false, finished: false }
    }

    /// Receives the next merged element.
    pub async fn recv(&mut self) -> Option<T> {
        self.next().await
    }

    /// Cancels the consumer side, stopping every producer.
    pub fn cancel(&mut self) {
        self.shut_down();
    }

    /// Producers currently known to the hub logic.
    pub fn producer_count(&self) -> usize {
        self.producers.len()
    }

    fn absorb_pending(&mut self) {
        for registration in self.shared.state.take_pending() {
            self.add_producer(registration);
        }
    }

    fn add_producer(&mut self, registration: PeerRegistration<AsyncCallback<ProducerEvent>>) {
        debug!("Producer {} registered with merge hub", registration.id);
        self.producers.insert(
            registration.id,
            Producer { callback: registration.callback, demand: DemandTracker::new(self.shared.threshold) },
        );
    }

    /// Handles one event; returns an element when one is ready for the consumer.
    fn on_event(&mut self, event: MergeEvent<T>) -> Option<T> {
        match event {
            MergeEvent::RegistrationPending => {
                self.absorb_pending();
                None
            }
            MergeEvent::Element { id, element } => {
                if !self.producers.contains_key(&id) {
                    self.absorb_pending();
                }
                match self.producers.get_mut(&id) {
                    Some(producer) => {
                        if let Some(credit) = producer.demand.on_element() {
                            producer.callback.invoke(ProducerEvent::Demand(credit));
                        }
                    }
                    None => debug!("Element from withdrawn producer {}", id),
                }
                Some(element)
            }
            MergeEvent::Deregister { id, failure } => {
                if !self.producers.contains_key(&id) {
                    self.absorb_pending();
                }
                self.producers.remove(&id);
                log_deregistration(id, failure.as_ref());
                None
            }
            MergeEvent::Drain => {
                self.start_draining();
                None
            }
        }
    }

    fn start_draining(&mut self) {
        self.draining = true;
        // Producers still pending were attached before the drain; they may finish.
        if let Some(pending) = self.shared.state.close(None) {
            for registration in pending {
                self.add_producer(registration);
            }
        }
        debug!("Merge hub draining, waiting for {} producers", self.producers.len());
    }

    fn shut_down(&mut self) {
        if let Some(pending) = self.shared.state.close(None) {
            for registration in pending {
                registration.callback.invoke(ProducerEvent::Shutdown);
            }
        }
        for (_, producer) in self.producers.drain() {
            producer.callback.invoke(ProducerEvent::Shutdown);
        }
        if !self.finished {
            debug!("Merge hub shutting down");
        }
        self.finished = true;
        self.shared.queue.drain(drop);
    }
}

fn log_deregistration(id: PeerId, failure: Option<&HubError>) {
    match failure {
        Some(error) => warn!("Producer {} failed [{}]: {}", id, error.as_label(), error),
        None => debug!("Producer {} completed", id),
    }
}

impl<T> Stream for MergeHubSource<T> {
    type Item = T;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<T>> {
        let this = self.get_mut();
        loop {
            if this.finished {
                return Poll::Ready(None);
            }
            if this.draining && this.producers.is_empty() {
                debug!("Merge hub drained");
                this.finished = true;
                return Poll::Ready(None);
            }
            match this.shared.queue.poll_recv(cx) {
                Poll::Ready(event) => {
                    if let Some(element) = this.on_event(event) {
                        return Poll::Ready(Some(element));
                    }
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl<T> Drop for MergeHubSource<T> {
    fn drop(&mut self) {
        self.shut_down();
    }
}

/// Handle for completing a merge hub gracefully.
///
/// Once draining starts, no new producer may attach; the merged stream
/// completes after every producer that was already attached has finished.
pub struct DrainingControl<T> {
    shared: Arc<MergeShared<T>>,
}

impl<T> DrainingControl<T> {
    /// Starts draining. Idempotent.
    pub fn drain_and_complete(&self) {
        self.shared.request_drain();
    }

    /// True once draining was requested.
    pub fn is_draining(&self) -> bool {
        self.shared.draining.load(Ordering::Acquire)
    }
}

impl<T> Clone for DrainingControl<T> {
    fn clone(&self) -> Self {
        Self { shared: self.shared.clone() }
    }
}

impl<T> std::fmt::Debug for DrainingControl<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DrainingControl").field("draining", &self.is_draining()).finish()
    }
}

/// Materialized value of a merge hub: attaches new producers.
pub struct ProducerFactory<T> {
    shared: Arc<MergeShared<T>>,
}

impl<T> ProducerFactory<T> {
    /// Attaches a new producer.
    pub fn sink(&self) -> MergeHubSink<T> {
        MergeHubSink::attach(self.shared.clone())
    }

    /// True once the hub stopped accepting producers.
    pub fn is_closed(&self) -> bool {
        self.shared.state.is_closed()
    }
}

impl<T> Clone for ProducerFactory<T> {
    fn clone(&self) -> Self {
        Self { shared: self.shared.clone() }
    }
}

/// One dynamically attached producer.
///
/// Dropping it without calling [`complete`](Self::complete) or
/// [`fail`](Self::fail) counts as completion.
pub struct MergeHubSink<T> {
    id: PeerId,
    shared: Arc<MergeShared<T>>,
    callback: AsyncCallback<ProducerEvent>,
    credit: Credit,
    stopped: bool,
    finished: bool,
}

impl<T> MergeHubSink<T> {
    fn attach(shared: Arc<MergeShared<T>>) -> Self {
        let id = shared.state.next_peer_id();
        let callback = AsyncCallback::new();
        let stopped = match shared.state.register(PeerRegistration::new(id, callback.clone())) {
            Ok(()) => {
                shared.queue.invoke(MergeEvent::RegistrationPending);
                false
            }
            Err(_) => {
                debug!("Producer {} rejected, merge hub closed", id);
                true
            }
        };
        let credit = Credit::new(shared.threshold);
        Self { id, shared, callback, credit, stopped, finished: stopped }
    }

    /// Peer id of this producer.
    pub fn id(&self) -> PeerId {
        self.id
    }

    /// True once the hub told this producer to stop.
    pub fn is_closed(&self) -> bool {
        self.stopped
    }

    /// Waits for credit. Fails with [`HubError::HubClosed`] once the hub is gone.
    pub fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), HubError>> {
        while let Some(event) = self.callback.try_recv() {
            self.on_event(event);
        }
        loop {
            if self.stopped || self.finished {
                return Poll::Ready(Err(HubError::HubClosed));
            }
            if self.credit.remaining() > 0 {
                return Poll::Ready(Ok(()));
            }
            match self.callback.poll_recv(cx) {
                Poll::Ready(event) => self.on_event(event),
                Poll::Pending => return Poll::Pending,
            }
        }
    }

    /// Sends one element, waiting for credit first.
    pub async fn send(&mut self, element: T) -> Result<(), HubError> {
        poll_fn(|cx| self.poll_ready(cx)).await?;
        let granted = self.credit.try_consume();
        debug_assert!(granted);
        self.shared.queue.invoke(MergeEvent::Element { id: self.id, element });
        Ok(())
    }

    /// Forwards a whole stream, then completes.
    pub async fn run<S>(mut self, stream: S) -> Result<(), HubError>
    where
        S: Stream<Item = T>,
    {
        let mut stream = std::pin::pin!(stream);
        while let Some(element) = stream.next().await {
            self.send(element).await?;
        }
        self.complete();
        Ok(())
    }

    /// Completes this producer.
    pub fn complete(mut self) {
        self.deregister(None);
    }

    /// Fails this producer. Only this producer is removed.
    pub fn fail<E: Into<anyhow::Error>>(mut self, error: E) {
        self.deregister(Some(HubError::producer(error)));
    }

    fn on_event(&mut self, event: ProducerEvent) {
        match event {
            ProducerEvent::Demand(amount) => self.credit.replenish(amount),
            ProducerEvent::Shutdown => {
                debug!("Producer {} stopped by merge hub", self.id);
                self.stopped = true;
                self.finished = true;
            }
        }
    }

    fn deregister(&mut self, failure: Option<HubError>) {
        if self.finished {
            return;
        }
        self.finished = true;
        if self.shared.state.remove_pending(self.id) {
            // Never picked up by the hub logic; nothing to tell it.
            log_deregistration(self.id, failure.as_ref());
            return;
        }
        self.shared.queue.invoke(MergeEvent::Deregister { id: self.id, failure });
    }
}

impl<T> Drop for MergeHubSink<T> {
    fn drop(&mut self) {
        self.deregister(None);
    }
}
