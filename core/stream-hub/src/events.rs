//! Event type definitions exchanged between hub logic and peers.
//!
//! Every message crosses an [`AsyncCallback`](crate::callback::AsyncCallback);
//! nothing here is shared mutably.

use crate::error::HubError;
use crate::hub_state::PeerId;

// ============================================================================
// Merge Hub
// ============================================================================

/// Events flowing from producers into the merge-hub logic.
#[derive(Debug)]
pub(crate) enum MergeEvent<T> {
    /// A producer added itself to the pending list.
    RegistrationPending,
    /// One element from producer `id`.
    Element { id: PeerId, element: T },
    /// Producer `id` stopped; `failure` is set when it failed.
    Deregister { id: PeerId, failure: Option<HubError> },
    /// Stop accepting producers and complete once the attached ones finish.
    Drain,
}

/// Control events delivered to a merge-hub producer.
#[derive(Debug, Clone)]
pub(crate) enum ProducerEvent {
    /// Additional credit.
    Demand(usize),
    /// The hub is gone; stop producing.
    Shutdown,
}

// ============================================================================
// Broadcast Hub
// ============================================================================

/// Events flowing from broadcast consumers into the hub logic.
#[derive(Debug)]
pub(crate) enum BroadcastEvent {
    /// A consumer added itself to the pending list.
    RegistrationPending,
    /// Consumer `id` read a full threshold past `previous_offset`.
    Advance { id: PeerId, previous_offset: u64 },
    /// Consumer `id` found nothing at `current_offset` and is waiting.
    NeedWakeup { id: PeerId, previous_offset: u64, current_offset: u64 },
    /// Consumer `id` left after reading everything before `final_offset`.
    /// Both offsets are `None` if it never saw its start offset.
    Unregister { id: PeerId, previous_offset: Option<u64>, final_offset: Option<u64> },
}

/// Control events delivered to a broadcast consumer.
#[derive(Debug, Clone)]
pub(crate) enum ConsumerEvent {
    /// Registration accepted; start reading at `offset`.
    Initialize { offset: u64 },
    /// New data may be available.
    Wakeup,
    /// The hub terminated. Final regardless of the consumer's read position.
    HubCompleted(Option<HubError>),
}

// ============================================================================
// Partition Hub
// ============================================================================

/// Events flowing from partition consumers into the hub logic.
#[derive(Debug)]
pub(crate) enum PartitionEvent {
    /// A consumer added itself to the pending list.
    RegistrationPending,
    /// Consumer `id` found its queue empty and is waiting.
    NeedWakeup { id: PeerId },
    /// Total buffered size dropped to the pull threshold.
    TryPull,
    /// Consumer `id` left.
    Unregister { id: PeerId },
}

/// Control events delivered to a partition consumer.
#[derive(Debug, Clone)]
pub(crate) enum PartitionConsumerEvent {
    /// Registration accepted; the consumer queue exists.
    Initialize,
    /// The consumer queue is no longer empty.
    Wakeup,
    /// The hub terminated.
    HubCompleted(Option<HubError>),
}
