//! Lifecycle cell shared by a hub logic and all of its peers.
//!
//! The state is an immutable [`Lifecycle`] value behind an [`ArcSwap`].
//! Every change builds a new value and installs it with compare-and-swap,
//! retrying on contention. Contention only happens while peers register, so no
//! backoff is applied. Replaced values are freed when the last reader drops
//! its `Arc`.
//!
//! Exactly one caller wins the Open -> Closed transition. Registrations that
//! reached the pending list before that are handed to the winner; later ones
//! observe the final cause directly.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::{ArcSwap, Guard};

use crate::error::HubError;

/// Peer identifier. Monotonically increasing, never reused within one hub.
pub type PeerId = u64;

/// A peer waiting to be picked up by the hub logic.
#[derive(Debug, Clone)]
pub struct PeerRegistration<C> {
    /// Peer id.
    pub id: PeerId,
    /// Callback into the peer's own execution.
    pub callback: C,
}

impl<C> PeerRegistration<C> {
    /// Pairs an id with the peer's callback.
    pub fn new(id: PeerId, callback: C) -> Self {
        Self { id, callback }
    }
}

/// Snapshot of the hub lifecycle.
#[derive(Debug, Clone)]
pub enum Lifecycle<C> {
    /// Accepting registrations; `pending` have not been taken by the hub logic yet.
    Open {
        /// Registrations not yet picked up.
        pending: Vec<PeerRegistration<C>>,
    },
    /// Final. `None` is normal completion or cancellation without a failure.
    Closed(Option<HubError>),
}

/// Atomically swapped hub lifecycle plus the peer id allocator.
pub struct HubState<C> {
    lifecycle: ArcSwap<Lifecycle<C>>,
    next_id: AtomicU64,
}

impl<C: Clone> HubState<C> {
    /// Creates an open state with no pending registrations.
    pub fn new() -> Self {
        Self {
            lifecycle: ArcSwap::from_pointee(Lifecycle::Open { pending: Vec::new() }),
            next_id: AtomicU64::new(0),
        }
    }

    /// Allocates the next peer id.
    pub fn next_peer_id(&self) -> PeerId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Appends a registration to the pending list.
    ///
    /// Fails with the final cause when the hub is already closed.
    pub fn register(&self, registration: PeerRegistration<C>) -> Result<(), Option<HubError>> {
        self.update(|current| match current {
            Lifecycle::Open { pending } => {
                let mut pending = pending.clone();
                pending.push(registration.clone());
                (Some(Lifecycle::Open { pending }), Ok(()))
            }
            Lifecycle::Closed(cause) => (None, Err(cause.clone())),
        })
    }

    /// Takes every pending registration, leaving the state open.
    pub fn take_pending(&self) -> Vec<PeerRegistration<C>> {
        self.update(|current| match current {
            Lifecycle::Open { pending } if !pending.is_empty() => {
                (Some(Lifecycle::Open { pending: Vec::new() }), pending.clone())
            }
            _ => (None, Vec::new()),
        })
    }

    /// Withdraws a registration the hub logic has not picked up yet.
    ///
    /// Returns false when the hub already took it (or closed); the peer must
    /// then deregister through the hub callback instead.
    pub fn remove_pending(&self, id: PeerId) -> bool {
        self.update(|current| match current {
            Lifecycle::Open { pending } if pending.iter().any(|r| r.id == id) => {
                let pending = pending.iter().filter(|r| r.id != id).cloned().collect();
                (Some(Lifecycle::Open { pending }), true)
            }
            _ => (None, false),
        })
    }

    /// Moves the hub to `Closed(cause)`.
    ///
    /// Returns the registrations that were still pending when this call won
    /// the transition, or `None` if the hub was already closed.
    pub fn close(&self, cause: Option<HubError>) -> Option<Vec<PeerRegistration<C>>> {
        self.update(|current| match current {
            Lifecycle::Open { pending } => (Some(Lifecycle::Closed(cause.clone())), Some(pending.clone())),
            Lifecycle::Closed(_) => (None, None),
        })
    }

    /// Current lifecycle snapshot.
    pub fn snapshot(&self) -> Lifecycle<C> {
        Lifecycle::clone(&self.lifecycle.load())
    }

    /// Returns the final cause once closed.
    pub fn closed_cause(&self) -> Option<Option<HubError>> {
        match &**self.lifecycle.load() {
            Lifecycle::Open { .. } => None,
            Lifecycle::Closed(cause) => Some(cause.clone()),
        }
    }

    /// True once the hub reached `Closed`.
    pub fn is_closed(&self) -> bool {
        matches!(**self.lifecycle.load(), Lifecycle::Closed(_))
    }

    /// Compare-and-swap loop. `step` returns the replacement value (or `None`
    /// to leave the state untouched) and the caller's result.
    fn update<T, F>(&self, mut step: F) -> T
    where
        F: FnMut(&Lifecycle<C>) -> (Option<Lifecycle<C>>, T),
    {
        let mut current = self.lifecycle.load_full();
        loop {
            let (next, output) = step(&current);
            let Some(next) = next else {
                return output;
            };
            let previous = self.lifecycle.compare_and_swap(&current, Arc::new(next));
            if Arc::ptr_eq(&previous, &current) {
                return output;
            }
            current = Guard::into_inner(previous);
        }
    }
}

impl<C: Clone> Default for HubState<C> {
    fn default() -> Self {
        Self::new()
    }
}
