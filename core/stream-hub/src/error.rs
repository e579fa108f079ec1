//! Error types shared by every hub variant.
//!
//! A single [`HubError`] value may be delivered to many peers at once (every
//! consumer of a failed broadcast hub sees the same cause), so it is cheap to
//! clone: foreign failures are wrapped in a shared [`FailureCause`].

use std::sync::Arc;
use thiserror::Error;

use crate::hub_state::PeerId;

/// Shared failure cause handed to every affected peer.
pub type FailureCause = Arc<anyhow::Error>;

/// Errors produced by hub construction, hub logic and peers.
#[non_exhaustive]
#[derive(Error, Debug, Clone)]
pub enum HubError {
    /// A buffer size argument was rejected at construction.
    #[error("invalid {name} {size}: {reason}")]
    InvalidBufferSize {
        /// Name of the rejected argument.
        name: &'static str,
        /// The rejected value.
        size: usize,
        /// Why the value was rejected.
        reason: &'static str,
    },

    /// The hub shut down (or was cancelled) before or while this peer was attached.
    #[error("hub closed")]
    HubClosed,

    /// The single upstream of a broadcast or partition hub failed.
    #[error("upstream failed: {0}")]
    UpstreamFailed(FailureCause),

    /// A merge-hub producer failed. Only ever logged; siblings are unaffected.
    #[error("producer failed: {0}")]
    ProducerFailed(FailureCause),

    /// The routing function selected a consumer that is not attached.
    #[error("routing function selected consumer {id} which is not attached")]
    UnknownConsumer {
        /// The id returned by the routing function.
        id: PeerId,
    },

    /// A stateless routing function returned an index outside the consumer snapshot.
    #[error("routing index {index} out of range for {consumers} consumers")]
    InvalidRoute {
        /// The returned index.
        index: usize,
        /// Number of consumers in the snapshot.
        consumers: usize,
    },

    /// Configuration could not be parsed.
    #[error("configuration error: {0}")]
    Config(String),
}

impl HubError {
    /// Wraps any error as an upstream failure.
    pub fn upstream<E: Into<anyhow::Error>>(error: E) -> Self {
        HubError::UpstreamFailed(Arc::new(error.into()))
    }

    /// Wraps any error as a merge-hub producer failure.
    pub fn producer<E: Into<anyhow::Error>>(error: E) -> Self {
        HubError::ProducerFailed(Arc::new(error.into()))
    }

    /// Returns a short stable label (snake_case) for use in logs.
    pub fn as_label(&self) -> &'static str {
        match self {
            HubError::InvalidBufferSize { .. } => "hub_invalid_buffer_size",
            HubError::HubClosed => "hub_closed",
            HubError::UpstreamFailed(_) => "hub_upstream_failed",
            HubError::ProducerFailed(_) => "hub_producer_failed",
            HubError::UnknownConsumer { .. } => "hub_unknown_consumer",
            HubError::InvalidRoute { .. } => "hub_invalid_route",
            HubError::Config(_) => "hub_config",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upstream_cause_is_shared_between_clones() {
        let err = HubError::upstream(anyhow::anyhow!("disk on fire"));
        let cloned = err.clone();

        match (&err, &cloned) {
            (HubError::UpstreamFailed(a), HubError::UpstreamFailed(b)) => assert!(Arc::ptr_eq(a, b)),
            other => panic!("unexpected variants: {other:?}"),
        }
        assert_eq!(cloned.to_string(), "upstream failed: disk on fire");
    }

    #[test]
    fn test_labels() {
        assert_eq!(HubError::HubClosed.as_label(), "hub_closed");
        let err = HubError::InvalidBufferSize { name: "buffer_size", size: 0, reason: "must be positive" };
        assert_eq!(err.as_label(), "hub_invalid_buffer_size");
        assert_eq!(err.to_string(), "invalid buffer_size 0: must be positive");
    }

    #[test]
    fn test_producer_failure() {
        let err = HubError::producer(anyhow::anyhow!("socket reset"));
        assert_eq!(err.as_label(), "hub_producer_failed");
        assert_eq!(err.to_string(), "producer failed: socket reset");
    }
}
