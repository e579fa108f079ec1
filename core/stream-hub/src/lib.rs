//! # Stream Hub
//!
//! Dynamic fan-in and fan-out for async streams: attach any number of peers to
//! a fixed stream endpoint, from any task or thread, at any time.
//!
//! ## Features
//!
//! - **Merge hub**: many producers, one consumer, per-producer backpressure
//! - **Broadcast hub**: one upstream, every consumer sees every element
//! - **Partition hub**: one upstream, each element routed to one consumer
//! - **Bounded**: upstream pulling stops at the configured buffer size
//! - **Failure isolation**: a failing producer never affects its siblings
//!
//! ## Example
//!
//! ```rust,ignore
//! use futures_util::{stream, StreamExt};
//! use stream_hub::{BroadcastHub, MergeHub};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let (merged, producers) = MergeHub::<u64>::new(16)?.materialize();
//!     for worker in 0..4u64 {
//!         tokio::spawn(producers.sink().run(stream::iter(worker * 10..worker * 10 + 10)));
//!     }
//!
//!     let consumers = BroadcastHub::with_start_after(2, 64)?.attach(merged);
//!     let mut audit = consumers.consumer();
//!     let mut metrics = consumers.consumer();
//!     tokio::spawn(async move { while metrics.next().await.is_some() {} });
//!
//!     while let Some(value) = audit.next().await {
//!         println!("audit: {}", value?);
//!     }
//!     Ok(())
//! }
//! ```

// Shared machinery
pub mod callback;
pub mod config;
pub mod demand;
pub mod error;
pub mod hub_state;
pub(crate) mod events;

// Merge hub
pub mod merge_hub;

// Broadcast hub
pub(crate) mod consumer_wheel;
pub(crate) mod ring_buffer;
pub mod broadcast_hub;

// Partition hub
pub(crate) mod partition_queue;
pub mod partition_hub;

#[cfg(test)]
pub(crate) mod testing;

// Re-exports
pub use callback::AsyncCallback;
pub use config::HubConfig;
pub use demand::{Credit, DemandTracker};
pub use error::{FailureCause, HubError};
pub use hub_state::{HubState, Lifecycle, PeerId, PeerRegistration};

pub use merge_hub::{DrainingControl, MergeHub, MergeHubSink, MergeHubSource, ProducerFactory};

pub use broadcast_hub::{BroadcastConsumerFactory, BroadcastHub, BroadcastHubSource};

pub use partition_hub::{ConsumerInfo, PartitionConsumerFactory, PartitionHub, PartitionHubSource};
