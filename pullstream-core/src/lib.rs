//! pullstream-core: Pulling pub/sub delivery engine
//!
//! Producers append to an in-memory cache; per-stream delivery agents pull
//! from it at each subscriber's cursor and push to the subscriber's sink.
//! Agents retire after a period of inactivity and are re-created on the next
//! produce without losing or skipping anything still cached.
//!
//! - **Provider** - [`StreamProvider`] and [`StreamHandle`] tie everything together
//! - **Publishing** - [`Publisher`] appends and wakes the stream's agent
//! - **Subscriptions** - [`SubscriptionRegistry`] owns consumers and their cursors
//! - **Delivery** - [`ConsumerSink`] implementations receive items, e.g. [`ChannelSink`]
//! - **Maintenance** - [`InactivityMonitor`] retires idle agents and restarts failed ones
//! - **Events** - [`StreamEvent`] lifecycle feed from [`StreamProvider::events`]
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use pullstream_core::{ChannelSink, Delivery, StreamConfig, StreamId, StreamProvider, TokioClock};
//!
//! async fn example() -> pullstream_core::Result<()> {
//!     let provider = Arc::new(StreamProvider::new(StreamConfig::default(), Arc::new(TokioClock))?);
//!     provider.start().await;
//!
//!     let stream = provider.stream(StreamId::random("orders"));
//!     let (sink, mut deliveries) = ChannelSink::new();
//!     stream.subscribe("billing", sink).await?;
//!
//!     stream.produce(42_u64).await?;
//!     if let Some(Delivery::Item(item)) = deliveries.recv().await {
//!         println!("got {} at {}", item.payload, item.token);
//!     }
//!
//!     provider.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! ```text
//!  produce ──► Publisher ──► EventCache (per-stream buffers)
//!                 │                 ▲
//!      slot lock, │ signal          │ read_from(cursor)
//!                 ▼                 │
//!            AgentDirectory ──► Agent (pull loop) ──► delivery task ──► ConsumerSink
//!                 ▲                 │                     │
//!                 │                 │                     └─► advance cursor
//!        InactivityMonitor          ▼                             │
//!        (retire / restart)   StreamEvent feed      SubscriptionRegistry ◄┘
//! ```

pub mod agent;
pub mod config;
pub mod error;
pub mod events;
pub mod monitor;
pub mod provider;
pub mod publisher;
pub mod registry;
pub mod restart;
pub mod sink;

// Re-export key types for convenience
pub use agent::{AgentId, AgentState, AgentStatus};
pub use config::{AgentConfig, GapRecovery, MonitorConfig, StreamConfig};
pub use error::{ConfigError, PushError, RegistryError, Result, StreamError};
pub use events::{DeactivationReason, DeliveryGap, StreamEvent};
pub use monitor::{InactivityMonitor, SweepReport};
pub use provider::{AgentSnapshot, StreamHandle, StreamProvider, StreamStatus};
pub use publisher::Publisher;
pub use registry::{ConsumerId, FailureVerdict, Subscription, SubscriptionRegistry, SubscriptionStatus};
pub use restart::{RestartDecision, RestartPolicy};
pub use sink::{ChannelSink, ConsumerSink, Delivery, LoggingSink};

pub use pullstream_cache::{
    CacheBatch, CacheConfig, CachedItem, Clock, EventCache, ManualClock, SequenceToken, StreamId,
    TokioClock,
};
