//! Consumer push sinks
//!
//! A sink is the consumer side of a subscription: the delivery agent pushes
//! every item to it and only advances the subscription's cursor once `push`
//! returns `Ok`. Sinks must tolerate redelivery, since a push that failed or
//! was cut short by shutdown is attempted again from the same cursor.

use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::error::PushError;
use crate::events::DeliveryGap;
use pullstream_cache::CachedItem;

/// Receives items delivered on one subscription
#[async_trait]
pub trait ConsumerSink<P>: Send + Sync {
    /// Deliver one item. `Ok` acknowledges it.
    async fn push(&self, item: Arc<CachedItem<P>>) -> Result<(), PushError>;

    /// Called before delivery resumes after items were evicted unseen.
    async fn on_gap(&self, _gap: &DeliveryGap) {}
}

/// What a [`ChannelSink`] forwards
#[derive(Debug)]
pub enum Delivery<P> {
    Item(Arc<CachedItem<P>>),
    Gap(DeliveryGap),
}

/// Sink that forwards items and gaps into an unbounded channel
pub struct ChannelSink<P> {
    tx: mpsc::UnboundedSender<Delivery<P>>,
}

impl<P> ChannelSink<P> {
    /// Create a sink and the receiver it feeds
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Delivery<P>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl<P> ConsumerSink<P> for ChannelSink<P>
where
    P: Send + Sync + 'static,
{
    async fn push(&self, item: Arc<CachedItem<P>>) -> Result<(), PushError> {
        self.tx
            .send(Delivery::Item(item))
            .map_err(|_| PushError::new("receiver dropped"))
    }

    async fn on_gap(&self, gap: &DeliveryGap) {
        let _ = self.tx.send(Delivery::Gap(gap.clone()));
    }
}

/// Sink that logs every item it receives
#[derive(Debug, Clone)]
pub struct LoggingSink {
    name: String,
}

impl LoggingSink {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[async_trait]
impl<P> ConsumerSink<P> for LoggingSink
where
    P: Debug + Send + Sync + 'static,
{
    async fn push(&self, item: Arc<CachedItem<P>>) -> Result<(), PushError> {
        info!(
            consumer = %self.name,
            stream = %item.stream,
            token = %item.token,
            "received item {:?}",
            item.payload
        );
        Ok(())
    }

    async fn on_gap(&self, gap: &DeliveryGap) {
        warn!(
            consumer = %self.name,
            stream = %gap.stream,
            requested = %gap.requested,
            resumed_at = %gap.resumed_at,
            "items were evicted before delivery"
        );
    }
}
