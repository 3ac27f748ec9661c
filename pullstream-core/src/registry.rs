//! Subscription registry
//!
//! The registry owns every subscription and its cursor. Delivery agents come
//! and go with stream activity, but cursors live here, so a re-created agent
//! resumes each consumer exactly where the last acknowledged push left it.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::RegistryError;
use crate::sink::ConsumerSink;
use pullstream_cache::{EventCache, SequenceToken, StreamId};

/// Identifies one consumer of a stream
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConsumerId(String);

impl ConsumerId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ConsumerId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for ConsumerId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl fmt::Display for ConsumerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A consumer's position on a stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    pub stream: StreamId,
    pub consumer: ConsumerId,
    /// First position to deliver when nothing has been delivered yet
    pub start_token: SequenceToken,
    /// Last acknowledged position
    pub last_delivered: Option<SequenceToken>,
}

impl Subscription {
    /// Position of the next item this consumer should receive
    pub fn next_token(&self) -> SequenceToken {
        self.last_delivered
            .map(SequenceToken::next)
            .unwrap_or(self.start_token)
    }
}

/// Result of recording a failed push
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureVerdict {
    /// Try again later; `attempts` consecutive failures so far
    Retry { attempts: u32 },
    /// Retries exhausted; the subscription is now degraded
    Degraded { attempts: u32 },
}

/// Operator view of one subscription
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubscriptionStatus {
    pub consumer: ConsumerId,
    pub next_token: SequenceToken,
    pub last_delivered: Option<SequenceToken>,
    pub consecutive_failures: u32,
    pub degraded: bool,
}

/// A subscription together with the sink to push to
pub(crate) struct Subscriber<P> {
    pub(crate) subscription: Subscription,
    pub(crate) sink: Arc<dyn ConsumerSink<P>>,
}

struct Entry<P> {
    subscription: Subscription,
    sink: Arc<dyn ConsumerSink<P>>,
    failures: u32,
    degraded: bool,
}

/// Tracks subscriptions and cursors per stream
pub struct SubscriptionRegistry<P> {
    cache: Arc<EventCache<P>>,
    streams: RwLock<HashMap<StreamId, HashMap<ConsumerId, Entry<P>>>>,
}

impl<P> SubscriptionRegistry<P>
where
    P: Send + Sync + 'static,
{
    /// Create a registry resolving default start positions against `cache`
    pub fn new(cache: Arc<EventCache<P>>) -> Self {
        Self {
            cache,
            streams: RwLock::new(HashMap::new()),
        }
    }

    /// Subscribe a consumer, or return its existing subscription.
    ///
    /// Without `start` the consumer only receives items produced from now on.
    /// A start beyond the stream's high-water mark is clamped to it. Subscribing
    /// again keeps the cursor and swaps in the new sink.
    pub async fn subscribe(
        &self,
        stream: &StreamId,
        consumer: ConsumerId,
        sink: Arc<dyn ConsumerSink<P>>,
        start: Option<SequenceToken>,
    ) -> Subscription {
        let high_water = self.cache.high_water_mark(stream).await;
        let mut streams = self.streams.write().await;
        let consumers = streams.entry(stream.clone()).or_default();

        if let Some(entry) = consumers.get_mut(&consumer) {
            entry.sink = sink;
            return entry.subscription.clone();
        }

        let start_token = start.map_or(high_water, |token| token.min(high_water));
        let subscription = Subscription {
            stream: stream.clone(),
            consumer: consumer.clone(),
            start_token,
            last_delivered: None,
        };
        debug!(stream = %stream, consumer = %consumer, start = %start_token, "subscribed");
        consumers.insert(
            consumer,
            Entry {
                subscription: subscription.clone(),
                sink,
                failures: 0,
                degraded: false,
            },
        );
        subscription
    }

    /// Remove a subscription. Returns whether it existed.
    pub async fn unsubscribe(&self, stream: &StreamId, consumer: &ConsumerId) -> bool {
        let mut streams = self.streams.write().await;
        let Some(consumers) = streams.get_mut(stream) else {
            return false;
        };
        let removed = consumers.remove(consumer).is_some();
        if consumers.is_empty() {
            streams.remove(stream);
        }
        if removed {
            debug!(stream = %stream, consumer = %consumer, "unsubscribed");
        }
        removed
    }

    async fn with_entry<F, R>(
        &self,
        stream: &StreamId,
        consumer: &ConsumerId,
        f: F,
    ) -> Result<R, RegistryError>
    where
        F: FnOnce(&mut Entry<P>) -> R,
    {
        let mut streams = self.streams.write().await;
        let entry = streams
            .get_mut(stream)
            .and_then(|consumers| consumers.get_mut(consumer))
            .ok_or_else(|| RegistryError::UnknownSubscription {
                stream: stream.clone(),
                consumer: consumer.clone(),
            })?;
        Ok(f(entry))
    }

    /// Record an acknowledged delivery
    pub async fn advance(
        &self,
        stream: &StreamId,
        consumer: &ConsumerId,
        token: SequenceToken,
    ) -> Result<(), RegistryError> {
        self.with_entry(stream, consumer, |entry| {
            entry.subscription.last_delivered = Some(token);
            entry.failures = 0;
        })
        .await
    }

    /// Move a cursor so the next delivery starts at `token`
    pub async fn reset_cursor(
        &self,
        stream: &StreamId,
        consumer: &ConsumerId,
        token: SequenceToken,
    ) -> Result<(), RegistryError> {
        self.with_entry(stream, consumer, |entry| {
            entry.subscription.start_token = token;
            entry.subscription.last_delivered = None;
        })
        .await
    }

    /// Count a failed push and decide whether to keep retrying
    pub async fn record_failure(
        &self,
        stream: &StreamId,
        consumer: &ConsumerId,
        max_attempts: u32,
    ) -> Result<FailureVerdict, RegistryError> {
        self.with_entry(stream, consumer, |entry| {
            entry.failures += 1;
            if entry.failures >= max_attempts {
                entry.degraded = true;
                FailureVerdict::Degraded {
                    attempts: entry.failures,
                }
            } else {
                FailureVerdict::Retry {
                    attempts: entry.failures,
                }
            }
        })
        .await
    }

    /// Clear the degraded flag so delivery resumes
    pub async fn reinstate(
        &self,
        stream: &StreamId,
        consumer: &ConsumerId,
    ) -> Result<(), RegistryError> {
        self.with_entry(stream, consumer, |entry| {
            entry.degraded = false;
            entry.failures = 0;
        })
        .await
    }

    /// Look up one subscription
    pub async fn get(&self, stream: &StreamId, consumer: &ConsumerId) -> Option<Subscription> {
        self.streams
            .read()
            .await
            .get(stream)
            .and_then(|consumers| consumers.get(consumer))
            .map(|entry| entry.subscription.clone())
    }

    /// Snapshot of every subscription on a stream
    pub async fn list_subscribers(&self, stream: &StreamId) -> Vec<Subscription> {
        let mut subscriptions: Vec<Subscription> = self
            .streams
            .read()
            .await
            .get(stream)
            .map(|consumers| {
                consumers
                    .values()
                    .map(|entry| entry.subscription.clone())
                    .collect()
            })
            .unwrap_or_default();
        subscriptions.sort_by(|a, b| a.consumer.cmp(&b.consumer));
        subscriptions
    }

    pub async fn subscriber_count(&self, stream: &StreamId) -> usize {
        self.streams
            .read()
            .await
            .get(stream)
            .map_or(0, HashMap::len)
    }

    /// Operator view of every subscription on a stream
    pub async fn statuses(&self, stream: &StreamId) -> Vec<SubscriptionStatus> {
        let mut statuses: Vec<SubscriptionStatus> = self
            .streams
            .read()
            .await
            .get(stream)
            .map(|consumers| {
                consumers
                    .values()
                    .map(|entry| SubscriptionStatus {
                        consumer: entry.subscription.consumer.clone(),
                        next_token: entry.subscription.next_token(),
                        last_delivered: entry.subscription.last_delivered,
                        consecutive_failures: entry.failures,
                        degraded: entry.degraded,
                    })
                    .collect()
            })
            .unwrap_or_default();
        statuses.sort_by(|a, b| a.consumer.cmp(&b.consumer));
        statuses
    }

    /// Subscriptions the agent should deliver to, with their sinks
    pub(crate) async fn deliverable(&self, stream: &StreamId) -> Vec<Subscriber<P>> {
        self.streams
            .read()
            .await
            .get(stream)
            .map(|consumers| {
                consumers
                    .values()
                    .filter(|entry| !entry.degraded)
                    .map(|entry| Subscriber {
                        subscription: entry.subscription.clone(),
                        sink: Arc::clone(&entry.sink),
                    })
                    .collect()
            })
            .unwrap_or_default()
    }
}
