//! Stream provider
//!
//! The embedding surface: owns the cache, registry, agents, publisher and
//! monitor of one engine instance, and runs the background maintenance.
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use pullstream_core::{StreamConfig, StreamProvider, StreamId, ChannelSink, TokioClock};
//! # async fn demo() -> pullstream_core::Result<()> {
//! let provider = Arc::new(StreamProvider::<String>::new(
//!     StreamConfig::default(),
//!     Arc::new(TokioClock),
//! )?);
//! provider.start().await;
//!
//! let stream = provider.stream(StreamId::random("chat"));
//! let (sink, _rx) = ChannelSink::new();
//! stream.subscribe("reader", sink).await?;
//! stream.produce("hello".to_string()).await?;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{Mutex, broadcast};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::agent::{AgentContext, AgentDirectory, AgentId, AgentState};
use crate::config::StreamConfig;
use crate::error::{Result, StreamError};
use crate::events::{DeactivationReason, EventEmitter, StreamEvent};
use crate::monitor::{InactivityMonitor, SweepReport};
use crate::publisher::Publisher;
use crate::registry::{ConsumerId, Subscription, SubscriptionRegistry, SubscriptionStatus};
use crate::sink::ConsumerSink;
use pullstream_cache::{Clock, EventCache, SequenceToken, StreamId};

/// Operator view of a stream's agent
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AgentSnapshot {
    pub id: AgentId,
    pub state: AgentState,
    pub idle_for_ms: u64,
    pub in_flight: usize,
}

/// Operator view of one stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StreamStatus {
    pub stream: StreamId,
    pub agent: Option<AgentSnapshot>,
    pub low_water_mark: SequenceToken,
    pub high_water_mark: SequenceToken,
    pub cached_items: usize,
    pub pending_work: bool,
    pub subscriptions: Vec<SubscriptionStatus>,
}

/// One pulling pub/sub engine instance
pub struct StreamProvider<P> {
    config: StreamConfig,
    clock: Arc<dyn Clock>,
    cache: Arc<EventCache<P>>,
    registry: Arc<SubscriptionRegistry<P>>,
    agents: Arc<AgentDirectory<P>>,
    publisher: Publisher<P>,
    monitor: Arc<InactivityMonitor<P>>,
    events: EventEmitter,
    cancel: CancellationToken,
    maintenance: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
    shut_down: AtomicBool,
}

impl<P> StreamProvider<P>
where
    P: Send + Sync + 'static,
{
    /// Validate `config` and wire up every component.
    ///
    /// Nothing runs in the background until [`start`](Self::start).
    pub fn new(config: StreamConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        config.validate()?;

        let cache = Arc::new(EventCache::new(config.cache.clone(), Arc::clone(&clock))?);
        let registry = Arc::new(SubscriptionRegistry::new(Arc::clone(&cache)));
        let events = EventEmitter::new(config.monitor.event_channel_capacity);
        let agents = Arc::new(AgentDirectory::new(AgentContext {
            cache: Arc::clone(&cache),
            registry: Arc::clone(&registry),
            clock: Arc::clone(&clock),
            config: config.agent.clone(),
            events: events.clone(),
        }));
        let publisher = Publisher::new(Arc::clone(&cache), Arc::clone(&agents));
        let monitor = Arc::new(InactivityMonitor::new(
            Arc::clone(&agents),
            config.monitor.monitor_poll_interval,
        ));

        Ok(Self {
            config,
            clock,
            cache,
            registry,
            agents,
            publisher,
            monitor,
            events,
            cancel: CancellationToken::new(),
            maintenance: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
            shut_down: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    /// Spawn the inactivity monitor and the eviction loop. Idempotent.
    pub async fn start(&self) {
        if self.is_shut_down() || self.started.swap(true, Ordering::SeqCst) {
            return;
        }

        let monitor = tokio::spawn(Arc::clone(&self.monitor).run(self.cancel.clone()));
        let eviction = tokio::spawn(run_eviction(
            Arc::clone(&self.cache),
            Arc::clone(&self.clock),
            self.config.monitor.eviction_interval,
            self.cancel.clone(),
        ));
        self.maintenance.lock().await.extend([monitor, eviction]);

        info!(
            inactivity = ?self.config.agent.stream_inactivity_period,
            poll = ?self.config.monitor.monitor_poll_interval,
            "stream provider started"
        );
    }

    fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    fn ensure_running(&self) -> Result<()> {
        if self.is_shut_down() {
            Err(StreamError::ShutDown)
        } else {
            Ok(())
        }
    }

    pub async fn produce(&self, stream: &StreamId, payload: P) -> Result<SequenceToken> {
        self.ensure_running()?;
        self.publisher.produce(stream, payload).await
    }

    pub async fn produce_batch(
        &self,
        stream: &StreamId,
        payloads: Vec<P>,
    ) -> Result<Option<SequenceToken>> {
        self.ensure_running()?;
        self.publisher.produce_batch(stream, payloads).await
    }

    /// Subscribe `consumer` to `stream`.
    ///
    /// Without `start` only items produced from now on are delivered. A
    /// historical start wakes the agent so replay begins right away.
    pub async fn subscribe(
        &self,
        stream: &StreamId,
        consumer: impl Into<ConsumerId>,
        sink: Arc<dyn ConsumerSink<P>>,
        start: Option<SequenceToken>,
    ) -> Result<Subscription> {
        self.ensure_running()?;
        let subscription = self
            .registry
            .subscribe(stream, consumer.into(), sink, start)
            .await;

        if subscription.next_token() < self.cache.high_water_mark(stream).await {
            self.agents.activate(stream).await;
        }
        Ok(subscription)
    }

    /// Remove a subscription. Safe to repeat; returns whether it existed.
    ///
    /// The stream's agent is torn down when its last subscriber leaves.
    pub async fn unsubscribe(&self, stream: &StreamId, consumer: &ConsumerId) -> bool {
        let removed = self.registry.unsubscribe(stream, consumer).await;
        if removed && self.registry.subscriber_count(stream).await == 0 {
            self.agents.deactivate_if_unsubscribed(stream).await;
        }
        removed
    }

    /// Resume delivery to a degraded subscription
    pub async fn reinstate(&self, stream: &StreamId, consumer: &ConsumerId) -> Result<()> {
        self.ensure_running()?;
        self.registry.reinstate(stream, consumer).await?;
        info!(stream = %stream, consumer = %consumer, "subscription reinstated");
        self.agents.activate(stream).await;
        Ok(())
    }

    pub async fn stream_status(&self, stream: &StreamId) -> StreamStatus {
        let now = self.clock.now();
        let agent = self
            .agents
            .snapshot(stream)
            .await
            .map(|status| AgentSnapshot {
                id: status.id,
                state: status.state,
                idle_for_ms: u64::try_from(status.idle_for(now).as_millis()).unwrap_or(u64::MAX),
                in_flight: status.in_flight,
            });

        StreamStatus {
            stream: stream.clone(),
            agent,
            low_water_mark: self.cache.low_water_mark(stream).await,
            high_water_mark: self.cache.high_water_mark(stream).await,
            cached_items: self.cache.len(stream).await,
            pending_work: self.agents.has_pending(stream).await,
            subscriptions: self.registry.statuses(stream).await,
        }
    }

    /// Subscribe to lifecycle events
    pub fn events(&self) -> broadcast::Receiver<StreamEvent> {
        self.events.subscribe()
    }

    /// Run one inactivity sweep now
    pub async fn sweep(&self) -> SweepReport {
        self.monitor.sweep().await
    }

    /// Run one eviction pass now. Returns how many items were evicted.
    pub async fn evict(&self) -> usize {
        self.cache.evict(self.clock.now()).await
    }

    pub fn registry(&self) -> &SubscriptionRegistry<P> {
        &self.registry
    }

    pub fn cache(&self) -> &EventCache<P> {
        &self.cache
    }

    /// Stop maintenance and every agent.
    ///
    /// In-flight deliveries get up to `shutdown_grace` to finish. Later
    /// produce and subscribe calls fail with [`StreamError::ShutDown`].
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }

        self.cancel.cancel();
        let handles: Vec<JoinHandle<()>> = self.maintenance.lock().await.drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }

        let stopped = self.agents.stop_all(DeactivationReason::Shutdown).await;
        info!(stopped, "stream provider shut down");
    }

    /// Handle bound to one stream
    pub fn stream(self: &Arc<Self>, id: StreamId) -> StreamHandle<P> {
        StreamHandle {
            provider: Arc::clone(self),
            id,
        }
    }
}

async fn run_eviction<P>(
    cache: Arc<EventCache<P>>,
    clock: Arc<dyn Clock>,
    period: Duration,
    cancel: CancellationToken,
) where
    P: Send + Sync + 'static,
{
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let evicted = cache.evict(clock.now()).await;
                if evicted > 0 {
                    debug!(evicted, "eviction pass");
                }
            }
        }
    }
}

/// Producer and consumer operations for one stream
pub struct StreamHandle<P> {
    provider: Arc<StreamProvider<P>>,
    id: StreamId,
}

impl<P> Clone for StreamHandle<P> {
    fn clone(&self) -> Self {
        Self {
            provider: Arc::clone(&self.provider),
            id: self.id.clone(),
        }
    }
}

impl<P> StreamHandle<P>
where
    P: Send + Sync + 'static,
{
    pub fn id(&self) -> &StreamId {
        &self.id
    }

    pub async fn produce(&self, payload: P) -> Result<SequenceToken> {
        self.provider.produce(&self.id, payload).await
    }

    pub async fn produce_batch(&self, payloads: Vec<P>) -> Result<Option<SequenceToken>> {
        self.provider.produce_batch(&self.id, payloads).await
    }

    /// Subscribe for items produced from now on
    pub async fn subscribe<S>(
        &self,
        consumer: impl Into<ConsumerId>,
        sink: S,
    ) -> Result<Subscription>
    where
        S: ConsumerSink<P> + 'static,
    {
        self.provider
            .subscribe(&self.id, consumer, Arc::new(sink), None)
            .await
    }

    /// Subscribe starting at `token`, replaying whatever is still cached
    pub async fn subscribe_from<S>(
        &self,
        consumer: impl Into<ConsumerId>,
        sink: S,
        token: SequenceToken,
    ) -> Result<Subscription>
    where
        S: ConsumerSink<P> + 'static,
    {
        self.provider
            .subscribe(&self.id, consumer, Arc::new(sink), Some(token))
            .await
    }

    pub async fn unsubscribe(&self, consumer: impl Into<ConsumerId>) -> bool {
        self.provider.unsubscribe(&self.id, &consumer.into()).await
    }

    pub async fn status(&self) -> StreamStatus {
        self.provider.stream_status(&self.id).await
    }
}
