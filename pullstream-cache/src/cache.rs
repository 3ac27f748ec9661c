//! Per-stream in-memory event cache.
//!
//! Every stream gets its own buffer behind its own lock, so appends to one
//! stream never wait on readers of another. Within a stream appends are
//! serialized by the buffer's write lock; reads clone `Arc` handles out under
//! the read lock, which makes every read a consistent snapshot with respect to
//! eviction.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::config::CacheConfig;
use crate::error::{Error, Result};
use crate::types::{CacheBatch, CachedItem, SequenceToken, StreamId};

/// Buffered items of a single stream.
struct StreamBuffer<P> {
    items: VecDeque<Arc<CachedItem<P>>>,
    /// Token the next append receives (the high-water mark).
    next_token: SequenceToken,
    /// Set while min residency keeps the buffer above its capacity.
    over_capacity: bool,
}

impl<P> StreamBuffer<P> {
    fn new() -> Self {
        Self {
            items: VecDeque::new(),
            next_token: SequenceToken::ZERO,
            over_capacity: false,
        }
    }

    fn low_water(&self) -> SequenceToken {
        self.items
            .front()
            .map(|item| item.token)
            .unwrap_or(self.next_token)
    }

    fn push(&mut self, stream: &StreamId, payload: P, now: Instant) -> SequenceToken {
        let token = self.next_token;
        self.next_token = token.next();
        self.items.push_back(Arc::new(CachedItem {
            stream: stream.clone(),
            payload,
            token,
            enqueued_at: now,
        }));
        token
    }

    /// Pop expired items from the front. Stops at the first survivor, so the
    /// remaining items keep their order.
    fn evict_expired(&mut self, now: Instant, config: &CacheConfig) -> usize {
        let mut evicted = 0;
        while let Some(front) = self.items.front() {
            let age = now.saturating_duration_since(front.enqueued_at);
            if age > config.data_max_age_in_cache && age >= config.data_min_time_in_cache {
                self.items.pop_front();
                evicted += 1;
            } else {
                break;
            }
        }
        evicted
    }

    /// Pop the oldest items past min residency until the buffer fits `capacity`.
    fn relieve_pressure(
        &mut self,
        stream: &StreamId,
        now: Instant,
        config: &CacheConfig,
        capacity: usize,
    ) -> usize {
        let mut evicted = 0;
        while self.items.len() > capacity {
            let Some(front) = self.items.front() else {
                break;
            };
            if now.saturating_duration_since(front.enqueued_at) < config.data_min_time_in_cache {
                break;
            }
            self.items.pop_front();
            evicted += 1;
        }

        let over = self.items.len() > capacity;
        if over && !self.over_capacity {
            warn!(
                stream = %stream,
                capacity,
                buffered = self.items.len(),
                "stream cache over capacity; items are still within min residency"
            );
        }
        self.over_capacity = over;
        evicted
    }
}

/// Time- and size-bounded cache of published items, indexed by stream.
pub struct EventCache<P> {
    config: CacheConfig,
    clock: Arc<dyn Clock>,
    streams: RwLock<HashMap<StreamId, Arc<RwLock<StreamBuffer<P>>>>>,
}

impl<P> EventCache<P>
where
    P: Send + Sync + 'static,
{
    /// Create a cache after validating its bounds.
    pub fn new(config: CacheConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            clock,
            streams: RwLock::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    async fn buffer(&self, stream: &StreamId) -> Option<Arc<RwLock<StreamBuffer<P>>>> {
        self.streams.read().await.get(stream).cloned()
    }

    async fn buffer_or_create(&self, stream: &StreamId) -> Arc<RwLock<StreamBuffer<P>>> {
        if let Some(buffer) = self.buffer(stream).await {
            return buffer;
        }
        let mut streams = self.streams.write().await;
        Arc::clone(
            streams
                .entry(stream.clone())
                .or_insert_with(|| Arc::new(RwLock::new(StreamBuffer::new()))),
        )
    }

    /// Append an item and return its token.
    pub async fn append(&self, stream: &StreamId, payload: P) -> SequenceToken {
        let buffer = self.buffer_or_create(stream).await;
        let mut buffer = buffer.write().await;
        let now = self.clock.now();
        let token = buffer.push(stream, payload, now);
        if let Some(capacity) = self.config.max_items_per_stream {
            buffer.relieve_pressure(stream, now, &self.config, capacity);
        }
        token
    }

    /// Append several items consecutively. Returns the last token, or `None`
    /// for an empty batch.
    pub async fn append_batch(
        &self,
        stream: &StreamId,
        payloads: Vec<P>,
    ) -> Option<SequenceToken> {
        if payloads.is_empty() {
            return None;
        }

        let buffer = self.buffer_or_create(stream).await;
        let mut buffer = buffer.write().await;
        let now = self.clock.now();
        let mut last = None;
        for payload in payloads {
            last = Some(buffer.push(stream, payload, now));
        }
        if let Some(capacity) = self.config.max_items_per_stream {
            buffer.relieve_pressure(stream, now, &self.config, capacity);
        }
        last
    }

    /// Read up to `max_count` items starting at `from`, oldest first.
    ///
    /// Fails with [`Error::TokenTooOld`] when `from` was already evicted.
    /// A position at or past the high-water mark yields an empty batch.
    pub async fn read_from(
        &self,
        stream: &StreamId,
        from: SequenceToken,
        max_count: usize,
    ) -> Result<CacheBatch<P>> {
        let Some(buffer) = self.buffer(stream).await else {
            return Ok(CacheBatch::empty());
        };
        let buffer = buffer.read().await;

        let low_water = buffer.low_water();
        if from < low_water {
            return Err(Error::TokenTooOld {
                stream: stream.clone(),
                requested: from,
                low_water,
            });
        }

        // Tokens are dense, so the offset from the low-water mark is the index.
        let start = low_water.distance_to(from) as usize;
        let items = buffer
            .items
            .iter()
            .skip(start)
            .take(max_count)
            .cloned()
            .collect();
        Ok(CacheBatch::new(items))
    }

    /// Evict every item past max age and min residency. Returns how many were removed.
    pub async fn evict(&self, now: Instant) -> usize {
        let buffers: Vec<(StreamId, Arc<RwLock<StreamBuffer<P>>>)> = self
            .streams
            .read()
            .await
            .iter()
            .map(|(id, buffer)| (id.clone(), Arc::clone(buffer)))
            .collect();

        let mut total = 0;
        for (stream, buffer) in buffers {
            let evicted = buffer.write().await.evict_expired(now, &self.config);
            if evicted > 0 {
                debug!(stream = %stream, evicted, "evicted expired items");
            }
            total += evicted;
        }
        total
    }

    /// Oldest token still cached. Equals the high-water mark for an empty buffer.
    pub async fn low_water_mark(&self, stream: &StreamId) -> SequenceToken {
        match self.buffer(stream).await {
            Some(buffer) => buffer.read().await.low_water(),
            None => SequenceToken::ZERO,
        }
    }

    /// Token the next append to `stream` will receive.
    pub async fn high_water_mark(&self, stream: &StreamId) -> SequenceToken {
        match self.buffer(stream).await {
            Some(buffer) => buffer.read().await.next_token,
            None => SequenceToken::ZERO,
        }
    }

    /// Number of items currently cached for `stream`.
    pub async fn len(&self, stream: &StreamId) -> usize {
        match self.buffer(stream).await {
            Some(buffer) => buffer.read().await.items.len(),
            None => 0,
        }
    }

    /// Number of streams that have ever been appended to.
    pub async fn stream_count(&self) -> usize {
        self.streams.read().await.len()
    }
}
