//! One delivery pass for one subscriber

use tracing::{debug, warn};

use super::AgentContext;
use crate::config::GapRecovery;
use crate::events::{DeliveryGap, StreamEvent};
use crate::registry::{ConsumerId, Subscriber};
use pullstream_cache::{Error as CacheError, StreamId};

/// How a delivery task ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum DeliveryOutcome {
    /// Everything read was acknowledged
    Delivered { consumer: ConsumerId, delivered: usize },
    /// A push failed; the cursor stays at the failed item
    Failed {
        consumer: ConsumerId,
        delivered: usize,
        error: String,
    },
    /// The subscription disappeared mid-batch
    Unsubscribed { consumer: ConsumerId, delivered: usize },
}

impl DeliveryOutcome {
    pub(crate) fn consumer(&self) -> &ConsumerId {
        match self {
            Self::Delivered { consumer, .. }
            | Self::Failed { consumer, .. }
            | Self::Unsubscribed { consumer, .. } => consumer,
        }
    }

    pub(crate) fn delivered(&self) -> usize {
        match self {
            Self::Delivered { delivered, .. }
            | Self::Failed { delivered, .. }
            | Self::Unsubscribed { delivered, .. } => *delivered,
        }
    }
}

/// Read up to `pull_batch_size` items from the subscriber's cursor and push
/// them in order, advancing the cursor after each acknowledgment.
///
/// A cursor below the cache's low-water mark is moved per `gap_recovery` and
/// the gap reported before anything else is pushed.
pub(crate) async fn deliver_batch<P>(
    stream: StreamId,
    subscriber: Subscriber<P>,
    ctx: AgentContext<P>,
) -> DeliveryOutcome
where
    P: Send + Sync + 'static,
{
    let Subscriber { subscription, sink } = subscriber;
    let from = subscription.next_token();
    let consumer = subscription.consumer;
    let max = ctx.config.pull_batch_size;

    let batch = match ctx.cache.read_from(&stream, from, max).await {
        Ok(batch) => batch,
        Err(CacheError::TokenTooOld { low_water, .. }) => {
            let resumed_at = match ctx.config.gap_recovery {
                GapRecovery::LowWaterMark => low_water,
                GapRecovery::Latest => ctx.cache.high_water_mark(&stream).await,
            };
            if ctx
                .registry
                .reset_cursor(&stream, &consumer, resumed_at)
                .await
                .is_err()
            {
                return DeliveryOutcome::Unsubscribed {
                    consumer,
                    delivered: 0,
                };
            }

            let gap = DeliveryGap {
                stream: stream.clone(),
                consumer: consumer.clone(),
                requested: from,
                resumed_at,
            };
            warn!(
                stream = %stream,
                consumer = %consumer,
                requested = %from,
                resumed_at = %resumed_at,
                skipped = gap.skipped(),
                "items evicted before delivery, resuming later in the stream"
            );
            sink.on_gap(&gap).await;
            ctx.events.emit(StreamEvent::DeliveryGap(gap));

            match ctx.cache.read_from(&stream, resumed_at, max).await {
                Ok(batch) => batch,
                // Evicted again in between; the cursor is still behind, so the
                // next pass handles it.
                Err(_) => {
                    return DeliveryOutcome::Delivered {
                        consumer,
                        delivered: 0,
                    };
                }
            }
        }
        Err(err) => {
            return DeliveryOutcome::Failed {
                consumer,
                delivered: 0,
                error: err.to_string(),
            };
        }
    };

    let mut delivered = 0;
    for item in batch {
        let token = item.token;
        if let Err(err) = sink.push(item).await {
            debug!(stream = %stream, consumer = %consumer, token = %token, "push failed: {}", err);
            return DeliveryOutcome::Failed {
                consumer,
                delivered,
                error: err.to_string(),
            };
        }
        delivered += 1;

        if ctx
            .registry
            .advance(&stream, &consumer, token)
            .await
            .is_err()
        {
            return DeliveryOutcome::Unsubscribed {
                consumer,
                delivered,
            };
        }
    }

    DeliveryOutcome::Delivered {
        consumer,
        delivered,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::agent::test_support::context;
    use crate::error::PushError;
    use crate::sink::{ChannelSink, ConsumerSink, Delivery};
    use pullstream_cache::{CacheConfig, CachedItem, Clock, SequenceToken};

    fn stream() -> StreamId {
        StreamId::new("ns-1", uuid::Uuid::nil())
    }

    /// Acknowledges the first `ok` pushes, then fails
    struct FlakySink {
        ok: usize,
        seen: AtomicUsize,
    }

    #[async_trait]
    impl ConsumerSink<u32> for FlakySink {
        async fn push(&self, _item: Arc<CachedItem<u32>>) -> Result<(), PushError> {
            if self.seen.fetch_add(1, Ordering::SeqCst) < self.ok {
                Ok(())
            } else {
                Err(PushError::new("nope"))
            }
        }
    }

    async fn subscriber(
        ctx: &AgentContext<u32>,
        sink: Arc<dyn ConsumerSink<u32>>,
        start: SequenceToken,
    ) -> Subscriber<u32> {
        ctx.registry
            .subscribe(&stream(), ConsumerId::from("c"), sink, Some(start))
            .await;
        ctx.registry.deliverable(&stream()).await.remove(0)
    }

    #[tokio::test]
    async fn delivers_in_order_and_advances_cursor() {
        let (ctx, _clock) = context(CacheConfig::default());
        ctx.cache.append_batch(&stream(), vec![10, 11, 12]).await;
        let (sink, mut rx) = ChannelSink::new();
        let sub = subscriber(&ctx, Arc::new(sink), SequenceToken(0)).await;

        let outcome = deliver_batch(stream(), sub, ctx.clone()).await;

        assert_eq!(outcome.delivered(), 3);
        for expected in [10, 11, 12] {
            assert!(matches!(rx.recv().await, Some(Delivery::Item(i)) if i.payload == expected));
        }
        let cursor = ctx
            .registry
            .get(&stream(), &ConsumerId::from("c"))
            .await
            .unwrap();
        assert_eq!(cursor.next_token(), SequenceToken(3));
    }

    #[tokio::test]
    async fn batch_size_limits_one_pass() {
        let (mut ctx, _clock) = context(CacheConfig::default());
        ctx.config.pull_batch_size = 2;
        ctx.cache.append_batch(&stream(), vec![1, 2, 3]).await;
        let (sink, _rx) = ChannelSink::new();
        let sub = subscriber(&ctx, Arc::new(sink), SequenceToken(0)).await;

        let outcome = deliver_batch(stream(), sub, ctx.clone()).await;

        assert_eq!(outcome.delivered(), 2);
    }

    #[tokio::test]
    async fn failed_push_keeps_cursor_at_failed_item() {
        let (ctx, _clock) = context(CacheConfig::default());
        ctx.cache.append_batch(&stream(), vec![1, 2, 3]).await;
        let sink = Arc::new(FlakySink {
            ok: 1,
            seen: AtomicUsize::new(0),
        });
        let sub = subscriber(&ctx, sink, SequenceToken(0)).await;

        let outcome = deliver_batch(stream(), sub, ctx.clone()).await;

        assert!(matches!(outcome, DeliveryOutcome::Failed { delivered: 1, .. }));
        let cursor = ctx
            .registry
            .get(&stream(), &ConsumerId::from("c"))
            .await
            .unwrap();
        assert_eq!(cursor.next_token(), SequenceToken(1));
    }

    #[tokio::test]
    async fn evicted_cursor_reports_gap_before_items() {
        let config = CacheConfig::default()
            .with_max_age(Duration::from_secs(10))
            .with_min_time(Duration::from_secs(1));
        let (ctx, clock) = context(config);
        ctx.cache.append_batch(&stream(), vec![1, 2]).await;
        let (sink, mut rx) = ChannelSink::new();
        let sub = subscriber(&ctx, Arc::new(sink), SequenceToken(0)).await;
        clock.advance(Duration::from_secs(11));
        ctx.cache.append(&stream(), 3).await;
        ctx.cache.evict(clock.now()).await;
        let mut events = ctx.events.subscribe();

        let outcome = deliver_batch(stream(), sub, ctx.clone()).await;

        assert_eq!(outcome.delivered(), 1);
        match rx.recv().await {
            Some(Delivery::Gap(gap)) => {
                assert_eq!(gap.requested, SequenceToken(0));
                assert_eq!(gap.resumed_at, SequenceToken(2));
            }
            other => panic!("expected gap first, got {other:?}"),
        }
        assert!(matches!(rx.recv().await, Some(Delivery::Item(i)) if i.payload == 3));
        assert!(matches!(
            events.try_recv(),
            Ok(StreamEvent::DeliveryGap(gap)) if gap.skipped() == 2
        ));
    }

    #[tokio::test]
    async fn latest_recovery_skips_to_high_water_mark() {
        let config = CacheConfig::default()
            .with_max_age(Duration::from_secs(10))
            .with_min_time(Duration::from_secs(1));
        let (mut ctx, clock) = context(config);
        ctx.config.gap_recovery = GapRecovery::Latest;
        ctx.cache.append_batch(&stream(), vec![1, 2]).await;
        let (sink, mut rx) = ChannelSink::new();
        let sub = subscriber(&ctx, Arc::new(sink), SequenceToken(0)).await;
        clock.advance(Duration::from_secs(11));
        ctx.cache.append(&stream(), 3).await;
        ctx.cache.evict(clock.now()).await;

        let outcome = deliver_batch(stream(), sub, ctx.clone()).await;

        assert_eq!(outcome.delivered(), 0);
        assert!(matches!(rx.recv().await, Some(Delivery::Gap(g)) if g.resumed_at == SequenceToken(3)));
    }

    #[tokio::test]
    async fn unsubscribed_mid_batch_stops() {
        let (ctx, _clock) = context(CacheConfig::default());
        ctx.cache.append_batch(&stream(), vec![1, 2]).await;
        let (sink, _rx) = ChannelSink::new();
        let sub = subscriber(&ctx, Arc::new(sink), SequenceToken(0)).await;
        ctx.registry
            .unsubscribe(&stream(), &ConsumerId::from("c"))
            .await;

        let outcome = deliver_batch(stream(), sub, ctx).await;

        assert!(matches!(
            outcome,
            DeliveryOutcome::Unsubscribed { delivered: 1, .. }
        ));
    }
}
