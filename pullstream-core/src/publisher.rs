//! Publisher front-end
//!
//! Appends produced items and makes sure the stream's agent will pull them.
//! Produce returns once the item is cached and the agent signalled; it never
//! waits for consumers. Once the agents are closed for shutdown nothing is
//! appended any more.

use std::sync::Arc;

use tracing::debug;

use crate::agent::AgentDirectory;
use crate::error::{Result, StreamError};
use pullstream_cache::{EventCache, SequenceToken, StreamId};

pub struct Publisher<P> {
    cache: Arc<EventCache<P>>,
    agents: Arc<AgentDirectory<P>>,
}

impl<P> Publisher<P>
where
    P: Send + Sync + 'static,
{
    pub(crate) fn new(cache: Arc<EventCache<P>>, agents: Arc<AgentDirectory<P>>) -> Self {
        Self { cache, agents }
    }

    /// Append one item and wake (or re-create) the stream's agent
    pub async fn produce(&self, stream: &StreamId, payload: P) -> Result<SequenceToken> {
        let slot = self.agents.slot(stream).await;
        let mut state = slot.state.lock().await;
        if self.agents.is_closed() {
            return Err(StreamError::ShutDown);
        }

        let token = self.cache.append(stream, payload).await;
        self.agents.ensure_active(stream, &slot, &mut state).await;
        // After the append is visible, so the agent's next ticket covers it
        slot.pending.signal();

        debug!(stream = %stream, token = %token, "produced");
        Ok(token)
    }

    /// Append items consecutively. Returns the last token, or `None` for an
    /// empty batch.
    pub async fn produce_batch(
        &self,
        stream: &StreamId,
        payloads: Vec<P>,
    ) -> Result<Option<SequenceToken>> {
        if payloads.is_empty() {
            return Ok(None);
        }

        let slot = self.agents.slot(stream).await;
        let mut state = slot.state.lock().await;
        if self.agents.is_closed() {
            return Err(StreamError::ShutDown);
        }

        let count = payloads.len();
        let last = self.cache.append_batch(stream, payloads).await;
        self.agents.ensure_active(stream, &slot, &mut state).await;
        slot.pending.signal();

        debug!(stream = %stream, count, "produced batch");
        Ok(last)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::agent::test_support::tokio_context;
    use crate::agent::{AgentHandle, AgentState};
    use crate::events::{DeactivationReason, StreamEvent};
    use crate::registry::ConsumerId;
    use crate::sink::{ChannelSink, Delivery};
    use pullstream_cache::CacheConfig;

    fn stream() -> StreamId {
        StreamId::new("ns-1", uuid::Uuid::nil())
    }

    fn publisher() -> Publisher<u32> {
        let ctx = tokio_context(CacheConfig::default());
        let cache = Arc::clone(&ctx.cache);
        Publisher::new(cache, Arc::new(AgentDirectory::new(ctx)))
    }

    #[tokio::test(start_paused = true)]
    async fn produce_assigns_consecutive_tokens() {
        let publisher = publisher();

        assert_eq!(publisher.produce(&stream(), 1).await.unwrap(), SequenceToken(0));
        assert_eq!(publisher.produce(&stream(), 2).await.unwrap(), SequenceToken(1));
        assert_eq!(
            publisher.produce_batch(&stream(), vec![3, 4]).await.unwrap(),
            Some(SequenceToken(3))
        );
        assert_eq!(
            publisher.produce_batch(&stream(), Vec::new()).await.unwrap(),
            None
        );
    }

    #[tokio::test(start_paused = true)]
    async fn produce_activates_agent() {
        let publisher = publisher();

        publisher.produce(&stream(), 1).await.unwrap();

        assert!(publisher.agents.snapshot(&stream()).await.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn produced_items_reach_subscribers() {
        let publisher = publisher();
        let (sink, mut rx) = ChannelSink::new();
        publisher
            .agents
            .ctx
            .registry
            .subscribe(&stream(), ConsumerId::from("c"), Arc::new(sink), None)
            .await;

        publisher.produce_batch(&stream(), vec![5, 6]).await.unwrap();

        for expected in [5, 6] {
            let delivery = tokio::time::timeout(Duration::from_secs(1), rx.recv())
                .await
                .unwrap();
            assert!(matches!(delivery, Some(Delivery::Item(i)) if i.payload == expected));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn produce_replaces_agent_that_panicked() {
        let publisher = publisher();
        let mut events = publisher.agents.ctx.events.subscribe();
        let (sink, mut rx) = ChannelSink::new();
        publisher
            .agents
            .ctx
            .registry
            .subscribe(&stream(), ConsumerId::from("c"), Arc::new(sink), None)
            .await;

        let slot = publisher.agents.slot(&stream()).await;
        let crashed = {
            let mut state = slot.state.lock().await;
            let agent = AgentHandle::spawn_panicking(stream(), &publisher.agents.ctx, "pull loop crashed");
            let id = agent.id();
            state.agent = Some(agent);
            id
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        match events.try_recv() {
            Ok(StreamEvent::AgentFailed { agent, error, .. }) => {
                assert_eq!(agent, crashed);
                assert_eq!(error, "pull loop crashed");
            }
            other => panic!("expected AgentFailed, got {other:?}"),
        }
        {
            let state = slot.state.lock().await;
            let agent = state.agent.as_ref().unwrap();
            assert!(!agent.is_alive().await);
            assert_eq!(agent.status().await.state, AgentState::Deactivated);
        }

        publisher.produce(&stream(), 7).await.unwrap();

        let replacement = publisher.agents.snapshot(&stream()).await.unwrap();
        assert_ne!(replacement.id, crashed);
        assert!(matches!(
            events.try_recv(),
            Ok(StreamEvent::AgentActivated { agent, .. }) if agent == replacement.id
        ));
        let delivery = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap();
        assert!(matches!(delivery, Some(Delivery::Item(i)) if i.payload == 7));
    }

    #[tokio::test(start_paused = true)]
    async fn produce_after_close_is_rejected_without_spawning() {
        let publisher = publisher();
        publisher.agents.stop_all(DeactivationReason::Shutdown).await;

        assert!(matches!(
            publisher.produce(&stream(), 1).await,
            Err(StreamError::ShutDown)
        ));
        assert!(matches!(
            publisher.produce_batch(&stream(), vec![2]).await,
            Err(StreamError::ShutDown)
        ));
        assert!(publisher.agents.snapshot(&stream()).await.is_none());
        assert_eq!(publisher.cache.len(&stream()).await, 0);
    }
}
