//! Per-stream agent slots
//!
//! Each stream has one slot holding its (optional) agent and its pending-work
//! counter. The slot's mutex serializes "append and make sure an agent is
//! running" in the publisher with "retire the idle agent" in the monitor, so a
//! produce can never land between the monitor's idle check and the teardown.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

use super::{AgentContext, AgentHandle, AgentId, AgentStatus, PendingWork};
use crate::events::{DeactivationReason, StreamEvent};
use crate::restart::RestartPolicy;
use pullstream_cache::StreamId;

/// Mutable part of a slot, guarded by the slot mutex
#[derive(Default)]
pub(crate) struct SlotState {
    pub(crate) agent: Option<AgentHandle>,
    pub(crate) restart: RestartPolicy,
}

pub(crate) struct StreamSlot {
    pub(crate) state: Mutex<SlotState>,
    pub(crate) pending: Arc<PendingWork>,
}

impl StreamSlot {
    fn new() -> Self {
        Self {
            state: Mutex::new(SlotState::default()),
            pending: Arc::new(PendingWork::new()),
        }
    }
}

/// All agent slots of a provider
pub(crate) struct AgentDirectory<P> {
    pub(crate) ctx: AgentContext<P>,
    slots: RwLock<HashMap<StreamId, Arc<StreamSlot>>>,
    /// Set by `stop_all`; no agent is spawned afterwards
    closed: AtomicBool,
}

impl<P> AgentDirectory<P>
where
    P: Send + Sync + 'static,
{
    pub(crate) fn new(ctx: AgentContext<P>) -> Self {
        Self {
            ctx,
            slots: RwLock::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Whether `stop_all` has run. Checked under a slot lock, this tells a
    /// producer that no agent will ever pick its item up.
    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Get the slot for `stream`, creating it if needed
    pub(crate) async fn slot(&self, stream: &StreamId) -> Arc<StreamSlot> {
        if let Some(slot) = self.slots.read().await.get(stream) {
            return Arc::clone(slot);
        }
        let mut slots = self.slots.write().await;
        Arc::clone(
            slots
                .entry(stream.clone())
                .or_insert_with(|| Arc::new(StreamSlot::new())),
        )
    }

    async fn existing_slot(&self, stream: &StreamId) -> Option<Arc<StreamSlot>> {
        self.slots.read().await.get(stream).cloned()
    }

    /// Snapshot of every slot
    pub(crate) async fn slots(&self) -> Vec<(StreamId, Arc<StreamSlot>)> {
        self.slots
            .read()
            .await
            .iter()
            .map(|(id, slot)| (id.clone(), Arc::clone(slot)))
            .collect()
    }

    /// Make sure a live agent runs for `stream`. Caller holds the slot lock.
    ///
    /// A new agent gets a pending-work request recorded before it is spawned,
    /// so its first iteration resumes every subscriber from its cursor.
    /// Returns `None` once the directory is closed.
    pub(crate) async fn ensure_active(
        &self,
        stream: &StreamId,
        slot: &StreamSlot,
        state: &mut SlotState,
    ) -> Option<AgentId> {
        if self.is_closed() {
            return None;
        }
        if let Some(agent) = &state.agent
            && agent.is_alive().await
        {
            return Some(agent.id());
        }

        if let Some(old) = state.agent.take() {
            debug!(stream = %stream, agent = %old.id(), "replacing retired agent");
        }

        slot.pending.signal();
        let handle = AgentHandle::spawn(stream.clone(), self.ctx.clone(), Arc::clone(&slot.pending));
        let id = handle.id();
        info!(stream = %stream, agent = %id, "agent activated");
        self.ctx.events.emit(StreamEvent::AgentActivated {
            stream: stream.clone(),
            agent: id,
        });

        state.restart.cancel_scheduled();
        state.agent = Some(handle);
        Some(id)
    }

    /// Ensure an agent runs and ask it for a pull pass
    pub(crate) async fn activate(&self, stream: &StreamId) -> Option<AgentId> {
        let slot = self.slot(stream).await;
        let mut state = slot.state.lock().await;
        let id = self.ensure_active(stream, &slot, &mut state).await;
        slot.pending.signal();
        id
    }

    /// Stop the agent in a locked slot and report why
    pub(crate) async fn retire(
        &self,
        stream: &StreamId,
        state: &mut SlotState,
        reason: DeactivationReason,
    ) -> Option<AgentId> {
        let agent = state.agent.take()?;
        let id = agent.id();
        agent.stop().await;

        info!(stream = %stream, agent = %id, ?reason, "agent deactivated");
        self.ctx.events.emit(StreamEvent::AgentDeactivated {
            stream: stream.clone(),
            agent: id,
            reason,
        });
        Some(id)
    }

    /// Tear the agent down if the stream has no subscribers left.
    ///
    /// The count is re-checked under the slot lock, so a subscribe racing with
    /// the last unsubscribe keeps its agent.
    pub(crate) async fn deactivate_if_unsubscribed(&self, stream: &StreamId) -> bool {
        let Some(slot) = self.existing_slot(stream).await else {
            return false;
        };
        let mut state = slot.state.lock().await;
        if self.ctx.registry.subscriber_count(stream).await > 0 {
            return false;
        }

        // Nobody is left to deliver to
        slot.pending.complete(slot.pending.ticket());
        self.retire(stream, &mut state, DeactivationReason::NoSubscribers)
            .await
            .is_some()
    }

    /// Status of the stream's agent, if one exists
    pub(crate) async fn snapshot(&self, stream: &StreamId) -> Option<AgentStatus> {
        let slot = self.existing_slot(stream).await?;
        let state = slot.state.lock().await;
        match &state.agent {
            Some(agent) => Some(agent.status().await),
            None => None,
        }
    }

    pub(crate) async fn has_pending(&self, stream: &StreamId) -> bool {
        match self.existing_slot(stream).await {
            Some(slot) => slot.pending.has_pending(),
            None => false,
        }
    }

    /// Drop slots nobody uses. Returns how many were removed.
    pub(crate) async fn prune(&self) -> usize {
        let mut slots = self.slots.write().await;
        let before = slots.len();
        slots.retain(|_, slot| {
            if Arc::strong_count(slot) > 1 || slot.pending.has_pending() {
                return true;
            }
            match slot.state.try_lock() {
                Ok(state) => state.agent.is_some() || state.restart.is_scheduled(),
                Err(_) => true,
            }
        });
        before - slots.len()
    }

    /// Close the directory and stop every agent.
    ///
    /// The flag is raised before any slot is visited, so a producer that
    /// takes a slot lock after its slot was handled here sees it closed.
    pub(crate) async fn stop_all(&self, reason: DeactivationReason) -> usize {
        self.closed.store(true, Ordering::SeqCst);
        let mut stopped = 0;
        for (stream, slot) in self.slots().await {
            let mut state = slot.state.lock().await;
            if self.retire(&stream, &mut state, reason).await.is_some() {
                stopped += 1;
            }
        }
        stopped
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::agent::AgentState;
    use crate::agent::test_support::tokio_context;
    use crate::registry::ConsumerId;
    use crate::sink::LoggingSink;
    use pullstream_cache::CacheConfig;

    fn stream() -> StreamId {
        StreamId::new("ns-1", uuid::Uuid::nil())
    }

    fn directory() -> AgentDirectory<u32> {
        AgentDirectory::new(tokio_context(CacheConfig::default()))
    }

    #[tokio::test(start_paused = true)]
    async fn activate_starts_one_agent_per_stream() {
        let agents = directory();
        let mut events = agents.ctx.events.subscribe();

        let first = agents.activate(&stream()).await.unwrap();
        let second = agents.activate(&stream()).await.unwrap();

        assert_eq!(first, second);
        assert!(matches!(
            events.try_recv(),
            Ok(StreamEvent::AgentActivated { agent, .. }) if agent == first
        ));
        assert!(events.try_recv().is_err());
        assert_eq!(
            agents.snapshot(&stream()).await.map(|s| s.state),
            Some(AgentState::Active)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn retired_agent_is_replaced_with_new_id() {
        let agents = directory();
        let first = agents.activate(&stream()).await;

        let slot = agents.slot(&stream()).await;
        {
            let mut state = slot.state.lock().await;
            agents
                .retire(&stream(), &mut state, DeactivationReason::Inactive)
                .await;
        }
        let second = agents.activate(&stream()).await;

        assert_ne!(first, second);
    }

    #[tokio::test(start_paused = true)]
    async fn subscribed_stream_keeps_its_agent() {
        let agents = directory();
        agents
            .ctx
            .registry
            .subscribe(
                &stream(),
                ConsumerId::from("c"),
                Arc::new(LoggingSink::new("c")),
                None,
            )
            .await;
        agents.activate(&stream()).await;

        assert!(!agents.deactivate_if_unsubscribed(&stream()).await);
        assert!(agents.snapshot(&stream()).await.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn unsubscribed_stream_loses_agent_and_slot() {
        let agents = directory();
        agents.activate(&stream()).await;

        assert!(agents.deactivate_if_unsubscribed(&stream()).await);
        assert!(agents.snapshot(&stream()).await.is_none());
        assert!(!agents.has_pending(&stream()).await);
        assert_eq!(agents.prune().await, 1);
        assert!(agents.slots().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn prune_keeps_slots_in_use() {
        let agents = directory();
        agents.activate(&stream()).await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(agents.prune().await, 0);

        let held = agents.slot(&StreamId::new("ns-2", uuid::Uuid::nil())).await;
        assert_eq!(agents.prune().await, 0);
        drop(held);
        assert_eq!(agents.prune().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_all_reports_shutdown() {
        let agents = directory();
        agents.activate(&stream()).await;
        agents
            .activate(&StreamId::new("ns-2", uuid::Uuid::nil()))
            .await;
        let mut events = agents.ctx.events.subscribe();

        assert_eq!(agents.stop_all(DeactivationReason::Shutdown).await, 2);
        for _ in 0..2 {
            assert!(matches!(
                events.try_recv(),
                Ok(StreamEvent::AgentDeactivated {
                    reason: DeactivationReason::Shutdown,
                    ..
                })
            ));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn closed_directory_spawns_nothing() {
        let agents = directory();
        agents.stop_all(DeactivationReason::Shutdown).await;

        assert!(agents.is_closed());
        assert_eq!(agents.activate(&stream()).await, None);
        assert!(agents.snapshot(&stream()).await.is_none());
    }
}
