//! Inactivity monitor
//!
//! Periodically retires agents that went idle, brings back agents that died
//! with work still pending, and drops slots nobody needs any more.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::agent::{AgentDirectory, AgentState, SlotState, StreamSlot};
use crate::events::DeactivationReason;
use crate::restart::RestartDecision;
use pullstream_cache::StreamId;

/// What one sweep did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Idle agents torn down
    pub deactivated: usize,
    /// Failed agents re-created
    pub restarted: usize,
    /// Unused slots dropped
    pub pruned: usize,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

pub struct InactivityMonitor<P> {
    agents: Arc<AgentDirectory<P>>,
    poll_interval: Duration,
}

impl<P> InactivityMonitor<P>
where
    P: Send + Sync + 'static,
{
    pub(crate) fn new(agents: Arc<AgentDirectory<P>>, poll_interval: Duration) -> Self {
        Self {
            agents,
            poll_interval,
        }
    }

    /// Sweep on every poll tick until cancelled
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // First tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let report = self.sweep().await;
                    if !report.is_empty() {
                        debug!(?report, "inactivity sweep");
                    }
                }
            }
        }
    }

    /// Check every slot once
    pub async fn sweep(&self) -> SweepReport {
        let mut report = SweepReport::default();

        for (stream, slot) in self.agents.slots().await {
            let mut state = slot.state.lock().await;
            self.check_slot(&stream, &slot, &mut state, &mut report)
                .await;
        }

        report.pruned = self.agents.prune().await;
        report
    }

    async fn check_slot(
        &self,
        stream: &StreamId,
        slot: &StreamSlot,
        state: &mut SlotState,
        report: &mut SweepReport,
    ) {
        let ctx = &self.agents.ctx;
        let now = ctx.clock.now();

        if let Some(agent) = &state.agent {
            // Pending is read before status: an agent clears pending work only
            // after it has published the state that work put it in.
            let pending = slot.pending.has_pending();
            let alive = agent.is_alive().await;
            let status = agent.status().await;

            if alive {
                if status.state == AgentState::Idle
                    && !pending
                    && status.idle_for(now) >= ctx.config.stream_inactivity_period
                {
                    self.agents
                        .retire(stream, state, DeactivationReason::Inactive)
                        .await;
                    state.restart.reset();
                    report.deactivated += 1;
                }
                return;
            }

            // Finished on its own, which only happens on a panic
            debug!(stream = %stream, agent = %status.id, "removing failed agent");
            state.agent = None;
        }

        if !slot.pending.has_pending() || ctx.registry.subscriber_count(stream).await == 0 {
            return;
        }

        match state.restart.poll(now) {
            RestartDecision::Restart => {
                if self.agents.ensure_active(stream, slot, state).await.is_some() {
                    info!(stream = %stream, "restarted failed agent");
                    report.restarted += 1;
                }
            }
            RestartDecision::Backoff { until } => {
                debug!(stream = %stream, wait = ?until.saturating_duration_since(now), "agent restart backing off");
            }
            RestartDecision::Exhausted { newly } => {
                if newly {
                    warn!(stream = %stream, "agent restart limit reached, waiting for the next produce");
                }
            }
        }
    }
}
