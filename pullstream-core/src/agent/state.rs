//! Agent identity and lifecycle state

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

/// Identifies one agent instance. A re-created agent gets a new id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AgentId(pub Uuid);

impl AgentId {
    /// Create a new agent ID using UUID v7 (time-ordered)
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for AgentId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for AgentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle of a delivery agent
///
/// ```text
/// Uninitialized ──► Active ◄──► Idle
///        │            │          │
///        └────────────┴──────────┴──► Deactivated
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    Uninitialized,
    Active,
    Idle,
    /// Terminal; only a fresh agent can deliver again
    Deactivated,
}

impl AgentState {
    pub fn can_transition_to(self, next: AgentState) -> bool {
        use AgentState::*;
        matches!(
            (self, next),
            (Uninitialized, Active)
                | (Active, Idle)
                | (Idle, Active)
                | (Uninitialized | Active | Idle, Deactivated)
        )
    }
}

/// Shared, observable status of one running agent
#[derive(Debug, Clone)]
pub struct AgentStatus {
    pub id: AgentId,
    pub state: AgentState,
    pub created_at: Instant,
    /// Time of the last successful push, or creation
    pub last_activity: Instant,
    pub in_flight: usize,
    /// Every deliverable subscriber had reached the high-water mark at the last check
    pub caught_up: bool,
}

impl AgentStatus {
    pub(crate) fn new(id: AgentId, now: Instant) -> Self {
        Self {
            id,
            state: AgentState::Uninitialized,
            created_at: now,
            last_activity: now,
            in_flight: 0,
            caught_up: true,
        }
    }

    /// Move to `next` if the lifecycle allows it. Returns whether it moved.
    pub(crate) fn transition(&mut self, next: AgentState) -> bool {
        if self.state == next || !self.state.can_transition_to(next) {
            return false;
        }
        debug!(agent = %self.id, "Agent state: {:?} -> {:?}", self.state, next);
        self.state = next;
        true
    }

    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_activity)
    }
}
