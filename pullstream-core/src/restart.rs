//! Restart budget for agents that failed with work outstanding
//!
//! The policy is polled once per monitor sweep. It owns the whole schedule:
//! how many re-creations the current window still allows, how long to back
//! off after consecutive failures, and when a scheduled re-creation is due.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;

/// What the monitor should do about a failed agent right now
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartDecision {
    /// Re-create the agent now
    Restart,
    /// Backing off; re-create once `until` has passed
    Backoff { until: Instant },
    /// The window's budget is used up. `newly` is only set on the poll that
    /// hit the limit, so callers can report it once.
    Exhausted { newly: bool },
}

/// Rate limit for re-creating failed agents
#[derive(Debug)]
pub struct RestartPolicy {
    budget: usize,
    window: Duration,
    /// Re-creations granted inside the current window, oldest first
    granted: VecDeque<Instant>,
    /// Consecutive failures since the last clean retirement
    failures: u32,
    due: Option<Instant>,
    exhausted: bool,
}

/// Delay before the re-creation following `failures` earlier ones
fn backoff(failures: u32) -> Duration {
    match failures {
        0 => Duration::ZERO,
        1 => Duration::from_secs(1),
        2 => Duration::from_secs(5),
        3 => Duration::from_secs(15),
        _ => Duration::from_secs(30),
    }
}

impl RestartPolicy {
    /// Allow `budget` re-creations per `window`
    pub fn new(budget: usize, window: Duration) -> Self {
        Self {
            budget,
            window,
            granted: VecDeque::new(),
            failures: 0,
            due: None,
            exhausted: false,
        }
    }

    /// Decide at `now` whether a failed agent may come back
    pub fn poll(&mut self, now: Instant) -> RestartDecision {
        if let Some(until) = self.due {
            if now < until {
                return RestartDecision::Backoff { until };
            }
            self.due = None;
            return RestartDecision::Restart;
        }

        while let Some(oldest) = self.granted.front()
            && now.saturating_duration_since(*oldest) >= self.window
        {
            self.granted.pop_front();
        }

        if self.granted.len() >= self.budget {
            let newly = !self.exhausted;
            self.exhausted = true;
            return RestartDecision::Exhausted { newly };
        }

        self.exhausted = false;
        let delay = backoff(self.failures);
        self.failures = self.failures.saturating_add(1);
        self.granted.push_back(now);

        if delay.is_zero() {
            RestartDecision::Restart
        } else {
            let until = now + delay;
            self.due = Some(until);
            RestartDecision::Backoff { until }
        }
    }

    /// Drop a scheduled re-creation, e.g. because a produce already brought
    /// the agent back. The failure count is kept.
    pub fn cancel_scheduled(&mut self) {
        self.due = None;
    }

    /// Whether a re-creation is waiting for its backoff to pass
    pub fn is_scheduled(&self) -> bool {
        self.due.is_some()
    }

    /// Forget past failures once an agent retired cleanly
    pub fn reset(&mut self) {
        self.granted.clear();
        self.failures = 0;
        self.due = None;
        self.exhausted = false;
    }
}

impl Default for RestartPolicy {
    /// Five re-creations per minute
    fn default() -> Self {
        Self::new(5, Duration::from_secs(60))
    }
}
