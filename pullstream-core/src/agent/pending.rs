//! Per-stream pending-work counter
//!
//! Producers bump `requested` after their append is visible in the cache. A
//! pull iteration takes a ticket (the current `requested`) *before* it reads
//! the cache's high-water mark, and only raises `served` to that ticket once
//! it has dispatched reads. Any request the ticket missed keeps
//! `requested > served`, so another iteration is owed, whichever agent
//! instance ends up running it. The `Notify` permit only shortens the wait;
//! correctness never depends on a wake being observed.

use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::Notify;

#[derive(Debug, Default)]
pub(crate) struct PendingWork {
    requested: AtomicU64,
    served: AtomicU64,
    notify: Notify,
}

impl PendingWork {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Record that new data may be available and wake the agent.
    pub(crate) fn signal(&self) {
        self.requested.fetch_add(1, Ordering::SeqCst);
        self.notify.notify_one();
    }

    /// Snapshot of requests an iteration starting now will cover.
    pub(crate) fn ticket(&self) -> u64 {
        self.requested.load(Ordering::SeqCst)
    }

    /// Mark every request up to `ticket` as served.
    pub(crate) fn complete(&self, ticket: u64) {
        self.served.fetch_max(ticket, Ordering::SeqCst);
    }

    pub(crate) fn has_pending(&self) -> bool {
        self.requested.load(Ordering::SeqCst) > self.served.load(Ordering::SeqCst)
    }

    pub(crate) async fn notified(&self) {
        self.notify.notified().await;
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn signal_creates_pending_work() {
        let pending = PendingWork::new();
        assert!(!pending.has_pending());

        pending.signal();
        assert!(pending.has_pending());
    }

    #[test]
    fn completing_a_ticket_clears_only_what_it_saw() {
        let pending = PendingWork::new();
        pending.signal();
        let ticket = pending.ticket();

        // Arrives after the iteration took its ticket
        pending.signal();
        pending.complete(ticket);
        assert!(pending.has_pending());

        pending.complete(pending.ticket());
        assert!(!pending.has_pending());
    }

    #[test]
    fn stale_ticket_never_lowers_served() {
        let pending = PendingWork::new();
        pending.signal();
        pending.signal();
        let old = 1;
        pending.complete(pending.ticket());
        pending.complete(old);
        assert!(!pending.has_pending());
    }

    #[tokio::test]
    async fn signal_before_wait_is_not_lost() {
        let pending = PendingWork::new();
        pending.signal();

        let woke = tokio::time::timeout(Duration::from_millis(50), pending.notified()).await;
        assert!(woke.is_ok());
    }
}
