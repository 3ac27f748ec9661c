//! The agent's pull loop

use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::FutureExt;
use tokio::sync::RwLock;
use tokio::task::{JoinError, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::delivery::{DeliveryOutcome, deliver_batch};
use super::{AgentContext, AgentId, AgentState, AgentStatus, PendingWork, panic_message};
use crate::events::StreamEvent;
use crate::registry::{ConsumerId, FailureVerdict};
use pullstream_cache::StreamId;

/// Why the loop woke up
enum Wake {
    Cancelled,
    Finished(Result<DeliveryOutcome, JoinError>),
    Signalled,
    Tick,
}

pub(super) struct PullLoop<P> {
    stream: StreamId,
    id: AgentId,
    ctx: AgentContext<P>,
    pending: Arc<PendingWork>,
    status: Arc<RwLock<AgentStatus>>,
    cancel: CancellationToken,
    tasks: JoinSet<DeliveryOutcome>,
    in_flight: HashSet<ConsumerId>,
    retry_at: HashMap<ConsumerId, Instant>,
}

impl<P> PullLoop<P>
where
    P: Send + Sync + 'static,
{
    pub(super) fn new(
        stream: StreamId,
        id: AgentId,
        ctx: AgentContext<P>,
        pending: Arc<PendingWork>,
        status: Arc<RwLock<AgentStatus>>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            stream,
            id,
            ctx,
            pending,
            status,
            cancel,
            tasks: JoinSet::new(),
            in_flight: HashSet::new(),
            retry_at: HashMap::new(),
        }
    }

    pub(super) async fn run(mut self) {
        debug!(stream = %self.stream, agent = %self.id, "pull loop started");

        loop {
            // The ticket must be taken before dispatch reads the high-water
            // mark, or a concurrent append could be marked served unseen.
            let ticket = self.pending.ticket();
            self.dispatch().await;
            self.pending.complete(ticket);
            self.refresh_status().await;

            match self.wait().await {
                Wake::Cancelled => break,
                Wake::Finished(joined) => self.record(joined).await,
                Wake::Signalled | Wake::Tick => {}
            }
        }

        self.drain().await;
        debug!(stream = %self.stream, agent = %self.id, "pull loop stopped");
    }

    async fn wait(&mut self) -> Wake {
        let interval = self.ctx.config.pull_interval;
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Wake::Cancelled,
            Some(joined) = self.tasks.join_next(), if !self.tasks.is_empty() => Wake::Finished(joined),
            _ = self.pending.notified() => Wake::Signalled,
            _ = tokio::time::sleep(interval) => Wake::Tick,
        }
    }

    /// Start a delivery task for every subscriber that is behind and free.
    async fn dispatch(&mut self) {
        let high_water = self.ctx.cache.high_water_mark(&self.stream).await;
        let now = self.ctx.clock.now();
        self.retry_at.retain(|_, at| *at > now);

        let mut caught_up = true;
        let mut spawned = 0;
        for subscriber in self.ctx.registry.deliverable(&self.stream).await {
            if subscriber.subscription.next_token() >= high_water {
                continue;
            }
            caught_up = false;

            let consumer = subscriber.subscription.consumer.clone();
            if self.in_flight.contains(&consumer) || self.retry_at.contains_key(&consumer) {
                continue;
            }

            self.in_flight.insert(consumer.clone());
            let task = deliver_batch(self.stream.clone(), subscriber, self.ctx.clone());
            self.tasks.spawn(async move {
                match AssertUnwindSafe(task).catch_unwind().await {
                    Ok(outcome) => outcome,
                    Err(panic) => DeliveryOutcome::Failed {
                        consumer,
                        delivered: 0,
                        error: format!("sink panicked: {}", panic_message(panic.as_ref())),
                    },
                }
            });
            spawned += 1;
        }

        let mut status = self.status.write().await;
        status.in_flight = self.in_flight.len();
        status.caught_up = caught_up;
        if spawned > 0 || !caught_up {
            status.transition(AgentState::Active);
        }
        if spawned > 0 {
            debug!(stream = %self.stream, agent = %self.id, spawned, %high_water, "dispatched deliveries");
        }
    }

    /// Go `Idle` once quiet for the inactivity period.
    async fn refresh_status(&mut self) {
        let now = self.ctx.clock.now();
        let mut status = self.status.write().await;

        let quiet = status.caught_up && self.in_flight.is_empty() && !self.pending.has_pending();
        if status.state == AgentState::Active
            && quiet
            && status.idle_for(now) >= self.ctx.config.stream_inactivity_period
            && status.transition(AgentState::Idle)
        {
            self.ctx.events.emit(StreamEvent::AgentIdle {
                stream: self.stream.clone(),
                agent: self.id,
            });
        }
    }

    async fn record(&mut self, joined: Result<DeliveryOutcome, JoinError>) {
        let outcome = match joined {
            Ok(outcome) => outcome,
            Err(err) => {
                // Tasks are only aborted while draining
                warn!(stream = %self.stream, agent = %self.id, "delivery task lost: {}", err);
                return;
            }
        };

        self.in_flight.remove(outcome.consumer());
        let now = self.ctx.clock.now();
        {
            let mut status = self.status.write().await;
            status.in_flight = self.in_flight.len();
            if outcome.delivered() > 0 {
                status.last_activity = now;
            }
        }

        let DeliveryOutcome::Failed {
            consumer, error, ..
        } = outcome
        else {
            return;
        };

        let verdict = self
            .ctx
            .registry
            .record_failure(&self.stream, &consumer, self.ctx.config.max_delivery_attempts)
            .await;
        match verdict {
            Ok(FailureVerdict::Retry { attempts }) => {
                debug!(
                    stream = %self.stream,
                    consumer = %consumer,
                    attempts,
                    "push failed, retrying: {}",
                    error
                );
                self.retry_at
                    .insert(consumer, now + self.ctx.config.pull_interval);
            }
            Ok(FailureVerdict::Degraded { attempts }) => {
                warn!(
                    stream = %self.stream,
                    consumer = %consumer,
                    attempts,
                    "subscription degraded after repeated push failures: {}",
                    error
                );
                self.ctx.events.emit(StreamEvent::SubscriptionDegraded {
                    stream: self.stream.clone(),
                    consumer,
                    attempts,
                });
            }
            // Unsubscribed while the push was failing
            Err(_) => {}
        }
    }

    /// Let in-flight deliveries finish within the shutdown grace, then abort.
    async fn drain(&mut self) {
        if self.tasks.is_empty() {
            return;
        }

        let grace = self.ctx.config.shutdown_grace;
        let tasks = &mut self.tasks;
        let done = async { while tasks.join_next().await.is_some() {} };

        if tokio::time::timeout(grace, done).await.is_err() {
            warn!(
                stream = %self.stream,
                agent = %self.id,
                remaining = self.tasks.len(),
                ?grace,
                "in-flight deliveries exceeded shutdown grace, aborting"
            );
            self.tasks.abort_all();
            while self.tasks.join_next().await.is_some() {}
        }
    }
}
