//! Pulling delivery agents
//!
//! One agent runs per active stream. It pulls from the cache at each
//! subscriber's cursor and pushes to the subscriber's sink, one delivery task
//! per subscriber so a slow consumer never holds up the others. Agents are
//! disposable: cursors live in the registry and pending work in the stream's
//! [`PendingWork`] counter, so a fresh agent picks up exactly where a retired
//! or crashed one stopped.

mod delivery;
mod directory;
mod pending;
mod state;
mod worker;

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::FutureExt;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::error;

use crate::config::AgentConfig;
use crate::events::{EventEmitter, StreamEvent};
use crate::registry::SubscriptionRegistry;
use pullstream_cache::{Clock, EventCache, StreamId};

pub(crate) use directory::{AgentDirectory, SlotState, StreamSlot};
pub(crate) use pending::PendingWork;
pub use state::{AgentId, AgentState, AgentStatus};

use worker::PullLoop;

/// Collaborators shared by every agent of a provider
pub(crate) struct AgentContext<P> {
    pub(crate) cache: Arc<EventCache<P>>,
    pub(crate) registry: Arc<SubscriptionRegistry<P>>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) config: AgentConfig,
    pub(crate) events: EventEmitter,
}

impl<P> Clone for AgentContext<P> {
    fn clone(&self) -> Self {
        Self {
            cache: Arc::clone(&self.cache),
            registry: Arc::clone(&self.registry),
            clock: Arc::clone(&self.clock),
            config: self.config.clone(),
            events: self.events.clone(),
        }
    }
}

/// Owner's handle to one running agent task
pub(crate) struct AgentHandle {
    id: AgentId,
    status: Arc<RwLock<AgentStatus>>,
    cancel: CancellationToken,
    join: JoinHandle<()>,
}

impl AgentHandle {
    /// Start a new agent for `stream`. It comes up `Active`.
    pub(crate) fn spawn<P>(
        stream: StreamId,
        ctx: AgentContext<P>,
        pending: Arc<PendingWork>,
    ) -> Self
    where
        P: Send + Sync + 'static,
    {
        let id = AgentId::new();
        let mut status = AgentStatus::new(id, ctx.clock.now());
        status.transition(AgentState::Active);
        let status = Arc::new(RwLock::new(status));
        let cancel = CancellationToken::new();
        let events = ctx.events.clone();

        let worker = PullLoop::new(
            stream.clone(),
            id,
            ctx,
            pending,
            Arc::clone(&status),
            cancel.clone(),
        );
        let join = spawn_supervised(stream, id, Arc::clone(&status), events, worker.run());

        Self {
            id,
            status,
            cancel,
            join,
        }
    }

    /// An agent whose task panics right after it starts
    #[cfg(test)]
    pub(crate) fn spawn_panicking<P>(stream: StreamId, ctx: &AgentContext<P>, message: &'static str) -> Self {
        let id = AgentId::new();
        let mut status = AgentStatus::new(id, ctx.clock.now());
        status.transition(AgentState::Active);
        let status = Arc::new(RwLock::new(status));

        async fn crash(message: &'static str) {
            tokio::task::yield_now().await;
            panic!("{message}")
        }

        let join = spawn_supervised(stream, id, Arc::clone(&status), ctx.events.clone(), crash(message));

        Self {
            id,
            status,
            cancel: CancellationToken::new(),
            join,
        }
    }

    pub(crate) fn id(&self) -> AgentId {
        self.id
    }

    pub(crate) async fn status(&self) -> AgentStatus {
        self.status.read().await.clone()
    }

    /// Whether the task is still running and has not been retired
    pub(crate) async fn is_alive(&self) -> bool {
        !self.join.is_finished() && self.status.read().await.state != AgentState::Deactivated
    }

    /// Cancel the agent and wait for it to drain
    pub(crate) async fn stop(self) {
        self.cancel.cancel();
        // Panics are already caught and reported by the supervisor
        let _ = self.join.await;
    }
}

/// Run an agent future, marking it `Deactivated` however it ends and
/// reporting a panic as `AgentFailed`.
fn spawn_supervised<F>(
    stream: StreamId,
    id: AgentId,
    status: Arc<RwLock<AgentStatus>>,
    events: EventEmitter,
    fut: F,
) -> JoinHandle<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let result = AssertUnwindSafe(fut).catch_unwind().await;

        status.write().await.transition(AgentState::Deactivated);

        if let Err(panic) = result {
            let message = panic_message(panic.as_ref());
            error!(stream = %stream, agent = %id, "agent panicked: {}", message);
            events.emit(StreamEvent::AgentFailed {
                stream,
                agent: id,
                error: message,
            });
        }
    })
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&'static str>() {
        (*msg).to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}
