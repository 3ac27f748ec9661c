//! Lifecycle events for operators
//!
//! Every provider owns one broadcast channel. Events are best-effort: with no
//! receivers, or with a lagging receiver, they are dropped rather than
//! applying back-pressure to delivery.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::agent::AgentId;
use crate::registry::ConsumerId;
use pullstream_cache::{SequenceToken, StreamId};

/// Why an agent was torn down
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeactivationReason {
    /// Idle past the stream inactivity period
    Inactive,
    /// The last subscriber left the stream
    NoSubscribers,
    /// The provider is shutting down
    Shutdown,
}

/// A subscriber's cursor was below the cache's low-water mark and got moved
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryGap {
    pub stream: StreamId,
    pub consumer: ConsumerId,
    /// Position the subscriber asked for
    pub requested: SequenceToken,
    /// Position delivery resumes from
    pub resumed_at: SequenceToken,
}

impl DeliveryGap {
    /// Number of items the subscriber will never see.
    pub fn skipped(&self) -> u64 {
        self.requested.distance_to(self.resumed_at)
    }
}

/// Events emitted by the delivery engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    AgentActivated {
        stream: StreamId,
        agent: AgentId,
    },
    AgentIdle {
        stream: StreamId,
        agent: AgentId,
    },
    AgentDeactivated {
        stream: StreamId,
        agent: AgentId,
        reason: DeactivationReason,
    },
    /// The agent task panicked
    AgentFailed {
        stream: StreamId,
        agent: AgentId,
        error: String,
    },
    DeliveryGap(DeliveryGap),
    /// Push retries were exhausted; delivery to this consumer is paused
    SubscriptionDegraded {
        stream: StreamId,
        consumer: ConsumerId,
        attempts: u32,
    },
}

/// Sending half of the event channel, cloned into every component
#[derive(Debug, Clone)]
pub(crate) struct EventEmitter {
    tx: broadcast::Sender<StreamEvent>,
}

impl EventEmitter {
    pub(crate) fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub(crate) fn emit(&self, event: StreamEvent) {
        // No receivers is fine
        let _ = self.tx.send(event);
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<StreamEvent> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stream() -> StreamId {
        StreamId::new("ns-1", uuid::Uuid::nil())
    }

    #[test]
    fn gap_counts_skipped_items() {
        let gap = DeliveryGap {
            stream: stream(),
            consumer: ConsumerId::from("c"),
            requested: SequenceToken(2),
            resumed_at: SequenceToken(7),
        };
        assert_eq!(gap.skipped(), 5);
    }

    #[test]
    fn emit_without_receivers_is_ignored() {
        let emitter = EventEmitter::new(4);
        emitter.emit(StreamEvent::AgentIdle {
            stream: stream(),
            agent: AgentId::new(),
        });
    }

    #[tokio::test]
    async fn receivers_get_emitted_events() {
        let emitter = EventEmitter::new(4);
        let mut rx = emitter.subscribe();
        let agent = AgentId::new();

        emitter.emit(StreamEvent::AgentActivated {
            stream: stream(),
            agent,
        });

        let event = rx.recv().await.unwrap();
        assert_eq!(
            event,
            StreamEvent::AgentActivated {
                stream: stream(),
                agent
            }
        );
    }

    #[test]
    fn events_serialize_with_type_tag() {
        let event = StreamEvent::AgentDeactivated {
            stream: stream(),
            agent: AgentId::new(),
            reason: DeactivationReason::Inactive,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "agent_deactivated");
        assert_eq!(json["reason"], "inactive");
    }
}
