//! Engine event bus.
//!
//! Pub/sub over a Tokio broadcast channel. The tool registry publishes
//! evolution requests; the orchestrator and background optimizer
//! subscribe. Publishing never blocks and never fails on a quiet bus.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

const CHANNEL_CAPACITY: usize = 256;

/// Shared reference to the event bus.
pub type SharedEventBus = Arc<EventBus>;

/// Engine-level events.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EngineEvent {
    /// A tool fell below usable fitness; a background evolution job may
    /// generate a replacement constrained by its interface.
    EvolutionRequested {
        namespace: String,
        tool_id: String,
        reason: String,
        at: DateTime<Utc>,
    },
    /// A namespace head swap completed.
    ArtifactPromoted {
        namespace: String,
        artifact_id: String,
        previous: Option<String>,
        at: DateTime<Utc>,
    },
    /// Persistence failed; the store is serving memory-only.
    StorageDegraded { detail: String, at: DateTime<Utc> },
    /// A request was cancelled (deadline or user interrupt).
    RequestCancelled { request_id: String, at: DateTime<Utc> },
}

impl EngineEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::EvolutionRequested { .. } => "evolution_requested",
            Self::ArtifactPromoted { .. } => "artifact_promoted",
            Self::StorageDegraded { .. } => "storage_degraded",
            Self::RequestCancelled { .. } => "request_cancelled",
        }
    }
}

/// Broadcast event bus.
pub struct EventBus {
    sender: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { sender }
    }

    pub fn shared(self) -> SharedEventBus {
        Arc::new(self)
    }

    /// Publish to all subscribers. No receivers is fine.
    pub fn publish(&self, event: EngineEvent) {
        let event_type = event.event_type();
        match self.sender.send(event) {
            Ok(count) => debug!(event_type, receivers = count, "event published"),
            Err(_) => debug!(event_type, "event published (no receivers)"),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_and_receive() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.publish(EngineEvent::StorageDegraded {
            detail: "disk full".into(),
            at: Utc::now(),
        });

        let event = rx.recv().await.unwrap();
        assert_eq!(event.event_type(), "storage_degraded");
    }

    #[test]
    fn test_publish_without_receivers_is_ok() {
        let bus = EventBus::new();
        bus.publish(EngineEvent::RequestCancelled {
            request_id: "req-1".into(),
            at: Utc::now(),
        });
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_multiple_subscribers() {
        let bus = EventBus::new();
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();
        bus.publish(EngineEvent::EvolutionRequested {
            namespace: "translator".into(),
            tool_id: "tool-1".into(),
            reason: "quality below 0.5".into(),
            at: Utc::now(),
        });
        assert_eq!(a.recv().await.unwrap().event_type(), "evolution_requested");
        assert_eq!(b.recv().await.unwrap().event_type(), "evolution_requested");
    }
}
