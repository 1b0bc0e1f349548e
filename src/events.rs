//! Event bus for pipeline state notifications
//!
//! Session-level state changes are surfaced to the caller as events with a
//! single human-readable status string each; per-sample drops never appear
//! here.

use serde::Serialize;
use tokio::sync::broadcast;

/// Event channel capacity (ring buffer size)
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Events published by the pipeline
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PipelineEvent {
    /// Network session status changed ("connecting", "live",
    /// "reconnecting", "failed: ...", "disconnected: ...", "stopped")
    SessionStatus { status: String },
    /// A recording container started accepting samples
    RecordingStarted { path: String },
    /// A recording was finalized
    RecordingFinished { path: String },
    /// The video encoder was reconfigured for new frame dimensions
    EncoderReconfigured { width: u32, height: u32 },
    /// Audio capture was enabled or disabled
    AudioStateChanged { enabled: bool },
    /// A component failed in a way that tore its session down
    PipelineError { module: String, message: String },
}

/// Broadcast bus distributing [`PipelineEvent`]s to all subscribers
///
/// Events are fire-and-forget: with no active subscribers they are
/// silently dropped, and a subscriber that falls behind the ring buffer
/// receives a `Lagged` error and misses events.
pub struct EventBus {
    tx: broadcast::Sender<PipelineEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }

    /// Publish an event to all subscribers
    pub fn publish(&self, event: PipelineEvent) {
        let _ = self.tx.send(event);
    }

    /// Publish a session status string
    pub fn session_status(&self, status: impl Into<String>) {
        self.publish(PipelineEvent::SessionStatus {
            status: status.into(),
        });
    }

    /// Subscribe to all future events
    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.tx.subscribe()
    }

    /// Current number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
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
    async fn test_publish_subscribe() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        bus.session_status("live");

        let event = rx.recv().await.unwrap();
        assert!(matches!(event, PipelineEvent::SessionStatus { status } if status == "live"));
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_silent() {
        let bus = EventBus::new();
        // no receiver; must not panic or error
        bus.publish(PipelineEvent::AudioStateChanged { enabled: true });
        assert_eq!(bus.subscriber_count(), 0);
    }
}
