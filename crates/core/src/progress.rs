use std::collections::VecDeque;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::session::{PipelineStage, PipelineStatus};

/// Structured progress update published to the session's subscriber.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub session_id: String,
    pub stage: PipelineStage,
    pub status: PipelineStatus,
    /// Completion fraction in [0, 1].
    pub progress: f64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,
    #[serde(default)]
    pub requires_confirmation: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confirmation_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    pub timestamp: DateTime<Utc>,
}

impl ProgressEvent {
    pub fn new(
        session_id: impl Into<String>,
        stage: PipelineStage,
        status: PipelineStatus,
        message: impl Into<String>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            stage,
            status,
            progress: stage.progress(),
            message: message.into(),
            event_type: None,
            file_path: None,
            requires_confirmation: false,
            confirmation_type: None,
            data: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_type(mut self, event_type: impl Into<String>) -> Self {
        self.event_type = Some(event_type.into());
        self
    }

    pub fn with_file(mut self, file_path: impl Into<String>) -> Self {
        self.file_path = Some(file_path.into());
        self
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn requiring(mut self, confirmation_type: impl Into<String>) -> Self {
        self.requires_confirmation = true;
        self.confirmation_type = Some(confirmation_type.into());
        self
    }
}

/// `None` is the end-of-stream sentinel.
pub type BusItem = Option<ProgressEvent>;

struct BusState {
    /// Events published before the subscriber attached, replayed on connect.
    replay: VecDeque<BusItem>,
    subscriber: Option<mpsc::UnboundedSender<BusItem>>,
    closed: bool,
}

/// Per-session fan-out of progress events to a single subscriber, with
/// buffering for late attach. Publishing never blocks and never fails the
/// pipeline: transport errors are logged and swallowed.
pub struct ProgressBus {
    state: Mutex<BusState>,
}

impl Default for ProgressBus {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressBus {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(BusState {
                replay: VecDeque::new(),
                subscriber: None,
                closed: false,
            }),
        }
    }

    pub fn publish(&self, event: ProgressEvent) {
        self.push(Some(event));
    }

    /// Close the stream: the sentinel always arrives after every event.
    pub fn close(&self) {
        self.push(None);
        if let Ok(mut state) = self.state.lock() {
            state.closed = true;
        }
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().map(|s| s.closed).unwrap_or(true)
    }

    fn push(&self, item: BusItem) {
        let Ok(mut state) = self.state.lock() else {
            warn!("progress bus lock poisoned; dropping event");
            return;
        };
        match &state.subscriber {
            Some(tx) => {
                if tx.send(item).is_err() {
                    // Subscriber went away mid-stream; remaining events are
                    // intentionally dropped (reconnect is not supported).
                    debug!("progress subscriber gone; dropping event");
                    state.subscriber = None;
                }
            }
            None => state.replay.push_back(item),
        }
    }

    /// Attach the subscriber. Buffered events are flushed into the returned
    /// receiver in publish order before any live event.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<BusItem> {
        let (tx, rx) = mpsc::unbounded_channel();
        if let Ok(mut state) = self.state.lock() {
            for item in state.replay.drain(..) {
                let _ = tx.send(item);
            }
            state.subscriber = Some(tx);
        }
        rx
    }

    /// Drop the subscriber and any buffered events. The session itself
    /// stays alive for status reads.
    pub fn evict(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.replay.clear();
            state.subscriber = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(n: u32) -> ProgressEvent {
        ProgressEvent::new(
            "session_1",
            PipelineStage::Intake,
            PipelineStatus::Running,
            format!("event {n}"),
        )
    }

    #[tokio::test]
    async fn late_subscriber_replays_in_order_then_live() {
        let bus = ProgressBus::new();
        bus.publish(event(1));
        bus.publish(event(2));

        let mut rx = bus.subscribe();
        bus.publish(event(3));
        bus.close();

        let mut messages = Vec::new();
        while let Some(item) = rx.recv().await {
            match item {
                Some(e) => messages.push(e.message),
                None => break,
            }
        }
        assert_eq!(messages, vec!["event 1", "event 2", "event 3"]);
    }

    #[tokio::test]
    async fn sentinel_arrives_last_even_when_buffered() {
        let bus = ProgressBus::new();
        bus.publish(event(1));
        bus.close();

        let mut rx = bus.subscribe();
        assert!(rx.recv().await.unwrap().is_some());
        assert!(rx.recv().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn publish_after_subscriber_dropped_is_swallowed() {
        let bus = ProgressBus::new();
        let rx = bus.subscribe();
        drop(rx);
        bus.publish(event(1));
        bus.close();
        assert!(bus.is_closed());
    }

    #[tokio::test]
    async fn evict_clears_buffer() {
        let bus = ProgressBus::new();
        bus.publish(event(1));
        bus.evict();
        let mut rx = bus.subscribe();
        bus.close();
        assert!(rx.recv().await.unwrap().is_none());
    }
}
