use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfirmationKind {
    Plan,
    Validation,
    Push,
}

impl std::fmt::Display for ConfirmationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfirmationKind::Plan => write!(f, "plan"),
            ConfirmationKind::Validation => write!(f, "validation"),
            ConfirmationKind::Push => write!(f, "push"),
        }
    }
}

/// What the user sent back through a confirmation endpoint: either free
/// text for the decision engine to interpret, or the structured form for
/// the gate in question. Transport handlers construct the variant matching
/// their endpoint; this type never deserializes from the wire directly.
#[derive(Debug, Clone)]
pub enum ConfirmationPayload {
    Plan {
        action: String,
        modifications: Option<String>,
    },
    Validation {
        validation_mode: String,
    },
    Push {
        action: String,
        branch_name_override: Option<String>,
        commit_message_override: Option<String>,
    },
    Reply {
        user_response: String,
    },
}

#[derive(Debug)]
pub enum ConfirmationWait {
    Received(ConfirmationPayload),
    TimedOut,
    Cancelled,
}

/// Single-slot rendezvous between a confirmation endpoint and the paused
/// pipeline worker.
pub struct ConfirmationChannel {
    tx: mpsc::Sender<ConfirmationPayload>,
    rx: Mutex<mpsc::Receiver<ConfirmationPayload>>,
    cancel: CancellationToken,
}

impl Default for ConfirmationChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfirmationChannel {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel(1);
        Self {
            tx,
            rx: Mutex::new(rx),
            cancel: CancellationToken::new(),
        }
    }

    /// Deliver a payload from the transport side. Fails when the slot is
    /// already occupied or the worker is gone.
    pub fn try_deliver(&self, payload: ConfirmationPayload) -> Result<(), ConfirmationPayload> {
        self.tx.try_send(payload).map_err(|e| match e {
            mpsc::error::TrySendError::Full(p) => p,
            mpsc::error::TrySendError::Closed(p) => p,
        })
    }

    /// Block the pipeline until a payload arrives, the timeout elapses, or
    /// the session is cancelled.
    pub async fn wait(&self, timeout: Duration) -> ConfirmationWait {
        let mut rx = self.rx.lock().await;
        tokio::select! {
            _ = self.cancel.cancelled() => ConfirmationWait::Cancelled,
            received = rx.recv() => match received {
                Some(payload) => ConfirmationWait::Received(payload),
                None => ConfirmationWait::Cancelled,
            },
            _ = tokio::time::sleep(timeout) => ConfirmationWait::TimedOut,
        }
    }

    /// Release any pending wait; the pipeline exits at its next suspension
    /// point with CANCELLED.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn delivery_reaches_waiting_pipeline() {
        let channel = ConfirmationChannel::new();
        channel
            .try_deliver(ConfirmationPayload::Reply {
                user_response: "approve".into(),
            })
            .unwrap();
        match channel.wait(Duration::from_secs(1)).await {
            ConfirmationWait::Received(ConfirmationPayload::Reply { user_response }) => {
                assert_eq!(user_response, "approve");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn second_delivery_is_refused_while_slot_full() {
        let channel = ConfirmationChannel::new();
        channel
            .try_deliver(ConfirmationPayload::Validation {
                validation_mode: "full".into(),
            })
            .unwrap();
        assert!(channel
            .try_deliver(ConfirmationPayload::Validation {
                validation_mode: "skip".into(),
            })
            .is_err());
    }

    #[tokio::test]
    async fn wait_times_out() {
        let channel = ConfirmationChannel::new();
        assert!(matches!(
            channel.wait(Duration::from_millis(10)).await,
            ConfirmationWait::TimedOut
        ));
    }

    #[tokio::test]
    async fn cancellation_releases_wait() {
        let channel = ConfirmationChannel::new();
        channel.cancel();
        assert!(matches!(
            channel.wait(Duration::from_secs(5)).await,
            ConfirmationWait::Cancelled
        ));
    }

    #[test]
    fn kind_labels_match_endpoint_names() {
        assert_eq!(ConfirmationKind::Plan.to_string(), "plan");
        assert_eq!(ConfirmationKind::Validation.to_string(), "validation");
        assert_eq!(ConfirmationKind::Push.to_string(), "push");
    }
}
