use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::Response;
use serde_json::json;
use tracing::{info, warn};

use refactory_core::gitops::GitHubCredentials;
use refactory_core::{
    ConfirmationPayload, ExecutionMode, Pipeline, PipelineDeps, SessionState,
};

use crate::state::AppState;

/// WS /ws/refactor/{id} - interactive transport. The client opens with a
/// `start` message, receives `progress`/`confirmation` messages, and
/// answers confirmations with `response` messages. Disconnecting does not
/// cancel the worker; the confirmation timeout governs.
pub async fn websocket_refactor(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state, session_id))
}

async fn handle_socket(mut socket: WebSocket, state: Arc<AppState>, session_id: String) {
    info!(session_id, "WebSocket connected");

    // First message must be `start` with the refactor request.
    let start = loop {
        match socket.recv().await {
            Some(Ok(Message::Text(text))) => {
                break serde_json::from_str::<serde_json::Value>(&text).ok()
            }
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
            _ => break None,
        }
    };
    let Some(start) = start else {
        let _ = send_json(
            &mut socket,
            json!({ "type": "error", "message": "Expected a start message" }),
        )
        .await;
        return;
    };
    if start.get("type").and_then(|t| t.as_str()) != Some("start") {
        let _ = send_json(
            &mut socket,
            json!({ "type": "error", "message": "First message must be 'start'" }),
        )
        .await;
        return;
    }

    let data = start.get("data").cloned().unwrap_or_default();
    let Some(user_prompt) = data.get("user_prompt").and_then(|p| p.as_str()) else {
        let _ = send_json(
            &mut socket,
            json!({ "type": "error", "message": "Missing user_prompt in request" }),
        )
        .await;
        return;
    };
    let user_id = data
        .get("user_id")
        .and_then(|u| u.as_str())
        .unwrap_or("anonymous");
    let credentials: Option<GitHubCredentials> = data
        .get("github_credentials")
        .cloned()
        .and_then(|v| serde_json::from_value(v).ok());

    // The interactive transport drives all three gates over the socket.
    let session = SessionState::new(
        &session_id,
        user_id,
        user_prompt,
        ExecutionMode::InteractiveDetailed,
        3,
    );
    let handle = state.sessions.insert(session).await;
    let bus = state.register_bus(&session_id);
    let confirmations = state.register_confirmation(&session_id);
    let mut events = bus.subscribe();

    let pipeline = Pipeline::new(PipelineDeps {
        router: state.router.clone(),
        config: state.config.clone(),
        session: handle,
        bus,
        confirmations: Some(confirmations.clone()),
        credentials,
        repo_root: None,
    });
    tokio::spawn(pipeline.run());

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(Some(progress)) => {
                    let kind = if progress.requires_confirmation {
                        "confirmation"
                    } else {
                        "progress"
                    };
                    if send_json(&mut socket, json!({ "type": kind, "data": progress }))
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                Some(None) | None => {
                    let success = state
                        .sessions
                        .snapshot(&session_id)
                        .await
                        .map(|s| s.status == refactory_core::PipelineStatus::Completed)
                        .unwrap_or(false);
                    let _ = send_json(
                        &mut socket,
                        json!({ "type": "complete", "data": { "session_id": &session_id, "success": success } }),
                    )
                    .await;
                    break;
                }
            },
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    let Ok(message) = serde_json::from_str::<serde_json::Value>(&text) else {
                        continue;
                    };
                    if message.get("type").and_then(|t| t.as_str()) == Some("response") {
                        let response = message
                            .get("data")
                            .and_then(|d| d.get("response"))
                            .and_then(|r| r.as_str())
                            .unwrap_or_default()
                            .to_string();
                        if response.is_empty() {
                            continue;
                        }
                        if confirmations
                            .try_deliver(ConfirmationPayload::Reply { user_response: response })
                            .is_err()
                        {
                            warn!(session_id, "Dropped response: no pending confirmation slot");
                        }
                    }
                }
                Some(Ok(Message::Close(_))) | None => {
                    info!(session_id, "WebSocket disconnected; worker continues");
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!(session_id, error = %e, "WebSocket receive error");
                    break;
                }
            },
        }
    }

    state.evict_transport(&session_id);
}

async fn send_json(socket: &mut WebSocket, value: serde_json::Value) -> Result<(), axum::Error> {
    socket.send(Message::Text(value.to_string().into())).await
}
