use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::Json;
use futures::stream::Stream;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::info;

use refactory_core::gitops::GitHubCredentials;
use refactory_core::{
    generate_session_id, ConfirmationKind, ConfirmationPayload, ExecutionMode, Pipeline,
    PipelineDeps, PipelineStatus, SessionState,
};

use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct RefactorRequest {
    pub user_id: String,
    pub user_prompt: String,
    #[serde(default = "default_mode")]
    pub mode: ExecutionMode,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default)]
    pub github_credentials: Option<GitHubCredentials>,
}

fn default_mode() -> ExecutionMode {
    ExecutionMode::Autonomous
}

fn default_max_retries() -> u32 {
    3
}

#[derive(Debug, Serialize)]
pub struct RefactorResponse {
    pub session_id: String,
    pub status: String,
    pub message: String,
    pub status_url: String,
    pub sse_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub websocket_url: Option<String>,
}

/// POST /api/refactor - allocate a session and start its pipeline worker.
pub async fn start_refactor(
    State(state): State<Arc<AppState>>,
    Json(request): Json<RefactorRequest>,
) -> Json<RefactorResponse> {
    let session_id = generate_session_id();
    info!(session_id, user = %request.user_id, "Starting refactor job");

    let session = SessionState::new(
        &session_id,
        &request.user_id,
        &request.user_prompt,
        request.mode,
        request.max_retries,
    );
    let handle = state.sessions.insert(session).await;
    let bus = state.register_bus(&session_id);
    let confirmations = if request.mode.is_interactive_detailed() {
        Some(state.register_confirmation(&session_id))
    } else {
        None
    };

    let pipeline = Pipeline::new(PipelineDeps {
        router: state.router.clone(),
        config: state.config.clone(),
        session: handle,
        bus,
        confirmations,
        credentials: request.github_credentials,
        repo_root: None,
    });
    tokio::spawn(pipeline.run());

    let base = "/api/refactor";
    Json(RefactorResponse {
        status: "running".to_string(),
        message: "Refactoring pipeline started".to_string(),
        status_url: format!("{base}/{session_id}"),
        sse_url: format!("{base}/{session_id}/sse"),
        websocket_url: matches!(request.mode, ExecutionMode::Interactive)
            .then(|| format!("/ws/refactor/{session_id}")),
        session_id,
    })
}

/// GET /api/refactor/{id} - project the session into a status snapshot.
pub async fn get_status(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> Result<impl IntoResponse, StatusCode> {
    match state.sessions.snapshot(&session_id).await {
        Some(snapshot) => Ok(Json(snapshot)),
        None => Err(StatusCode::NOT_FOUND),
    }
}

/// GET /api/refactor/{id}/sse - drain the progress bus as server-sent
/// events. Buffered events flush first; the stream always ends with a
/// `complete` event. Closing the stream tears down the session's transport
/// plumbing (reconnects see no further events; the status endpoint stays).
pub async fn stream_progress(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, StatusCode> {
    if state.sessions.snapshot(&session_id).await.is_none() {
        return Err(StatusCode::NOT_FOUND);
    }
    let bus = state.bus(&session_id).ok_or(StatusCode::GONE)?;
    let rx = bus.subscribe();
    info!(session_id, "SSE subscriber attached");

    struct Teardown {
        state: Arc<AppState>,
        session_id: String,
    }
    impl Drop for Teardown {
        fn drop(&mut self) {
            self.state.evict_transport(&self.session_id);
            info!(session_id = %self.session_id, "SSE transport evicted");
        }
    }

    let teardown = Teardown {
        state: state.clone(),
        session_id: session_id.clone(),
    };

    let stream = futures::stream::unfold(
        (rx, state, session_id, Some(teardown), false),
        |(mut rx, state, session_id, teardown, done)| async move {
            if done {
                drop(teardown);
                return None;
            }
            match rx.recv().await {
                Some(Some(event)) => {
                    let payload = serde_json::to_string(&event).unwrap_or_default();
                    let sse = Event::default().event("progress").data(payload);
                    Some((Ok(sse), (rx, state, session_id, teardown, false)))
                }
                // Sentinel or producer gone: emit the final complete
                // event and finish on the next poll.
                Some(None) | None => {
                    let success = state
                        .sessions
                        .snapshot(&session_id)
                        .await
                        .map(|s| s.status == PipelineStatus::Completed)
                        .unwrap_or(false);
                    let payload =
                        json!({ "session_id": &session_id, "success": success }).to_string();
                    let sse = Event::default().event("complete").data(payload);
                    Some((Ok(sse), (rx, state, session_id, teardown, true)))
                }
            }
        },
    );

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

#[derive(Debug, Deserialize)]
pub struct PlanConfirmationRequest {
    #[serde(default)]
    pub action: Option<String>,
    #[serde(default)]
    pub modifications: Option<String>,
    #[serde(default)]
    pub user_response: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ValidationConfirmationRequest {
    #[serde(default)]
    pub validation_mode: Option<String>,
    #[serde(default)]
    pub user_response: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct PushConfirmationRequest {
    #[serde(default)]
    pub action: Option<String>,
    #[serde(default)]
    pub branch_name_override: Option<String>,
    #[serde(default)]
    pub commit_message_override: Option<String>,
    #[serde(default)]
    pub user_response: Option<String>,
}

type ConfirmReply = (StatusCode, Json<serde_json::Value>);

fn reply(status: StatusCode, state: &str, message: impl Into<String>) -> ConfirmReply {
    (
        status,
        Json(json!({ "status": state, "message": message.into() })),
    )
}

/// Shared endpoint guards: the session must exist, must be awaiting this
/// kind of confirmation, and exactly one of the structured/free-text
/// fields must be present.
async fn guard_confirmation(
    state: &AppState,
    session_id: &str,
    kind: ConfirmationKind,
    has_structured: bool,
    has_response: bool,
) -> Result<(), ConfirmReply> {
    let snapshot = state
        .sessions
        .snapshot(session_id)
        .await
        .ok_or_else(|| reply(StatusCode::NOT_FOUND, "error", format!("Session not found: {session_id}")))?;

    if snapshot.awaiting_confirmation != Some(kind) {
        return Err(reply(
            StatusCode::BAD_REQUEST,
            "error",
            format!(
                "Session not awaiting {kind} confirmation (current: {:?})",
                snapshot.awaiting_confirmation
            ),
        ));
    }
    if has_structured && has_response {
        return Err(reply(
            StatusCode::BAD_REQUEST,
            "error",
            "Provide either the structured field or user_response, not both",
        ));
    }
    if !has_structured && !has_response {
        return Err(reply(
            StatusCode::BAD_REQUEST,
            "error",
            "Must provide either the structured field or user_response",
        ));
    }
    Ok(())
}

fn deliver(
    state: &AppState,
    session_id: &str,
    payload: ConfirmationPayload,
) -> Result<(), ConfirmReply> {
    let channel = state.confirmation(session_id).ok_or_else(|| {
        reply(
            StatusCode::BAD_REQUEST,
            "error",
            "Session has no confirmation channel",
        )
    })?;
    channel.try_deliver(payload).map_err(|_| {
        reply(
            StatusCode::CONFLICT,
            "error",
            "A confirmation is already pending",
        )
    })
}

/// POST /api/refactor/{id}/confirm-plan
pub async fn confirm_plan(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    Json(request): Json<PlanConfirmationRequest>,
) -> ConfirmReply {
    if let Err(e) = guard_confirmation(
        &state,
        &session_id,
        ConfirmationKind::Plan,
        request.action.is_some(),
        request.user_response.is_some(),
    )
    .await
    {
        return e;
    }
    if request.action.as_deref() == Some("modify")
        && request.modifications.is_none()
        && request.user_response.is_none()
    {
        return reply(
            StatusCode::BAD_REQUEST,
            "error",
            "Modifications required when action is modify",
        );
    }

    let payload = match request.user_response {
        Some(user_response) => ConfirmationPayload::Reply { user_response },
        None => ConfirmationPayload::Plan {
            action: request.action.unwrap_or_else(|| "cancel".to_string()),
            modifications: request.modifications,
        },
    };
    if let Err(e) = deliver(&state, &session_id, payload) {
        return e;
    }
    reply(StatusCode::OK, "confirmed", "Plan confirmation received")
}

/// POST /api/refactor/{id}/confirm-validation
pub async fn confirm_validation(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    Json(request): Json<ValidationConfirmationRequest>,
) -> ConfirmReply {
    if let Err(e) = guard_confirmation(
        &state,
        &session_id,
        ConfirmationKind::Validation,
        request.validation_mode.is_some(),
        request.user_response.is_some(),
    )
    .await
    {
        return e;
    }

    let message = match request.validation_mode.as_deref() {
        Some("full") => "Validation mode set to: full (compile + run tests)",
        Some("compile_only") => "Validation mode set to: compile_only (skip tests)",
        Some("skip") => "Validation mode set to: skip (no validation)",
        _ => "Processing natural language response...",
    };

    let payload = match request.user_response {
        Some(user_response) => ConfirmationPayload::Reply { user_response },
        None => ConfirmationPayload::Validation {
            validation_mode: request.validation_mode.unwrap_or_else(|| "full".to_string()),
        },
    };
    if let Err(e) = deliver(&state, &session_id, payload) {
        return e;
    }
    reply(StatusCode::OK, "confirmed", message)
}

/// POST /api/refactor/{id}/confirm-push
pub async fn confirm_push(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    Json(request): Json<PushConfirmationRequest>,
) -> ConfirmReply {
    if let Err(e) = guard_confirmation(
        &state,
        &session_id,
        ConfirmationKind::Push,
        request.action.is_some(),
        request.user_response.is_some(),
    )
    .await
    {
        return e;
    }

    let approving = request.action.as_deref() == Some("approve");
    let payload = match request.user_response {
        Some(user_response) => ConfirmationPayload::Reply { user_response },
        None => ConfirmationPayload::Push {
            action: request.action.unwrap_or_else(|| "cancel".to_string()),
            branch_name_override: request.branch_name_override,
            commit_message_override: request.commit_message_override,
        },
    };
    if let Err(e) = deliver(&state, &session_id, payload) {
        return e;
    }
    if approving {
        reply(StatusCode::OK, "confirmed", "Push approved, committing and pushing")
    } else {
        reply(StatusCode::OK, "confirmed", "Push confirmation received")
    }
}
