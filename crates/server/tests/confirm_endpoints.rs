use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use serde_json::json;
use tower::ServiceExt;

use refactory_core::{ConfirmationKind, ExecutionMode, SessionState};
use refactory_server::state::AppState;

fn app_state() -> Arc<AppState> {
    Arc::new(AppState::new(refactory_config::Config::default()))
}

async fn seed_session(
    state: &AppState,
    session_id: &str,
    awaiting: Option<ConfirmationKind>,
) {
    let mut session = SessionState::new(
        session_id,
        "tester",
        "refactor things",
        ExecutionMode::InteractiveDetailed,
        1,
    );
    session.awaiting_confirmation = awaiting;
    state.sessions.insert(session).await;
    state.register_confirmation(session_id);
}

async fn post_json(
    state: Arc<AppState>,
    path: &str,
    body: serde_json::Value,
) -> (StatusCode, serde_json::Value) {
    let app = refactory_server::build_router(state);
    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(path)
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), 64 * 1024)
        .await
        .unwrap();
    let value = serde_json::from_slice(&bytes).unwrap_or(json!({}));
    (status, value)
}

#[tokio::test]
async fn unknown_session_is_404() {
    let state = app_state();
    let (status, _) = post_json(
        state,
        "/api/refactor/session_missing/confirm-plan",
        json!({ "action": "approve" }),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn wrong_awaiting_state_is_400() {
    let state = app_state();
    seed_session(&state, "session_a", None).await;
    let (status, body) = post_json(
        state.clone(),
        "/api/refactor/session_a/confirm-plan",
        json!({ "action": "approve" }),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["message"]
        .as_str()
        .unwrap()
        .contains("not awaiting plan confirmation"));

    // A session paused at the push gate refuses plan confirmations too.
    seed_session(&state, "session_b", Some(ConfirmationKind::Push)).await;
    let (status, _) = post_json(
        state,
        "/api/refactor/session_b/confirm-plan",
        json!({ "action": "approve" }),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn both_fields_is_400() {
    let state = app_state();
    seed_session(&state, "session_c", Some(ConfirmationKind::Plan)).await;
    let (status, body) = post_json(
        state,
        "/api/refactor/session_c/confirm-plan",
        json!({ "action": "approve", "user_response": "yes please" }),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["message"].as_str().unwrap().contains("not both"));
}

#[tokio::test]
async fn neither_field_is_400() {
    let state = app_state();
    seed_session(&state, "session_d", Some(ConfirmationKind::Validation)).await;
    let (status, _) = post_json(
        state,
        "/api/refactor/session_d/confirm-validation",
        json!({}),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn modify_without_modifications_is_400() {
    let state = app_state();
    seed_session(&state, "session_e", Some(ConfirmationKind::Plan)).await;
    let (status, body) = post_json(
        state,
        "/api/refactor/session_e/confirm-plan",
        json!({ "action": "modify" }),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["message"].as_str().unwrap().contains("Modifications required"));
}

#[tokio::test]
async fn valid_single_field_is_accepted_and_delivered() {
    let state = app_state();
    seed_session(&state, "session_f", Some(ConfirmationKind::Push)).await;
    let (status, body) = post_json(
        state.clone(),
        "/api/refactor/session_f/confirm-push",
        json!({ "action": "approve", "branch_name_override": "feature/caching" }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "confirmed");

    // The payload occupies the single slot; a second delivery conflicts.
    let (status, _) = post_json(
        state,
        "/api/refactor/session_f/confirm-push",
        json!({ "action": "cancel" }),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn natural_language_goes_through_as_reply() {
    let state = app_state();
    seed_session(&state, "session_g", Some(ConfirmationKind::Validation)).await;
    let (status, body) = post_json(
        state,
        "/api/refactor/session_g/confirm-validation",
        json!({ "user_response": "just compile, skip the test suite" }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["message"]
        .as_str()
        .unwrap()
        .contains("Processing natural language"));
}

#[tokio::test]
async fn status_endpoint_projects_snapshots() {
    let state = app_state();
    seed_session(&state, "session_h", Some(ConfirmationKind::Plan)).await;

    let app = refactory_server::build_router(state);
    let response = app
        .oneshot(
            Request::builder()
                .uri("/api/refactor/session_h")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = axum::body::to_bytes(response.into_body(), 64 * 1024)
        .await
        .unwrap();
    let snapshot: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(snapshot["session_id"], "session_h");
    assert_eq!(snapshot["awaiting_confirmation"], "plan");
}
