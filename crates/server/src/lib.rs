pub mod routes;
pub mod state;
pub mod ws;

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;

use crate::state::AppState;

/// The full route table. CORS is layered on by the binary so tests can
/// exercise the bare router.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/refactor", post(routes::start_refactor))
        .route("/api/refactor/{session_id}", get(routes::get_status))
        .route(
            "/api/refactor/{session_id}/sse",
            get(routes::stream_progress),
        )
        .route(
            "/api/refactor/{session_id}/confirm-plan",
            post(routes::confirm_plan),
        )
        .route(
            "/api/refactor/{session_id}/confirm-validation",
            post(routes::confirm_validation),
        )
        .route(
            "/api/refactor/{session_id}/confirm-push",
            post(routes::confirm_push),
        )
        .route("/ws/refactor/{session_id}", get(ws::websocket_refactor))
        .with_state(state)
}
