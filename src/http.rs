//! HTTP trigger endpoints for the sync engine.
//!
//! `POST /sync/run` starts a batch across all stored connections and
//! `POST /sync/users/{user_id}` syncs one user on demand, returning its
//! five lens summaries plus the monitored entity count. Both check a
//! bearer token against the configured secret; access is open when no
//! secret is set. `GET /health` is an unauthenticated liveness probe.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use tower_http::cors::{Any, CorsLayer};
use tracing::warn;

use crate::error::{Error, SyncError};
use crate::sync::SyncEngine;

/// Shared state for the sync routes.
#[derive(Clone)]
pub struct SyncRouteState {
    pub engine: Arc<SyncEngine>,
    pub sync_secret: Option<String>,
}

fn authorized(state: &SyncRouteState, headers: &HeaderMap) -> bool {
    let Some(secret) = &state.sync_secret else {
        return true;
    };
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|token| token == secret)
        .unwrap_or(false)
}

fn unauthorized() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(serde_json::json!({"error": "invalid or missing bearer token"})),
    )
        .into_response()
}

fn internal_error(e: Error) -> Response {
    warn!(error = %e, "sync endpoint failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(serde_json::json!({"error": e.to_string()})),
    )
        .into_response()
}

/// POST /sync/run
///
/// Runs the batch orchestrator and returns processed/failed counts with
/// per-user error summaries.
async fn run_batch(State(state): State<SyncRouteState>, headers: HeaderMap) -> Response {
    if !authorized(&state, &headers) {
        return unauthorized();
    }
    match state.engine.run_batch().await {
        Ok(report) => Json(report).into_response(),
        Err(e) => internal_error(e),
    }
}

/// POST /sync/users/{user_id}
async fn run_user(
    State(state): State<SyncRouteState>,
    Path(user_id): Path<String>,
    headers: HeaderMap,
) -> Response {
    if !authorized(&state, &headers) {
        return unauthorized();
    }
    match state.engine.sync_user(&user_id).await {
        Ok(report) => Json(report).into_response(),
        Err(Error::Sync(SyncError::NoConnection(user))) => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({"error": format!("no connection stored for user {user}")})),
        )
            .into_response(),
        Err(e) => internal_error(e),
    }
}

/// GET /health
async fn health() -> Response {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
    .into_response()
}

/// Build the trigger routes. Merge into the main app router.
pub fn sync_routes(state: SyncRouteState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/sync/run", post(run_batch))
        .route("/sync/users/{user_id}", post(run_user))
        .route("/health", get(health))
        .layer(cors)
        .with_state(state)
}
