use std::path::Path;
use std::sync::Arc;

use axum::extract::{Path as AxumPath, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get};
use axum::{Json, Router};
use serde::Deserialize;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::error;

use ambilight_engine::control::ControlPlane;
use ambilight_engine::session::SessionState;
use ambilight_engine::store::HistoryRecorder;
use ambilight_engine::SettingsPatch;

use crate::connections::{ConnectionRecord, ConnectionTable};
use crate::ws::ws_handler;

const DEFAULT_HISTORY_LIMIT: usize = 10;
const MAX_HISTORY_LIMIT: usize = 100;

// ---------------------------------------------------------------------------
// App state
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct AppState {
    pub control: Arc<ControlPlane>,
    pub history: Arc<dyn HistoryRecorder>,
    pub connections: Arc<ConnectionTable>,
    /// Per-connection colors backlog handed to each socket's emitter.
    pub color_backlog: usize,
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    limit: Option<usize>,
}

pub fn router(state: AppState, uploads_dir: &Path, uploads_prefix: &str) -> Router {
    let mount = match uploads_prefix.trim_end_matches('/') {
        "" => "/uploads",
        m => m,
    };

    Router::new()
        .route("/ws", get(ws_handler))
        .route("/api/settings", get(get_settings).post(post_settings))
        .route("/api/history", get(list_history).delete(clear_history))
        .route("/api/history/:id", delete(remove_history))
        .route("/api/connections", get(list_connections))
        .nest_service(mount, ServeDir::new(uploads_dir))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// GET /api/settings
async fn get_settings(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.control.current_settings().await)
}

/// POST /api/settings
///
/// Accepts a full or partial settings body and answers with the settings now
/// in effect.
async fn post_settings(
    State(state): State<AppState>,
    Json(patch): Json<SettingsPatch>,
) -> Response {
    match state.control.update_settings(&patch).await {
        Ok(()) => Json(state.control.current_settings().await).into_response(),
        Err(e) => {
            error!(error = %e, "settings update failed");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

/// GET /api/history?limit=
async fn list_history(
    State(state): State<AppState>,
    Query(q): Query<HistoryQuery>,
) -> Response {
    let limit = q
        .limit
        .unwrap_or(DEFAULT_HISTORY_LIMIT)
        .min(MAX_HISTORY_LIMIT);
    match state.history.recent(limit).await {
        Ok(entries) => Json(entries).into_response(),
        Err(e) => {
            error!(error = %e, "history query failed");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

/// DELETE /api/history
async fn clear_history(State(state): State<AppState>) -> Response {
    match state.history.clear().await {
        Ok(removed) => Json(serde_json::json!({ "removed": removed })).into_response(),
        Err(e) => {
            error!(error = %e, "history clear failed");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

/// DELETE /api/history/:id
async fn remove_history(State(state): State<AppState>, AxumPath(id): AxumPath<i64>) -> Response {
    match state.history.remove(id).await {
        Ok(true) => StatusCode::NO_CONTENT.into_response(),
        Ok(false) => StatusCode::NOT_FOUND.into_response(),
        Err(e) => {
            error!(error = %e, id, "history delete failed");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

/// GET /api/connections
async fn list_connections(State(state): State<AppState>) -> impl IntoResponse {
    Json(connection_snapshot(&state).await)
}

/// Open connections, each marked processing if its session is live right
/// now.
async fn connection_snapshot(state: &AppState) -> Vec<ConnectionRecord> {
    let mut records = state.connections.list();
    for record in &mut records {
        record.is_processing = matches!(
            state.control.registry().state(record.connection_id).await,
            Some(SessionState::Idle | SessionState::Running)
        );
    }
    records
}
