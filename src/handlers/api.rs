use axum::{Json, extract::State, response::IntoResponse};
use std::sync::Arc;

use crate::state::AppState;

/// Health check
///
/// Reports the crate version and the number of open realtime connections.
pub async fn health_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "OK",
        "version": env!("CARGO_PKG_VERSION"),
        "realtime_connections": state.ws_connection_count(),
    }))
}
