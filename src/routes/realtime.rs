//! Realtime WebSocket route configuration

use axum::{Router, routing::get};
use tower_http::trace::TraceLayer;

use crate::handlers::realtime::realtime_handler;
use crate::state::AppState;
use std::sync::Arc;

/// Create the Realtime WebSocket router
///
/// # Endpoint
///
/// `GET /realtime?session_id=<id>` - WebSocket upgrade for a conversation
///
/// # Authentication
///
/// `Authorization: Bearer <secret>` or `?token=<secret>` when
/// `AUTH_REQUIRED` is enabled. Failures close the socket with `4401`.
///
/// # Example
///
/// ```json
/// // Server sends on connect
/// {"type": "session.ready", "session_id": "sess-1", "user_id": "u-1", "chat_session_id": "c-1", "launch_mode": "general"}
///
/// // Client starts the conversation and streams audio
/// {"type": "session.start", "session_id": "sess-1"}
/// {"type": "audio.frame", "seq": 1, "pcm16_b64": "AAAA", "sample_rate_hz": 16000}
/// {"type": "audio.commit"}
/// ```
pub fn create_realtime_router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/realtime", get(realtime_handler))
        .layer(TraceLayer::new_for_http())
}
