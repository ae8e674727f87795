//! Connection limit middleware for the realtime WebSocket endpoint.
//!
//! Enforces the global WebSocket cap and the per-IP cap before the upgrade
//! happens. The realtime handler releases the slot when the socket closes.

use axum::{
    Json,
    body::Body,
    extract::{ConnectInfo, State},
    http::{HeaderValue, Request, StatusCode, header::RETRY_AFTER},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tracing::warn;

use crate::state::{AppState, ConnectionLimitError};

/// Seconds a rejected client is asked to wait before reconnecting
const RETRY_AFTER_SECS: &str = "5";

/// Slot owner recorded on admitted upgrades; the realtime handler releases it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ClientIp(pub IpAddr);

impl IntoResponse for ConnectionLimitError {
    fn into_response(self) -> Response {
        let (status, limit) = match self {
            ConnectionLimitError::GlobalLimitReached => (StatusCode::SERVICE_UNAVAILABLE, "global"),
            ConnectionLimitError::PerIpLimitReached => (StatusCode::TOO_MANY_REQUESTS, "per_ip"),
        };
        let body = Json(serde_json::json!({
            "error": self.to_string(),
            "limit": limit,
        }));

        let mut response = (status, body).into_response();
        response
            .headers_mut()
            .insert(RETRY_AFTER, HeaderValue::from_static(RETRY_AFTER_SECS));
        response
    }
}

fn is_websocket_upgrade(request: &Request<Body>) -> bool {
    request
        .headers()
        .get(axum::http::header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("websocket"))
}

/// Reserve a realtime connection slot for the caller's IP.
///
/// Plain HTTP requests pass through untouched. Upgrades over the global cap
/// get `503`, upgrades over the per-IP cap get `429`; both carry a JSON body
/// and a `Retry-After` header.
pub async fn connection_limit_middleware(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    if !is_websocket_upgrade(&request) {
        return next.run(request).await;
    }

    let client_ip = addr.ip();
    match state.try_acquire_connection(client_ip) {
        Ok(()) => {
            request.extensions_mut().insert(ClientIp(client_ip));
            next.run(request).await
        }
        Err(e) => {
            warn!(
                ip = %client_ip,
                active = state.ws_connection_count(),
                active_for_ip = state.ip_connection_count(&client_ip),
                error = %e,
                "Rejecting realtime connection"
            );
            e.into_response()
        }
    }
}
