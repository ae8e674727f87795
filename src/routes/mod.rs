pub mod api;
pub mod realtime;

use axum::{Router, middleware};
use std::sync::Arc;

use crate::middleware::{auth_middleware, connection_limit_middleware};
use crate::state::AppState;

/// Compose the gateway's routes with their middleware.
///
/// Realtime layer order (outer to inner): connection_limit -> auth -> handler.
/// Serve with `into_make_service_with_connect_info::<SocketAddr>()`; the
/// connection limiter keys slots on the peer address.
pub fn create_gateway_router(state: Arc<AppState>) -> Router {
    let realtime_routes = realtime::create_realtime_router()
        .layer(middleware::from_fn_with_state(state.clone(), auth_middleware))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            connection_limit_middleware,
        ));

    api::create_api_router()
        .merge(realtime_routes)
        .with_state(state)
}
