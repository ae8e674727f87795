use crate::auth::{Auth, AuthRejection};
use crate::state::AppState;
use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};
use std::sync::Arc;

/// Extract authentication token from request
///
/// Supports multiple token sources for browser/WebSocket compatibility:
/// 1. Authorization header: `Authorization: Bearer <token>` (preferred)
/// 2. Query parameter: `?token=<token>` (browsers cannot set upgrade headers)
fn extract_token(request: &Request) -> Result<String, AuthRejection> {
    if let Some(auth_header) = request.headers().get("authorization") {
        let auth_str = auth_header
            .to_str()
            .map_err(|_| AuthRejection::InvalidHeader)?;

        if let Some(token) = auth_str.strip_prefix("Bearer ") {
            tracing::debug!("Token extracted from Authorization header");
            return Ok(token.to_string());
        }
        return Err(AuthRejection::InvalidHeader);
    }

    if let Some(query) = request.uri().query() {
        for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
            if key == "token" {
                tracing::debug!("Token extracted from query parameter");
                return Ok(value.to_string());
            }
        }
    }

    Err(AuthRejection::MissingToken)
}

/// Authentication middleware for the realtime endpoint.
///
/// The middleware never fails the request. It inserts an [`Auth`] into the
/// request extensions:
/// - `Auth::Anonymous` when authentication is disabled
/// - `Auth::Authenticated` when the token matches a configured API secret
/// - `Auth::Rejected` otherwise
///
/// The WebSocket handler completes the upgrade and closes a rejected
/// connection with a dedicated close code, which browsers can observe while
/// an HTTP 401 on the upgrade is opaque to them.
pub async fn auth_middleware(
    State(state): State<Arc<AppState>>,
    mut request: Request,
    next: Next,
) -> Response {
    if !state.config.auth_required {
        tracing::debug!("Authentication disabled, inserting anonymous Auth context");
        request.extensions_mut().insert(Auth::Anonymous);
        return next.run(request).await;
    }

    let request_path = request.uri().path().to_string();

    let auth = match extract_token(&request) {
        Ok(token) => match state.config.find_api_secret_id(&token) {
            Some(secret_id) => {
                tracing::info!(
                    path = %request_path,
                    auth_id = %secret_id,
                    "API secret authentication successful"
                );
                Auth::new(secret_id)
            }
            None => {
                tracing::warn!(
                    path = %request_path,
                    "API secret authentication failed: token mismatch"
                );
                Auth::Rejected(AuthRejection::InvalidToken)
            }
        },
        Err(rejection) => {
            tracing::warn!(
                path = %request_path,
                reason = rejection.as_str(),
                "Authentication failed"
            );
            Auth::Rejected(rejection)
        }
    };

    request.extensions_mut().insert(auth);
    next.run(request).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AuthApiSecret;
    use crate::config::tests::test_config;
    use axum::{Extension, Router, body::Body, http::StatusCode, middleware, routing::get};
    use tower::ServiceExt;

    async fn echo_auth(Extension(auth): Extension<Auth>) -> String {
        match auth {
            Auth::Anonymous => "anonymous".to_string(),
            Auth::Authenticated { id } => format!("authenticated:{id}"),
            Auth::Rejected(reason) => format!("rejected:{}", reason.as_str()),
        }
    }

    async fn app(auth_required: bool) -> Router {
        let mut config = test_config();
        config.auth_required = auth_required;
        config.auth_api_secrets = vec![AuthApiSecret {
            id: "web".to_string(),
            secret: "secret-web".to_string(),
        }];
        let state = AppState::new(config).await;

        Router::new()
            .route("/realtime", get(echo_auth))
            .layer(middleware::from_fn_with_state(state, auth_middleware))
    }

    async fn call(app: Router, request: Request<Body>) -> String {
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    fn request(uri: &str, authorization: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder().uri(uri);
        if let Some(value) = authorization {
            builder = builder.header("authorization", value);
        }
        builder.body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn test_auth_disabled_is_anonymous() {
        let body = call(app(false).await, request("/realtime", None)).await;
        assert_eq!(body, "anonymous");
    }

    #[tokio::test]
    async fn test_bearer_header_authenticates() {
        let body = call(
            app(true).await,
            request("/realtime", Some("Bearer secret-web")),
        )
        .await;
        assert_eq!(body, "authenticated:web");
    }

    #[tokio::test]
    async fn test_query_token_authenticates() {
        let body = call(app(true).await, request("/realtime?token=secret-web", None)).await;
        assert_eq!(body, "authenticated:web");
    }

    #[tokio::test]
    async fn test_failures_are_recorded_not_returned() {
        let body = call(app(true).await, request("/realtime", None)).await;
        assert_eq!(body, "rejected:missing token");

        let body = call(app(true).await, request("/realtime", Some("Basic abc"))).await;
        assert_eq!(body, "rejected:invalid authorization header");

        let body = call(app(true).await, request("/realtime?token=nope", None)).await;
        assert_eq!(body, "rejected:invalid token");
    }

    #[tokio::test]
    async fn test_header_takes_priority_over_query() {
        let body = call(
            app(true).await,
            request("/realtime?token=secret-web", Some("Bearer wrong")),
        )
        .await;
        assert_eq!(body, "rejected:invalid token");
    }
}
