//! Authentication context for realtime connections.
//!
//! The auth middleware never rejects a WebSocket upgrade. It records an
//! [`Auth`] outcome in the request extensions and the realtime handler closes
//! the socket with a dedicated close code when the outcome is a rejection.

use subtle::ConstantTimeEq;

use crate::config::AuthApiSecret;
use crate::core::session::Session;

/// Why a connection failed authentication.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthRejection {
    /// No bearer header and no `token` query parameter
    MissingToken,
    /// Authorization header present but not `Bearer <token>`
    InvalidHeader,
    /// Token did not match any configured secret
    InvalidToken,
}

impl AuthRejection {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthRejection::MissingToken => "missing token",
            AuthRejection::InvalidHeader => "invalid authorization header",
            AuthRejection::InvalidToken => "invalid token",
        }
    }
}

/// Outcome of authenticating one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Auth {
    /// Authentication is disabled
    Anonymous,
    /// Matched an API secret; `id` is the secret's client id
    Authenticated { id: String },
    Rejected(AuthRejection),
}

impl Auth {
    pub fn new(id: impl Into<String>) -> Self {
        Auth::Authenticated { id: id.into() }
    }

    pub fn id(&self) -> Option<&str> {
        match self {
            Auth::Authenticated { id } => Some(id),
            _ => None,
        }
    }

    pub fn is_rejected(&self) -> bool {
        matches!(self, Auth::Rejected(_))
    }

    /// Whether this principal may attach to `session`.
    pub fn may_access(&self, session: &Session) -> bool {
        match self {
            Auth::Anonymous => true,
            Auth::Authenticated { id } => session
                .client_id
                .as_deref()
                .is_none_or(|owner| owner == id),
            Auth::Rejected(_) => false,
        }
    }
}

/// Find the client id whose secret equals `token`.
///
/// All secrets are compared in constant time, regardless of where a match occurs.
pub fn match_api_secret_id<'a>(token: &str, secrets: &'a [AuthApiSecret]) -> Option<&'a str> {
    let mut matched = None;
    for entry in secrets {
        let equal = bool::from(entry.secret.as_bytes().ct_eq(token.as_bytes()));
        if equal && matched.is_none() {
            matched = Some(entry.id.as_str());
        }
    }
    matched
}
