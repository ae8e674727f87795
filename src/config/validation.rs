use std::collections::HashSet;

use super::AuthApiSecret;
use crate::core::session::Session;

/// API secret entries need a non-empty id and secret, and ids must be unique.
pub(super) fn validate_auth_api_secrets(
    secrets: &[AuthApiSecret],
) -> Result<(), Box<dyn std::error::Error>> {
    let mut seen = HashSet::new();
    for entry in secrets {
        if entry.id.trim().is_empty() {
            return Err("API secret entries must have a non-empty id".into());
        }
        if entry.secret.is_empty() {
            return Err(format!("API secret '{}' has an empty secret", entry.id).into());
        }
        if !seen.insert(entry.id.as_str()) {
            return Err(format!("Duplicate API secret id: '{}'", entry.id).into());
        }
    }
    Ok(())
}

pub(super) fn validate_auth_required(
    auth_required: bool,
    secrets: &[AuthApiSecret],
) -> Result<(), Box<dyn std::error::Error>> {
    if auth_required && secrets.is_empty() {
        return Err(
            "AUTH_REQUIRED is enabled but no API secrets are configured \
             (set AUTH_API_SECRETS_JSON, AUTH_API_SECRET or auth.api_secrets)"
                .into(),
        );
    }
    Ok(())
}

pub(super) fn validate_conversation(
    carryover_max_chars: usize,
    event_buffer_size: usize,
) -> Result<(), Box<dyn std::error::Error>> {
    if carryover_max_chars == 0 {
        return Err("carryover_max_chars must be greater than 0".into());
    }
    if event_buffer_size == 0 {
        return Err("event_buffer_size must be greater than 0".into());
    }
    Ok(())
}

/// Seeded session ids must be present and unique.
pub(super) fn validate_seeded_sessions(
    sessions: &[Session],
) -> Result<(), Box<dyn std::error::Error>> {
    let mut seen = HashSet::new();
    for session in sessions {
        if session.session_id.trim().is_empty() || session.user_id.trim().is_empty() {
            return Err("Seeded sessions need a session_id and a user_id".into());
        }
        if !seen.insert(session.session_id.as_str()) {
            return Err(format!("Duplicate seeded session id: '{}'", session.session_id).into());
        }
    }
    Ok(())
}
