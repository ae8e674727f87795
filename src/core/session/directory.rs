use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use thiserror::Error;

use super::Session;

/// Errors surfaced by a session directory backend.
#[derive(Debug, Error)]
pub enum DirectoryError {
    /// The backing store could not be reached or returned garbage
    #[error("Session directory unavailable: {0}")]
    Unavailable(String),
}

pub type DirectoryResult<T> = Result<T, DirectoryError>;

/// Lookup and persistence boundary for sessions and onboarding state.
///
/// Session issuance and conversation history live behind this trait; the
/// gateway only reads sessions and records onboarding completion.
#[async_trait]
pub trait SessionDirectory: Send + Sync {
    /// Fetch an issued session by id.
    async fn lookup(&self, session_id: &str) -> DirectoryResult<Option<Session>>;

    /// Record that `user_id` finished onboarding.
    ///
    /// Returns `true` only for the call that flipped the flag; repeats are
    /// no-ops returning `false`.
    async fn complete_onboarding(&self, user_id: &str) -> DirectoryResult<bool>;
}

/// Process-local directory used for development and tests.
#[derive(Debug, Default)]
pub struct InMemorySessionDirectory {
    sessions: DashMap<String, Session>,
    onboarded: DashSet<String>,
}

impl InMemorySessionDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) a session.
    pub fn insert(&self, session: Session) {
        self.sessions.insert(session.session_id.clone(), session);
    }

    pub fn remove(&self, session_id: &str) -> Option<Session> {
        self.sessions.remove(session_id).map(|(_, s)| s)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn is_onboarded(&self, user_id: &str) -> bool {
        self.onboarded.contains(user_id)
    }
}

#[async_trait]
impl SessionDirectory for InMemorySessionDirectory {
    async fn lookup(&self, session_id: &str) -> DirectoryResult<Option<Session>> {
        Ok(self.sessions.get(session_id).map(|entry| entry.clone()))
    }

    async fn complete_onboarding(&self, user_id: &str) -> DirectoryResult<bool> {
        Ok(self.onboarded.insert(user_id.to_string()))
    }
}
