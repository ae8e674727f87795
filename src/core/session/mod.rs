//! Conversation session model.
//!
//! A [`Session`] is created by the session-issuing service before the client
//! connects and is looked up through a [`SessionDirectory`] during the
//! WebSocket handshake. The turn scheduler owns its copy for the lifetime of
//! the connection and is the only component that mutates it.

mod directory;

pub use directory::{DirectoryError, DirectoryResult, InMemorySessionDirectory, SessionDirectory};

use serde::{Deserialize, Serialize};
use std::fmt;

/// How the client launched the conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LaunchMode {
    /// Open-ended conversation
    #[default]
    General,
    /// Conversation anchored on a piece of content
    ContentFocused,
    /// Read-only narration of a pre-computed summary
    NarrateSummary,
}

impl LaunchMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            LaunchMode::General => "general",
            LaunchMode::ContentFocused => "content_focused",
            LaunchMode::NarrateSummary => "narrate_summary",
        }
    }
}

impl fmt::Display for LaunchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Content attached to a session (document, article, recording...).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentContext {
    pub content_id: String,
    #[serde(default)]
    pub title: Option<String>,
    /// Pre-computed summary narrated by the auto-summary turn
    #[serde(default)]
    pub summary: Option<String>,
}

/// Per-connection session record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub session_id: String,
    pub user_id: String,
    pub chat_session_id: String,
    #[serde(default)]
    pub launch_mode: LaunchMode,
    #[serde(default)]
    pub content_context: Option<ContentContext>,
    /// Whether the chat thread already holds messages
    #[serde(default)]
    pub has_prior_messages: bool,
    #[serde(default)]
    pub pending_intro: bool,
    #[serde(default)]
    pub is_onboarding_intro: bool,
    #[serde(default)]
    pub read_only: bool,
    /// API client allowed to attach; `None` admits any authenticated client
    #[serde(default)]
    pub client_id: Option<String>,
}

impl Session {
    /// Create a general-purpose session with no intro and no content.
    pub fn new(
        session_id: impl Into<String>,
        user_id: impl Into<String>,
        chat_session_id: impl Into<String>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            user_id: user_id.into(),
            chat_session_id: chat_session_id.into(),
            launch_mode: LaunchMode::General,
            content_context: None,
            has_prior_messages: false,
            pending_intro: false,
            is_onboarding_intro: false,
            read_only: false,
            client_id: None,
        }
    }

    /// Summary text available for narration, if any.
    pub fn summary_text(&self) -> Option<&str> {
        self.content_context
            .as_ref()
            .and_then(|ctx| ctx.summary.as_deref())
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }

    /// Whether this session owes a one-time spoken summary.
    ///
    /// Owed when the client asked for narration, the thread is fresh, and a
    /// summary exists to narrate.
    pub fn owes_auto_summary(&self) -> bool {
        self.launch_mode == LaunchMode::NarrateSummary
            && !self.has_prior_messages
            && self.summary_text().is_some()
    }
}
