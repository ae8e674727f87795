//! Base traits and types for turn processors.
//!
//! A turn processor turns a committed user utterance (or a synthetic script)
//! into an ordered stream of result events: transcript fragments, response
//! text fragments, audio fragments and a final completion. Speech-to-text,
//! reasoning and text-to-speech all live behind this boundary; the scheduler
//! only drives when turns start and stop.
//!
//! # Audio Format
//!
//! Inbound frames are PCM 16-bit signed little-endian, mono.

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::core::session::Session;

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur inside a turn processor.
#[derive(Debug, Error)]
pub enum ProcessorError {
    /// The upstream audio stream could not be opened
    #[error("Stream start failed: {0}")]
    StreamStartFailed(String),

    /// A single audio frame was refused
    #[error("Audio rejected: {0}")]
    AudioRejected(String),

    /// Audio was submitted before a stream was opened
    #[error("No audio stream is open")]
    NotStreaming,

    /// The turn failed mid-flight
    #[error("Turn failed: {0}")]
    TurnFailed(String),

    /// The processor has been shut down
    #[error("Processor closed")]
    Closed,

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type for processor operations.
pub type ProcessorResult<T> = Result<T, ProcessorError>;

// =============================================================================
// Requests
// =============================================================================

/// One inbound PCM frame.
#[derive(Debug, Clone)]
pub struct AudioFrame {
    /// Client-side sequence number
    pub seq: u64,
    /// Raw PCM16 LE bytes
    pub pcm: Bytes,
    pub sample_rate_hz: u32,
    pub channels: u16,
}

/// Run a turn from the audio buffered since the stream was opened.
#[derive(Debug, Clone)]
pub struct UserTurnRequest {
    pub turn_id: String,
    pub turn_index: u64,
    /// Tail of an interrupted assistant reply to continue from
    pub carryover: Option<String>,
}

/// Synthetic input for non-audio turns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Script {
    /// Spoken welcome; `onboarding` selects the first-time flavor
    Intro { onboarding: bool },
    /// Narration of a pre-computed summary
    Summary { title: Option<String>, text: String },
}

#[derive(Debug, Clone)]
pub struct ScriptedTurnRequest {
    pub turn_id: String,
    pub turn_index: u64,
    pub script: Script,
}

/// How a turn task ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnOutcome {
    Completed,
    Cancelled,
}

// =============================================================================
// Events
// =============================================================================

/// Payload of a turn-scoped event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TurnPayload {
    /// Emitted by the scheduler when a turn is activated
    Started {
        is_intro: Option<bool>,
        is_onboarding_intro: Option<bool>,
    },
    TranscriptPartial {
        text: String,
    },
    TranscriptFinal {
        text: String,
    },
    AssistantTextDelta {
        text: String,
    },
    AssistantTextFinal {
        text: String,
    },
    AssistantAudioChunk {
        seq: u64,
        audio_b64: String,
        format: String,
    },
    AssistantAudioFinal,
    Completed {
        latency_ms: u64,
        transcript_chars: usize,
        response_chars: usize,
        model: String,
    },
    Cancelled {
        reason: Option<String>,
    },
}

impl TurnPayload {
    /// Wire name of the event type.
    pub fn event_type(&self) -> &'static str {
        match self {
            TurnPayload::Started { .. } => "turn.started",
            TurnPayload::TranscriptPartial { .. } => "transcript.partial",
            TurnPayload::TranscriptFinal { .. } => "transcript.final",
            TurnPayload::AssistantTextDelta { .. } => "assistant.text.delta",
            TurnPayload::AssistantTextFinal { .. } => "assistant.text.final",
            TurnPayload::AssistantAudioChunk { .. } => "assistant.audio.chunk",
            TurnPayload::AssistantAudioFinal => "assistant.audio.final",
            TurnPayload::Completed { .. } => "turn.completed",
            TurnPayload::Cancelled { .. } => "turn.cancelled",
        }
    }
}

/// A turn-scoped event tagged with the emitting turn.
#[derive(Debug, Clone, PartialEq)]
pub struct TurnEvent {
    pub turn_id: String,
    pub payload: TurnPayload,
}

impl TurnEvent {
    pub fn new(turn_id: impl Into<String>, payload: TurnPayload) -> Self {
        Self {
            turn_id: turn_id.into(),
            payload,
        }
    }
}

/// Emission handle given to a running turn.
///
/// Every event sent through the sink is tagged with the turn it was created
/// for, so events that outlive their turn can be recognised as stale.
#[derive(Debug, Clone)]
pub struct TurnEventSink {
    turn_id: String,
    tx: mpsc::Sender<TurnEvent>,
}

impl TurnEventSink {
    pub fn new(turn_id: impl Into<String>, tx: mpsc::Sender<TurnEvent>) -> Self {
        Self {
            turn_id: turn_id.into(),
            tx,
        }
    }

    pub fn turn_id(&self) -> &str {
        &self.turn_id
    }

    /// Emit an event. Returns `false` once the connection has gone away.
    pub async fn emit(&self, payload: TurnPayload) -> bool {
        self.tx
            .send(TurnEvent::new(self.turn_id.clone(), payload))
            .await
            .is_ok()
    }
}

// =============================================================================
// Traits
// =============================================================================

/// Contract between the turn scheduler and the speech/reasoning pipeline.
///
/// Implementations are shared between the scheduler task (audio forwarding)
/// and at most one turn task, so all methods take `&self`.
///
/// Cancellation is cooperative: `run_*` must watch `cancel`, stop producing
/// events once it fires (optionally emitting [`TurnPayload::Cancelled`]) and
/// return [`TurnOutcome::Cancelled`].
#[async_trait]
pub trait TurnProcessor: Send + Sync {
    /// Open an upstream audio stream for the next user turn.
    ///
    /// A stream opened before the previous one was consumed must not
    /// disturb it; user turns consume streams in the order they were opened.
    async fn start_stream(&self) -> ProcessorResult<()>;

    /// Forward one audio frame to the most recently opened stream.
    async fn submit_audio(&self, frame: AudioFrame) -> ProcessorResult<()>;

    /// Run a user turn over the buffered audio. Consumes the oldest stream.
    async fn run_user_turn(
        &self,
        request: UserTurnRequest,
        sink: TurnEventSink,
        cancel: CancellationToken,
    ) -> ProcessorResult<TurnOutcome>;

    /// Run a scripted (intro / summary) turn.
    async fn run_scripted_turn(
        &self,
        request: ScriptedTurnRequest,
        sink: TurnEventSink,
        cancel: CancellationToken,
    ) -> ProcessorResult<TurnOutcome>;

    /// Drop the most recently opened stream after a rejected frame.
    ///
    /// Streams already committed to a user turn must survive. The default
    /// tears everything down via [`TurnProcessor::close`].
    async fn discard_stream(&self) -> ProcessorResult<()> {
        self.close().await
    }

    /// Tear down the open stream and release upstream resources.
    async fn close(&self) -> ProcessorResult<()>;
}

/// Shared processor handle.
pub type SharedProcessor = Arc<dyn TurnProcessor>;

/// Creates one processor per accepted connection.
pub trait ProcessorFactory: Send + Sync {
    fn create(&self, session: &Session) -> ProcessorResult<SharedProcessor>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_sink_tags_events_with_turn_id() {
        let (tx, mut rx) = mpsc::channel(4);
        let sink = TurnEventSink::new("turn-1", tx);

        assert!(
            sink.emit(TurnPayload::AssistantTextDelta {
                text: "hi".to_string()
            })
            .await
        );

        let event = rx.recv().await.unwrap();
        assert_eq!(event.turn_id, "turn-1");
        assert_eq!(event.payload.event_type(), "assistant.text.delta");
    }

    #[tokio::test]
    async fn test_sink_reports_closed_connection() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let sink = TurnEventSink::new("turn-1", tx);
        assert!(!sink.emit(TurnPayload::AssistantAudioFinal).await);
    }

    #[test]
    fn test_processor_error_display() {
        let err = ProcessorError::StreamStartFailed("upstream refused".to_string());
        assert_eq!(err.to_string(), "Stream start failed: upstream refused");
        assert_eq!(ProcessorError::NotStreaming.to_string(), "No audio stream is open");
    }
}
