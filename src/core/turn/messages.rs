//! Realtime conversation message types
//!
//! This module defines every message exchanged over the conversation socket.
//! Both directions are tagged unions discriminated by the `type` field, so an
//! unknown or misspelled type is rejected at parse time instead of being
//! silently ignored.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::processor::{AudioFrame, TurnPayload};
use crate::core::session::LaunchMode;

/// Maximum decoded size of one audio frame (256 KB)
pub const MAX_AUDIO_FRAME_BYTES: usize = 256 * 1024;

/// Maximum size of a client-supplied cancel reason
pub const MAX_CANCEL_REASON_SIZE: usize = 256;

/// Accepted input sample rates
pub const MIN_SAMPLE_RATE_HZ: u32 = 8_000;
pub const MAX_SAMPLE_RATE_HZ: u32 = 48_000;

// =============================================================================
// Incoming Messages (Client -> Server)
// =============================================================================

/// Incoming WebSocket messages from client
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    /// Bind the connection to its session and kick off scripted turns
    #[serde(rename = "session.start")]
    SessionStart { session_id: String },

    /// One chunk of base64-encoded PCM16 audio
    #[serde(rename = "audio.frame")]
    AudioFrame {
        seq: u64,
        pcm16_b64: String,
        sample_rate_hz: u32,
        #[serde(default = "default_channels")]
        channels: u16,
    },

    /// End of utterance; starts a user turn
    #[serde(rename = "audio.commit")]
    AudioCommit {
        #[serde(default)]
        seq: Option<u64>,
    },

    /// Stop the in-flight response
    #[serde(rename = "response.cancel")]
    ResponseCancel {
        #[serde(default)]
        reason: Option<String>,
    },

    /// Graceful close
    #[serde(rename = "session.end")]
    SessionEnd,

    /// The client finished playing the onboarding intro
    #[serde(rename = "intro.ack")]
    IntroAck,
}

fn default_channels() -> u16 {
    1
}

// =============================================================================
// Outgoing Messages (Server -> Client)
// =============================================================================

/// Ordering metadata attached to every delivered turn-scoped message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct EventStamp {
    pub stream_epoch: u64,
    pub event_index: u64,
}

/// Error codes surfaced in `error` messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Malformed JSON, unknown type or missing fields
    InvalidMessage,
    /// Audio frame failed validation
    InvalidAudioFrame,
    /// `session.start` named a different session
    SessionMismatch,
    NoAudioBuffered,
    ReadOnlyMode,
    SummaryUnavailable,
    /// The processor could not open an audio stream
    VoiceStreamUnavailable,
    /// The processor refused a frame; the stream was reset
    AudioFrameRejected,
    TurnTaskFailed,
    IntroAckFailed,
    IdleTimeout,
}

impl ErrorCode {
    /// Whether resending the same request can succeed.
    pub fn retryable(&self) -> bool {
        matches!(
            self,
            ErrorCode::NoAudioBuffered
                | ErrorCode::AudioFrameRejected
                | ErrorCode::TurnTaskFailed
                | ErrorCode::IntroAckFailed
                | ErrorCode::IdleTimeout
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::InvalidMessage => "invalid_message",
            ErrorCode::InvalidAudioFrame => "invalid_audio_frame",
            ErrorCode::SessionMismatch => "session_mismatch",
            ErrorCode::NoAudioBuffered => "no_audio_buffered",
            ErrorCode::ReadOnlyMode => "read_only_mode",
            ErrorCode::SummaryUnavailable => "summary_unavailable",
            ErrorCode::VoiceStreamUnavailable => "voice_stream_unavailable",
            ErrorCode::AudioFrameRejected => "audio_frame_rejected",
            ErrorCode::TurnTaskFailed => "turn_task_failed",
            ErrorCode::IntroAckFailed => "intro_ack_failed",
            ErrorCode::IdleTimeout => "idle_timeout",
        }
    }
}

/// Why a response stopped early.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelReason {
    ClientRequest,
    Superseded,
    AlreadyCompleted,
    SessionEnded,
}

impl CancelReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CancelReason::ClientRequest => "client_request",
            CancelReason::Superseded => "superseded",
            CancelReason::AlreadyCompleted => "already_completed",
            CancelReason::SessionEnded => "session_ended",
        }
    }
}

/// Outgoing WebSocket messages to client
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    #[serde(rename = "session.ready")]
    SessionReady {
        session_id: String,
        user_id: String,
        chat_session_id: String,
        launch_mode: LaunchMode,
    },

    #[serde(rename = "turn.started")]
    TurnStarted {
        turn_id: String,
        turn_index: u64,
        #[serde(skip_serializing_if = "Option::is_none")]
        is_intro: Option<bool>,
        #[serde(skip_serializing_if = "Option::is_none")]
        is_onboarding_intro: Option<bool>,
        #[serde(flatten)]
        stamp: EventStamp,
    },

    #[serde(rename = "transcript.partial")]
    TranscriptPartial {
        turn_id: String,
        turn_index: u64,
        text: String,
        #[serde(flatten)]
        stamp: EventStamp,
    },

    #[serde(rename = "transcript.final")]
    TranscriptFinal {
        turn_id: String,
        turn_index: u64,
        text: String,
        #[serde(flatten)]
        stamp: EventStamp,
    },

    #[serde(rename = "assistant.text.delta")]
    AssistantTextDelta {
        turn_id: String,
        turn_index: u64,
        text: String,
        #[serde(flatten)]
        stamp: EventStamp,
    },

    #[serde(rename = "assistant.text.final")]
    AssistantTextFinal {
        turn_id: String,
        turn_index: u64,
        text: String,
        #[serde(flatten)]
        stamp: EventStamp,
    },

    #[serde(rename = "assistant.audio.chunk")]
    AssistantAudioChunk {
        turn_id: String,
        turn_index: u64,
        seq: u64,
        audio_b64: String,
        format: String,
        #[serde(flatten)]
        stamp: EventStamp,
    },

    #[serde(rename = "assistant.audio.final")]
    AssistantAudioFinal {
        turn_id: String,
        turn_index: u64,
        #[serde(flatten)]
        stamp: EventStamp,
    },

    #[serde(rename = "turn.completed")]
    TurnCompleted {
        turn_id: String,
        turn_index: u64,
        latency_ms: u64,
        transcript_chars: usize,
        response_chars: usize,
        model: String,
        #[serde(flatten)]
        stamp: EventStamp,
    },

    #[serde(rename = "turn.cancelled")]
    TurnCancelled {
        turn_id: String,
        turn_index: u64,
        reason: String,
        #[serde(flatten)]
        stamp: EventStamp,
    },

    /// Reply to `response.cancel`; `turn_id` is null when nothing was running
    #[serde(rename = "response.cancelled")]
    ResponseCancelled {
        turn_id: Option<String>,
        reason: CancelReason,
        rollback_turn_index: u64,
        continuation_hint_chars: usize,
        stream_epoch: u64,
    },

    #[serde(rename = "intro.acknowledged")]
    IntroAcknowledged { completed: bool },

    #[serde(rename = "error")]
    Error {
        code: ErrorCode,
        message: String,
        retryable: bool,
    },
}

impl ServerMessage {
    /// Build an error message; the retryable flag follows the code.
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        ServerMessage::Error {
            code,
            message: message.into(),
            retryable: code.retryable(),
        }
    }

    pub fn event_type(&self) -> &'static str {
        match self {
            ServerMessage::SessionReady { .. } => "session.ready",
            ServerMessage::TurnStarted { .. } => "turn.started",
            ServerMessage::TranscriptPartial { .. } => "transcript.partial",
            ServerMessage::TranscriptFinal { .. } => "transcript.final",
            ServerMessage::AssistantTextDelta { .. } => "assistant.text.delta",
            ServerMessage::AssistantTextFinal { .. } => "assistant.text.final",
            ServerMessage::AssistantAudioChunk { .. } => "assistant.audio.chunk",
            ServerMessage::AssistantAudioFinal { .. } => "assistant.audio.final",
            ServerMessage::TurnCompleted { .. } => "turn.completed",
            ServerMessage::TurnCancelled { .. } => "turn.cancelled",
            ServerMessage::ResponseCancelled { .. } => "response.cancelled",
            ServerMessage::IntroAcknowledged { .. } => "intro.acknowledged",
            ServerMessage::Error { .. } => "error",
        }
    }

    /// Build the wire message for a stamped turn event.
    pub fn from_turn_event(
        turn_id: String,
        turn_index: u64,
        payload: TurnPayload,
        stamp: EventStamp,
    ) -> Self {
        match payload {
            TurnPayload::Started {
                is_intro,
                is_onboarding_intro,
            } => ServerMessage::TurnStarted {
                turn_id,
                turn_index,
                is_intro,
                is_onboarding_intro,
                stamp,
            },
            TurnPayload::TranscriptPartial { text } => ServerMessage::TranscriptPartial {
                turn_id,
                turn_index,
                text,
                stamp,
            },
            TurnPayload::TranscriptFinal { text } => ServerMessage::TranscriptFinal {
                turn_id,
                turn_index,
                text,
                stamp,
            },
            TurnPayload::AssistantTextDelta { text } => ServerMessage::AssistantTextDelta {
                turn_id,
                turn_index,
                text,
                stamp,
            },
            TurnPayload::AssistantTextFinal { text } => ServerMessage::AssistantTextFinal {
                turn_id,
                turn_index,
                text,
                stamp,
            },
            TurnPayload::AssistantAudioChunk {
                seq,
                audio_b64,
                format,
            } => ServerMessage::AssistantAudioChunk {
                turn_id,
                turn_index,
                seq,
                audio_b64,
                format,
                stamp,
            },
            TurnPayload::AssistantAudioFinal => ServerMessage::AssistantAudioFinal {
                turn_id,
                turn_index,
                stamp,
            },
            TurnPayload::Completed {
                latency_ms,
                transcript_chars,
                response_chars,
                model,
            } => ServerMessage::TurnCompleted {
                turn_id,
                turn_index,
                latency_ms,
                transcript_chars,
                response_chars,
                model,
                stamp,
            },
            TurnPayload::Cancelled { reason } => ServerMessage::TurnCancelled {
                turn_id,
                turn_index,
                reason: reason.unwrap_or_else(|| "cancelled".to_string()),
                stamp,
            },
        }
    }
}

// =============================================================================
// Message Routing
// =============================================================================

/// Work items for the connection's sender task
#[derive(Debug, Clone, PartialEq)]
pub enum MessageRoute {
    /// JSON text message
    Outgoing(ServerMessage),
    /// Close the socket with a code
    Close { code: u16, reason: String },
}

// =============================================================================
// Validation
// =============================================================================

/// Error type for inbound message validation failures
#[derive(Debug, Error)]
pub enum MessageValidationError {
    #[error("Invalid message format: {0}")]
    Malformed(String),

    #[error("Cancel reason too large: {size} bytes (max: {max} bytes)")]
    ReasonTooLarge { size: usize, max: usize },

    #[error("Audio payload is not valid base64: {0}")]
    InvalidAudioEncoding(String),

    #[error("Audio payload has an odd byte count ({0}); expected PCM16 samples")]
    TruncatedSample(usize),

    #[error("Audio frame too large: {size} bytes (max: {max} bytes)")]
    FrameTooLarge { size: usize, max: usize },

    #[error("Unsupported channel count: {0} (only mono is accepted)")]
    UnsupportedChannels(u16),

    #[error("Unsupported sample rate: {0} Hz")]
    UnsupportedSampleRate(u32),
}

impl MessageValidationError {
    pub fn code(&self) -> ErrorCode {
        match self {
            MessageValidationError::Malformed(_) | MessageValidationError::ReasonTooLarge { .. } => {
                ErrorCode::InvalidMessage
            }
            _ => ErrorCode::InvalidAudioFrame,
        }
    }
}

impl ClientMessage {
    /// Validates message field sizes to prevent resource exhaustion attacks.
    pub fn validate_size(&self) -> Result<(), MessageValidationError> {
        match self {
            ClientMessage::ResponseCancel {
                reason: Some(reason),
            } if reason.len() > MAX_CANCEL_REASON_SIZE => {
                Err(MessageValidationError::ReasonTooLarge {
                    size: reason.len(),
                    max: MAX_CANCEL_REASON_SIZE,
                })
            }
            ClientMessage::AudioFrame { pcm16_b64, .. }
                if pcm16_b64.len() > encoded_len_limit() =>
            {
                Err(MessageValidationError::FrameTooLarge {
                    size: pcm16_b64.len() / 4 * 3,
                    max: MAX_AUDIO_FRAME_BYTES,
                })
            }
            _ => Ok(()),
        }
    }
}

fn encoded_len_limit() -> usize {
    MAX_AUDIO_FRAME_BYTES.div_ceil(3) * 4
}

/// Parse and size-check one text frame.
pub fn parse_client_message(text: &str) -> Result<ClientMessage, MessageValidationError> {
    let message: ClientMessage = serde_json::from_str(text)
        .map_err(|e| MessageValidationError::Malformed(e.to_string()))?;
    message.validate_size()?;
    Ok(message)
}

/// Decode and validate the fields of an `audio.frame` message.
pub fn decode_audio_frame(
    seq: u64,
    pcm16_b64: &str,
    sample_rate_hz: u32,
    channels: u16,
) -> Result<AudioFrame, MessageValidationError> {
    if channels != 1 {
        return Err(MessageValidationError::UnsupportedChannels(channels));
    }
    if !(MIN_SAMPLE_RATE_HZ..=MAX_SAMPLE_RATE_HZ).contains(&sample_rate_hz) {
        return Err(MessageValidationError::UnsupportedSampleRate(sample_rate_hz));
    }

    let pcm = BASE64
        .decode(pcm16_b64)
        .map_err(|e| MessageValidationError::InvalidAudioEncoding(e.to_string()))?;
    if pcm.len() > MAX_AUDIO_FRAME_BYTES {
        return Err(MessageValidationError::FrameTooLarge {
            size: pcm.len(),
            max: MAX_AUDIO_FRAME_BYTES,
        });
    }
    if pcm.len() % 2 != 0 {
        return Err(MessageValidationError::TruncatedSample(pcm.len()));
    }

    Ok(AudioFrame {
        seq,
        pcm: Bytes::from(pcm),
        sample_rate_hz,
        channels,
    })
}
