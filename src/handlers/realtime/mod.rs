//! Realtime conversation WebSocket handler
//!
//! Performs the connection handshake and hands the socket to a
//! [`TurnScheduler`](crate::core::turn::TurnScheduler).
//!
//! # Handshake
//!
//! 1. `GET /realtime?session_id=<id>` upgrades to a WebSocket
//! 2. Rejected authentication closes with `4401`
//! 3. Unknown session (or a session owned by another client) closes with `4404`
//! 4. Directory or processor failures close with `1011`
//! 5. Otherwise the server sends `session.ready` and the scheduler takes over
//!
//! # Protocol
//!
//! ## Client → Server
//!
//! - **session.start**: Start the conversation (triggers intro/summary turns)
//! - **audio.frame**: Base64 PCM16 audio
//! - **audio.commit**: End of user utterance, starts a turn
//! - **response.cancel**: Barge-in; cancels the running turn
//! - **intro.ack**: Client finished playing the intro
//! - **session.end**: Close the conversation
//!
//! ## Server → Client
//!
//! - **session.ready**, **turn.started**, **transcript.partial/final**
//! - **assistant.text.delta/final**, **assistant.audio.chunk/final**
//! - **turn.completed**, **turn.cancelled**, **response.cancelled**
//! - **intro.acknowledged**, **error**

mod handler;

pub use handler::{
    CLOSE_AUTH_REQUIRED, CLOSE_INTERNAL_ERROR, CLOSE_SESSION_NOT_FOUND, RealtimeQuery,
    realtime_handler,
};
