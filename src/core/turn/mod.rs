//! Turn orchestration.
//!
//! This module drives the lifecycle of conversation turns on one connection:
//! activation, streaming of processor events to the client, barge-in
//! cancellation with carryover capture, and sequencing of scripted intro and
//! summary turns.
//!
//! # Architecture
//!
//! - [`TurnScheduler`]: per-connection select loop and message dispatch
//! - [`ConnectionState`]: the single owned record of turn bookkeeping
//! - `filter`: staleness filter stamping and dropping turn events
//! - [`truncate_carryover`]: bounded continuation text

pub mod carryover;
mod filter;
pub mod messages;
pub mod scheduler;
pub mod state;

pub use carryover::{DEFAULT_CARRYOVER_MAX_CHARS, truncate_carryover};
pub use messages::{
    CancelReason, ClientMessage, ErrorCode, EventStamp, MessageRoute, MessageValidationError,
    ServerMessage, parse_client_message,
};
pub use scheduler::{
    CLOSE_GOING_AWAY, CLOSE_NORMAL, DEFAULT_EVENT_BUFFER_SIZE, DEFAULT_IDLE_TIMEOUT, Inbound,
    SchedulerExit, SchedulerSettings, TurnScheduler,
};
pub use state::{ActiveTurn, CancelledTurn, ConnectionState, TurnKind};
