//! Per-connection turn bookkeeping.
//!
//! `ConnectionState` is owned by the scheduler task and never shared, so it
//! needs no locking. It tracks the active turn, the registry of turns whose
//! events may still be delivered, the suppression window used while a turn
//! unwinds, and the text accumulated for carryover capture.

use std::collections::HashMap;
use uuid::Uuid;

use super::carryover::truncate_carryover;
use super::messages::CancelReason;
use crate::core::session::Session;

/// What produced a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnKind {
    UserAudio,
    Intro { onboarding: bool },
    Summary,
}

impl TurnKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TurnKind::UserAudio => "user_audio",
            TurnKind::Intro { .. } => "intro",
            TurnKind::Summary => "summary",
        }
    }
}

/// The single turn currently allowed to stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveTurn {
    pub turn_id: String,
    pub turn_index: u64,
    pub epoch: u64,
    pub kind: TurnKind,
}

#[derive(Debug, Clone, Copy)]
pub(super) struct RegisteredTurn {
    pub turn_index: u64,
    pub epoch: u64,
}

/// Window during which a cancelled turn's events are dropped.
#[derive(Debug, Clone)]
pub(super) struct Suppression {
    pub turn_id: String,
    pub allow_cancelled_passthrough: bool,
    pub reason: CancelReason,
    pub cancelled_delivered: bool,
}

/// Result of unwinding a cancelled turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CancelledTurn {
    pub turn_id: String,
    pub turn_index: u64,
    /// The turn had not completed when it was cancelled
    pub interrupted: bool,
    /// Tail of the interrupted reply, if any text was produced
    pub carryover: Option<String>,
}

pub struct ConnectionState {
    pub session: Session,
    carryover_max_chars: usize,

    next_turn_index: u64,
    epoch: u64,
    last_completed_turn_index: u64,

    active: Option<ActiveTurn>,
    pub(super) turns: HashMap<String, RegisteredTurn>,
    pub(super) event_counters: HashMap<String, u64>,
    pub(super) accumulated_text: HashMap<String, Vec<String>>,
    pub(super) suppression: Option<Suppression>,
    pending_carryover: Option<String>,

    /// An upstream audio stream is open and accepting frames
    pub audio_stream_open: bool,
    pub intro_started: bool,
    pub auto_summary_started: bool,
    deferred_script: Option<TurnKind>,
}

impl ConnectionState {
    pub fn new(session: Session, carryover_max_chars: usize) -> Self {
        Self {
            session,
            carryover_max_chars,
            next_turn_index: 0,
            epoch: 0,
            last_completed_turn_index: 0,
            active: None,
            turns: HashMap::new(),
            event_counters: HashMap::new(),
            accumulated_text: HashMap::new(),
            suppression: None,
            pending_carryover: None,
            audio_stream_open: false,
            intro_started: false,
            auto_summary_started: false,
            deferred_script: None,
        }
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn last_completed_turn_index(&self) -> u64 {
        self.last_completed_turn_index
    }

    pub(super) fn mark_completed(&mut self, turn_index: u64) {
        self.last_completed_turn_index = self.last_completed_turn_index.max(turn_index);
    }

    pub fn active(&self) -> Option<&ActiveTurn> {
        self.active.as_ref()
    }

    pub fn is_active(&self, turn_id: &str) -> bool {
        self.active.as_ref().is_some_and(|t| t.turn_id == turn_id)
    }

    /// Number of turns whose events may still be delivered.
    pub fn registered_turns(&self) -> usize {
        self.turns.len()
    }

    /// Create and register a new active turn.
    ///
    /// Assigns the next turn index and advances the epoch. The caller must
    /// have retired any previous active turn.
    pub fn activate(&mut self, kind: TurnKind) -> ActiveTurn {
        debug_assert!(self.active.is_none(), "activating over a live turn");

        self.next_turn_index += 1;
        self.epoch += 1;

        let turn = ActiveTurn {
            turn_id: format!("turn_{}", Uuid::new_v4().simple()),
            turn_index: self.next_turn_index,
            epoch: self.epoch,
            kind,
        };

        self.turns.insert(
            turn.turn_id.clone(),
            RegisteredTurn {
                turn_index: turn.turn_index,
                epoch: turn.epoch,
            },
        );
        self.event_counters.insert(turn.turn_id.clone(), 0);
        self.accumulated_text.insert(turn.turn_id.clone(), Vec::new());
        self.active = Some(turn.clone());
        turn
    }

    /// Start dropping events from `turn_id` while it unwinds.
    ///
    /// With `allow_cancelled_passthrough`, the turn's own `turn.cancelled`
    /// is let through once, rewritten to carry `reason`.
    pub fn begin_suppression(
        &mut self,
        turn_id: &str,
        allow_cancelled_passthrough: bool,
        reason: CancelReason,
    ) {
        self.suppression = Some(Suppression {
            turn_id: turn_id.to_string(),
            allow_cancelled_passthrough,
            reason,
            cancelled_delivered: false,
        });
    }

    /// Close the suppression window. Returns whether a `turn.cancelled`
    /// passed through while it was open.
    pub fn end_suppression(&mut self) -> bool {
        self.suppression
            .take()
            .is_some_and(|s| s.cancelled_delivered)
    }

    /// Record the end of a cancelled turn's unwind.
    ///
    /// Captures carryover when the turn was interrupted before completing,
    /// and advances the epoch so later deliveries are distinguishable.
    pub fn finish_cancellation(&mut self, turn_id: &str) -> Option<CancelledTurn> {
        let turn_index = self.turns.get(turn_id)?.turn_index;
        let interrupted = turn_index > self.last_completed_turn_index;

        let carryover = if interrupted {
            self.take_carryover(turn_id)
        } else {
            None
        };
        if let Some(text) = &carryover {
            self.pending_carryover = Some(text.clone());
        }

        self.epoch += 1;

        Some(CancelledTurn {
            turn_id: turn_id.to_string(),
            turn_index,
            interrupted,
            carryover,
        })
    }

    fn take_carryover(&mut self, turn_id: &str) -> Option<String> {
        let fragments = self.accumulated_text.get_mut(turn_id)?;
        let text = fragments.concat();
        fragments.clear();
        truncate_carryover(&text, self.carryover_max_chars)
    }

    /// Consume the carryover waiting for the next user turn.
    pub fn take_pending_carryover(&mut self) -> Option<String> {
        self.pending_carryover.take()
    }

    pub fn pending_carryover(&self) -> Option<&str> {
        self.pending_carryover.as_deref()
    }

    /// Forget a turn. Its late events will be dropped as unknown.
    pub fn retire(&mut self, turn_id: &str) -> Option<ActiveTurn> {
        self.turns.remove(turn_id);
        self.event_counters.remove(turn_id);
        self.accumulated_text.remove(turn_id);

        if self.is_active(turn_id) {
            self.active.take()
        } else {
            None
        }
    }

    /// Remember a scripted turn that could not start because another turn
    /// was running. Only the latest one is kept.
    pub fn defer_script(&mut self, kind: TurnKind) {
        self.deferred_script = Some(kind);
    }

    pub fn has_deferred_script(&self) -> bool {
        self.deferred_script.is_some()
    }

    pub fn take_deferred_script(&mut self) -> Option<TurnKind> {
        self.deferred_script.take()
    }
}
