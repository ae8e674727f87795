//! Per-connection turn scheduler.
//!
//! The scheduler task owns the connection's [`ConnectionState`] and runs a
//! single select loop over three sources:
//!
//! - inbound client messages
//! - events emitted by the running turn task
//! - completion of the running turn task
//!
//! At most one turn task exists at a time. Replacing a turn always cancels
//! the old one and awaits its full unwind before the new one is spawned.

use bytes::Bytes;
use futures::{Stream, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::carryover::DEFAULT_CARRYOVER_MAX_CHARS;
use super::messages::{
    CancelReason, ClientMessage, ErrorCode, MessageRoute, ServerMessage, decode_audio_frame,
    parse_client_message,
};
use super::state::{ActiveTurn, CancelledTurn, ConnectionState, TurnKind};
use crate::core::processor::{
    ProcessorResult, Script, ScriptedTurnRequest, SharedProcessor, TurnEvent, TurnEventSink,
    TurnOutcome, TurnPayload, UserTurnRequest,
};
use crate::core::session::{Session, SessionDirectory};

/// Close code for a client-requested end of session
pub const CLOSE_NORMAL: u16 = 1000;
/// Close code for an idle connection
pub const CLOSE_GOING_AWAY: u16 = 1001;

/// Default capacity of the turn event channel
pub const DEFAULT_EVENT_BUFFER_SIZE: usize = 1024;

/// Default idle timeout (5 minutes)
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// Tunables for one scheduler instance.
#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub carryover_max_chars: usize,
    /// Capacity of the channel between turn tasks and the scheduler
    pub event_buffer_size: usize,
    /// `None` disables the idle timeout
    pub idle_timeout: Option<Duration>,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            carryover_max_chars: DEFAULT_CARRYOVER_MAX_CHARS,
            event_buffer_size: DEFAULT_EVENT_BUFFER_SIZE,
            idle_timeout: Some(DEFAULT_IDLE_TIMEOUT),
        }
    }
}

/// One inbound transport frame.
#[derive(Debug, Clone)]
pub enum Inbound {
    Text(String),
    Binary(Bytes),
    Closed,
}

/// Why the scheduler loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerExit {
    /// Client sent `session.end`
    SessionEnded,
    /// Transport closed or the inbound stream ended
    Disconnected,
    IdleTimeout,
    /// The outbound channel went away
    SendFailed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CancelMode {
    ClientRequest,
    Supersede,
    /// Teardown; nothing is reported to the client
    Silent,
}

impl CancelMode {
    fn reason(self) -> CancelReason {
        match self {
            CancelMode::ClientRequest => CancelReason::ClientRequest,
            CancelMode::Supersede => CancelReason::Superseded,
            CancelMode::Silent => CancelReason::SessionEnded,
        }
    }
}

struct RunningTurn {
    turn_id: String,
    cancel: CancellationToken,
    handle: JoinHandle<ProcessorResult<TurnOutcome>>,
}

enum Wake {
    Event(Option<TurnEvent>),
    TurnDone(Result<ProcessorResult<TurnOutcome>, JoinError>),
    Inbound(Option<Inbound>),
    Idle,
}

enum Unwind {
    Event(TurnEvent),
    Done(Result<ProcessorResult<TurnOutcome>, JoinError>),
}

enum Flow {
    Continue,
    End,
}

pub struct TurnScheduler {
    state: ConnectionState,
    processor: SharedProcessor,
    directory: Arc<dyn SessionDirectory>,
    outbound: mpsc::Sender<MessageRoute>,
    events_tx: mpsc::Sender<TurnEvent>,
    events_rx: mpsc::Receiver<TurnEvent>,
    running: Option<RunningTurn>,
    idle_timeout: Option<Duration>,
    send_failed: bool,
}

impl TurnScheduler {
    pub fn new(
        session: Session,
        processor: SharedProcessor,
        directory: Arc<dyn SessionDirectory>,
        outbound: mpsc::Sender<MessageRoute>,
        settings: SchedulerSettings,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::channel(settings.event_buffer_size.max(1));
        Self {
            state: ConnectionState::new(session, settings.carryover_max_chars),
            processor,
            directory,
            outbound,
            events_tx,
            events_rx,
            running: None,
            idle_timeout: settings.idle_timeout,
            send_failed: false,
        }
    }

    /// Drive the connection until the client ends it, disconnects or idles out.
    pub async fn run<S>(mut self, mut inbound: S) -> SchedulerExit
    where
        S: Stream<Item = Inbound> + Unpin + Send,
    {
        let session_id = self.state.session.session_id.clone();
        info!(session_id = %session_id, "Turn scheduler started");

        let mut last_activity = Instant::now();
        let exit = loop {
            if self.send_failed {
                break SchedulerExit::SendFailed;
            }

            let idle_deadline = match (&self.running, self.idle_timeout) {
                (None, Some(timeout)) => Some(last_activity + timeout),
                _ => None,
            };

            // Client frames first: a barge-in must not queue behind turn output
            let wake = tokio::select! {
                biased;
                frame = inbound.next() => Wake::Inbound(frame),
                event = self.events_rx.recv() => Wake::Event(event),
                joined = join_running(&mut self.running) => Wake::TurnDone(joined),
                _ = sleep_until(idle_deadline) => Wake::Idle,
            };

            match wake {
                Wake::Event(Some(event)) => self.deliver(event).await,
                Wake::Event(None) => {}
                Wake::TurnDone(joined) => {
                    self.on_turn_finished(joined).await;
                    last_activity = Instant::now();
                }
                Wake::Inbound(Some(Inbound::Text(text))) => {
                    last_activity = Instant::now();
                    if let Flow::End = self.on_text(&text).await {
                        break SchedulerExit::SessionEnded;
                    }
                }
                Wake::Inbound(Some(Inbound::Binary(data))) => {
                    last_activity = Instant::now();
                    debug!(session_id = %session_id, len = data.len(), "Rejecting binary frame");
                    self.send_error(
                        ErrorCode::InvalidMessage,
                        "Binary frames are not supported; send audio as audio.frame JSON",
                    )
                    .await;
                }
                Wake::Inbound(Some(Inbound::Closed)) | Wake::Inbound(None) => {
                    break SchedulerExit::Disconnected;
                }
                Wake::Idle => {
                    info!(session_id = %session_id, "Closing idle connection");
                    self.send_error(ErrorCode::IdleTimeout, "Connection idle for too long")
                        .await;
                    break SchedulerExit::IdleTimeout;
                }
            }
        };

        self.shutdown(exit).await;
        info!(session_id = %session_id, exit = ?exit, "Turn scheduler stopped");
        exit
    }

    // =========================================================================
    // Dispatch
    // =========================================================================

    async fn on_text(&mut self, text: &str) -> Flow {
        let message = match parse_client_message(text) {
            Ok(message) => message,
            Err(e) => {
                warn!(session_id = %self.state.session.session_id, error = %e, "Invalid client message");
                self.send_error(e.code(), e.to_string()).await;
                return Flow::Continue;
            }
        };

        match message {
            ClientMessage::SessionStart { session_id } => self.on_session_start(&session_id).await,
            ClientMessage::AudioFrame {
                seq,
                pcm16_b64,
                sample_rate_hz,
                channels,
            } => {
                self.on_audio_frame(seq, &pcm16_b64, sample_rate_hz, channels)
                    .await
            }
            ClientMessage::AudioCommit { seq } => self.on_audio_commit(seq).await,
            ClientMessage::ResponseCancel { reason } => self.on_response_cancel(reason).await,
            ClientMessage::IntroAck => self.on_intro_ack().await,
            ClientMessage::SessionEnd => return Flow::End,
        }
        Flow::Continue
    }

    async fn on_session_start(&mut self, declared: &str) {
        if declared != self.state.session.session_id {
            warn!(
                session_id = %self.state.session.session_id,
                declared = %declared,
                "session.start for a different session"
            );
            self.send_error(
                ErrorCode::SessionMismatch,
                format!("Connection is bound to a different session than '{declared}'"),
            )
            .await;
            return;
        }

        if self.state.session.pending_intro {
            self.maybe_start_intro().await;
        } else if self.state.session.owes_auto_summary() && !self.state.auto_summary_started {
            self.maybe_start_auto_summary().await;
        } else if self.state.session.read_only && self.state.session.summary_text().is_none() {
            self.send_error(
                ErrorCode::SummaryUnavailable,
                "No summary is available for this read-only session",
            )
            .await;
        }
    }

    async fn on_audio_frame(
        &mut self,
        seq: u64,
        pcm16_b64: &str,
        sample_rate_hz: u32,
        channels: u16,
    ) {
        if self.state.session.read_only {
            self.send_error(ErrorCode::ReadOnlyMode, "Audio input is disabled for this session")
                .await;
            return;
        }

        let frame = match decode_audio_frame(seq, pcm16_b64, sample_rate_hz, channels) {
            Ok(frame) => frame,
            Err(e) => {
                debug!(seq, error = %e, "Rejecting audio frame");
                self.send_error(e.code(), e.to_string()).await;
                return;
            }
        };

        if !self.state.audio_stream_open {
            if let Err(e) = self.processor.start_stream().await {
                warn!(session_id = %self.state.session.session_id, error = %e, "Failed to start audio stream");
                self.send_error(ErrorCode::VoiceStreamUnavailable, e.to_string())
                    .await;
                return;
            }
            debug!(session_id = %self.state.session.session_id, "Audio stream opened");
            self.state.audio_stream_open = true;
        }

        if let Err(e) = self.processor.submit_audio(frame).await {
            warn!(session_id = %self.state.session.session_id, seq, error = %e, "Audio frame rejected; resetting stream");
            if let Err(discard_err) = self.processor.discard_stream().await {
                warn!(error = %discard_err, "Failed to discard audio stream after rejected frame");
            }
            self.state.audio_stream_open = false;
            self.send_error(ErrorCode::AudioFrameRejected, e.to_string())
                .await;
        }
    }

    async fn on_audio_commit(&mut self, seq: Option<u64>) {
        if self.state.session.read_only {
            self.send_error(ErrorCode::ReadOnlyMode, "Audio input is disabled for this session")
                .await;
            return;
        }
        if !self.state.audio_stream_open {
            self.send_error(ErrorCode::NoAudioBuffered, "No audio has been buffered to commit")
                .await;
            return;
        }
        self.state.audio_stream_open = false;

        self.cancel_active(CancelMode::Supersede).await;

        let turn = self.activate(TurnKind::UserAudio).await;
        let carryover = self.state.take_pending_carryover();
        debug!(
            turn_id = %turn.turn_id,
            commit_seq = ?seq,
            carryover_chars = carryover.as_deref().map_or(0, |c| c.chars().count()),
            "Starting user turn"
        );

        let request = UserTurnRequest {
            turn_id: turn.turn_id.clone(),
            turn_index: turn.turn_index,
            carryover,
        };
        let processor = Arc::clone(&self.processor);
        let sink = self.sink_for(&turn);
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let handle =
            tokio::spawn(async move { processor.run_user_turn(request, sink, token).await });
        self.running = Some(RunningTurn {
            turn_id: turn.turn_id,
            cancel,
            handle,
        });
    }

    async fn on_response_cancel(&mut self, reason: Option<String>) {
        debug!(session_id = %self.state.session.session_id, client_reason = ?reason, "response.cancel");

        let reply = match self.cancel_active(CancelMode::ClientRequest).await {
            None => ServerMessage::ResponseCancelled {
                turn_id: None,
                reason: CancelReason::AlreadyCompleted,
                rollback_turn_index: self.state.last_completed_turn_index(),
                continuation_hint_chars: 0,
                stream_epoch: self.state.epoch(),
            },
            // Completed but not yet joined: nothing left to cancel
            Some(cancelled) if !cancelled.interrupted => ServerMessage::ResponseCancelled {
                turn_id: None,
                reason: CancelReason::AlreadyCompleted,
                rollback_turn_index: self.state.last_completed_turn_index(),
                continuation_hint_chars: 0,
                stream_epoch: self.state.epoch(),
            },
            Some(cancelled) => ServerMessage::ResponseCancelled {
                reason: CancelReason::ClientRequest,
                continuation_hint_chars: cancelled
                    .carryover
                    .as_deref()
                    .map_or(0, |c| c.chars().count()),
                turn_id: Some(cancelled.turn_id),
                rollback_turn_index: self.state.last_completed_turn_index(),
                stream_epoch: self.state.epoch(),
            },
        };
        self.send(reply).await;

        self.resume_deferred_script().await;
    }

    async fn on_intro_ack(&mut self) {
        let user_id = self.state.session.user_id.clone();
        match self.directory.complete_onboarding(&user_id).await {
            Ok(completed) => {
                info!(user_id = %user_id, completed, "Intro acknowledged");
                self.state.session.pending_intro = false;
                self.send(ServerMessage::IntroAcknowledged { completed }).await;
                self.maybe_start_auto_summary().await;
            }
            Err(e) => {
                warn!(user_id = %user_id, error = %e, "Failed to record onboarding completion");
                self.send_error(ErrorCode::IntroAckFailed, e.to_string()).await;
            }
        }
    }

    // =========================================================================
    // Scripted turns
    // =========================================================================

    async fn maybe_start_intro(&mut self) {
        if !self.state.session.pending_intro || self.state.intro_started {
            return;
        }
        let onboarding = self.state.session.is_onboarding_intro;
        self.start_scripted(TurnKind::Intro { onboarding }).await;
    }

    async fn maybe_start_auto_summary(&mut self) {
        if self.state.auto_summary_started
            || self.state.session.pending_intro
            || !self.state.session.owes_auto_summary()
        {
            return;
        }
        self.start_scripted(TurnKind::Summary).await;
    }

    async fn start_scripted(&mut self, kind: TurnKind) {
        if self.running.is_some() {
            debug!(kind = kind.as_str(), "Deferring scripted turn until the active turn retires");
            self.state.defer_script(kind);
            return;
        }

        let script = match kind {
            TurnKind::Intro { onboarding } => {
                self.state.intro_started = true;
                Script::Intro { onboarding }
            }
            TurnKind::Summary => {
                let Some(text) = self.state.session.summary_text().map(str::to_string) else {
                    return;
                };
                self.state.auto_summary_started = true;
                Script::Summary {
                    title: self
                        .state
                        .session
                        .content_context
                        .as_ref()
                        .and_then(|ctx| ctx.title.clone()),
                    text,
                }
            }
            TurnKind::UserAudio => return,
        };

        let turn = self.activate(kind).await;
        let request = ScriptedTurnRequest {
            turn_id: turn.turn_id.clone(),
            turn_index: turn.turn_index,
            script,
        };
        let processor = Arc::clone(&self.processor);
        let sink = self.sink_for(&turn);
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let handle =
            tokio::spawn(async move { processor.run_scripted_turn(request, sink, token).await });
        self.running = Some(RunningTurn {
            turn_id: turn.turn_id,
            cancel,
            handle,
        });
    }

    async fn resume_deferred_script(&mut self) {
        if self.running.is_some() {
            return;
        }
        match self.state.take_deferred_script() {
            Some(TurnKind::Intro { .. }) => self.maybe_start_intro().await,
            Some(TurnKind::Summary) => self.maybe_start_auto_summary().await,
            Some(TurnKind::UserAudio) | None => {}
        }
    }

    // =========================================================================
    // Turn lifecycle
    // =========================================================================

    async fn activate(&mut self, kind: TurnKind) -> ActiveTurn {
        let turn = self.state.activate(kind);
        info!(
            session_id = %self.state.session.session_id,
            turn_id = %turn.turn_id,
            turn_index = turn.turn_index,
            epoch = turn.epoch,
            kind = kind.as_str(),
            "Turn activated"
        );

        let (is_intro, is_onboarding_intro) = match kind {
            TurnKind::Intro { onboarding } => (Some(true), Some(onboarding)),
            _ => (None, None),
        };
        self.deliver(TurnEvent::new(
            turn.turn_id.clone(),
            TurnPayload::Started {
                is_intro,
                is_onboarding_intro,
            },
        ))
        .await;
        turn
    }

    fn sink_for(&self, turn: &ActiveTurn) -> TurnEventSink {
        TurnEventSink::new(turn.turn_id.clone(), self.events_tx.clone())
    }

    async fn on_turn_finished(&mut self, joined: Result<ProcessorResult<TurnOutcome>, JoinError>) {
        let Some(running) = self.running.take() else {
            return;
        };
        self.drain_events().await;

        let outcome = match joined {
            Ok(Ok(outcome)) => Some(outcome),
            Ok(Err(e)) => {
                warn!(turn_id = %running.turn_id, error = %e, "Turn failed");
                self.send_error(ErrorCode::TurnTaskFailed, e.to_string()).await;
                None
            }
            Err(e) => {
                error!(turn_id = %running.turn_id, error = %e, "Turn task aborted");
                self.send_error(ErrorCode::TurnTaskFailed, "Turn task terminated unexpectedly")
                    .await;
                None
            }
        };

        let retired = self.retire(&running.turn_id);
        debug!(turn_id = %running.turn_id, outcome = ?outcome, "Turn retired");

        let completed_intro = matches!(
            (retired, outcome),
            (Some(TurnKind::Intro { .. }), Some(TurnOutcome::Completed))
        );

        if self.state.has_deferred_script() {
            self.resume_deferred_script().await;
        } else if completed_intro {
            self.maybe_start_auto_summary().await;
        }
    }

    /// Release the turn's bookkeeping and return its kind.
    ///
    /// A returning-user intro needs no acknowledgement and plays at most
    /// once, so retiring it settles `pending_intro` however it ended.
    fn retire(&mut self, turn_id: &str) -> Option<TurnKind> {
        let kind = self.state.retire(turn_id).map(|turn| turn.kind);
        if kind == Some(TurnKind::Intro { onboarding: false }) {
            self.state.session.pending_intro = false;
        }
        kind
    }

    /// Cancel the running turn and wait for it to unwind.
    ///
    /// Returns `None` when nothing was running.
    async fn cancel_active(&mut self, mode: CancelMode) -> Option<CancelledTurn> {
        let running = self.running.take()?;
        let turn_id = running.turn_id;
        let reason = mode.reason();

        self.state.begin_suppression(
            &turn_id,
            mode == CancelMode::ClientRequest,
            reason,
        );
        running.cancel.cancel();

        match self.await_unwind(running.handle).await {
            Ok(Ok(outcome)) => debug!(turn_id = %turn_id, outcome = ?outcome, "Cancelled turn unwound"),
            Ok(Err(e)) => debug!(turn_id = %turn_id, error = %e, "Cancelled turn unwound with error"),
            Err(e) => warn!(turn_id = %turn_id, error = %e, "Cancelled turn task aborted"),
        }

        let cancelled_delivered = self.state.end_suppression();
        let cancelled = self.state.finish_cancellation(&turn_id);

        if let Some(cancelled) = &cancelled {
            info!(
                session_id = %self.state.session.session_id,
                turn_id = %turn_id,
                turn_index = cancelled.turn_index,
                interrupted = cancelled.interrupted,
                carryover_chars = cancelled.carryover.as_deref().map_or(0, |c| c.chars().count()),
                reason = reason.as_str(),
                "Turn cancelled"
            );
            if mode != CancelMode::Silent && cancelled.interrupted && !cancelled_delivered {
                self.deliver(TurnEvent::new(
                    turn_id.clone(),
                    TurnPayload::Cancelled {
                        reason: Some(reason.as_str().to_string()),
                    },
                ))
                .await;
            }
        }

        self.retire(&turn_id);
        cancelled
    }

    /// Await a cancelled task while still draining its events, so a task
    /// blocked on a full event channel can make progress.
    async fn await_unwind(
        &mut self,
        mut handle: JoinHandle<ProcessorResult<TurnOutcome>>,
    ) -> Result<ProcessorResult<TurnOutcome>, JoinError> {
        loop {
            let step = tokio::select! {
                biased;
                joined = &mut handle => Unwind::Done(joined),
                Some(event) = self.events_rx.recv() => Unwind::Event(event),
            };
            match step {
                Unwind::Event(event) => self.deliver(event).await,
                Unwind::Done(joined) => {
                    self.drain_events().await;
                    return joined;
                }
            }
        }
    }

    async fn drain_events(&mut self) {
        while let Ok(event) = self.events_rx.try_recv() {
            self.deliver(event).await;
        }
    }

    async fn shutdown(&mut self, exit: SchedulerExit) {
        self.cancel_active(CancelMode::Silent).await;
        if let Err(e) = self.processor.close().await {
            warn!(session_id = %self.state.session.session_id, error = %e, "Failed to close processor");
        }

        let close = match exit {
            SchedulerExit::SessionEnded => Some((CLOSE_NORMAL, "session ended")),
            SchedulerExit::IdleTimeout => Some((CLOSE_GOING_AWAY, "idle timeout")),
            SchedulerExit::Disconnected | SchedulerExit::SendFailed => None,
        };
        if let Some((code, reason)) = close {
            let _ = self
                .outbound
                .send(MessageRoute::Close {
                    code,
                    reason: reason.to_string(),
                })
                .await;
        }
    }

    // =========================================================================
    // Outbound
    // =========================================================================

    async fn deliver(&mut self, event: TurnEvent) {
        if let Some(message) = self.state.admit(event) {
            self.send(message).await;
        }
    }

    async fn send(&mut self, message: ServerMessage) {
        if self
            .outbound
            .send(MessageRoute::Outgoing(message))
            .await
            .is_err()
        {
            self.send_failed = true;
        }
    }

    async fn send_error(&mut self, code: ErrorCode, message: impl Into<String>) {
        self.send(ServerMessage::error(code, message)).await;
    }
}

async fn join_running(
    running: &mut Option<RunningTurn>,
) -> Result<ProcessorResult<TurnOutcome>, JoinError> {
    match running.as_mut() {
        Some(turn) => (&mut turn.handle).await,
        None => std::future::pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
