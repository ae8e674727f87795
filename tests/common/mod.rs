//! Shared test fixtures
//!
//! A deterministic [`FakeProcessor`] whose turns can be held open, failed or
//! panicked on demand, and a [`SchedulerHarness`] that drives a
//! [`TurnScheduler`] through in-memory channels.

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use futures::channel::mpsc as futures_mpsc;
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use parley_gateway::core::processor::{
    AudioFrame, ProcessorError, ProcessorResult, Script, ScriptedTurnRequest, TurnEventSink,
    TurnOutcome, TurnPayload, TurnProcessor, UserTurnRequest,
};
use parley_gateway::core::session::{InMemorySessionDirectory, Session, SessionDirectory};
use parley_gateway::core::turn::{
    Inbound, MessageRoute, SchedulerExit, SchedulerSettings, TurnScheduler,
};

/// How long a test waits for one outbound message
pub const RECV_TIMEOUT: Duration = Duration::from_secs(5);

pub const FAKE_MODEL: &str = "fake-model";

/// Reply streamed by every user turn, one delta per fragment
pub const REPLY_FRAGMENTS: [&str; 3] = ["The forecast ", "for tomorrow ", "is sunny and warm."];

pub fn reply_text() -> String {
    REPLY_FRAGMENTS.concat()
}

/// Decrements the running counter even when the turn future is dropped or panics.
struct RunningGuard<'a>(&'a AtomicUsize);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Permits that let held turns continue.
struct ReleaseGate(Semaphore);

impl Default for ReleaseGate {
    fn default() -> Self {
        Self(Semaphore::new(0))
    }
}

#[derive(Default)]
pub struct FakeProcessor {
    /// Hold user turns after streaming the reply deltas
    pub hold_user_turns: AtomicBool,
    /// Hold scripted turns after streaming their text
    pub hold_scripted_turns: AtomicBool,
    /// Keep the task alive after `turn.completed` until cancelled or released
    pub linger_after_completion: AtomicBool,
    /// Emit a processor-side `turn.cancelled` when cancelled
    pub emit_cancelled: AtomicBool,
    pub fail_start_stream: AtomicBool,
    pub fail_submit: AtomicBool,
    pub fail_turn: AtomicBool,
    pub panic_turn: AtomicBool,
    /// Audio chunks a user turn emits back to back before its reply
    pub flood_audio_chunks: AtomicUsize,

    release: ReleaseGate,

    pub running: AtomicUsize,
    pub max_running: AtomicUsize,
    pub streams_started: AtomicUsize,
    pub frames_submitted: AtomicUsize,
    pub user_turns: AtomicUsize,
    pub discarded: AtomicUsize,
    pub closed: AtomicUsize,
    pub carryovers: Mutex<Vec<Option<String>>>,
    pub scripts: Mutex<Vec<Script>>,
}

impl FakeProcessor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Hold every turn open until it is cancelled or released.
    pub fn holding() -> Arc<Self> {
        let processor = Self::default();
        processor.hold_user_turns.store(true, Ordering::SeqCst);
        processor.hold_scripted_turns.store(true, Ordering::SeqCst);
        Arc::new(processor)
    }

    /// Let one held turn continue.
    pub fn release_one(&self) {
        self.release.0.add_permits(1);
    }

    pub fn max_running(&self) -> usize {
        self.max_running.load(Ordering::SeqCst)
    }

    pub fn scripts(&self) -> Vec<Script> {
        self.scripts.lock().clone()
    }

    pub fn carryovers(&self) -> Vec<Option<String>> {
        self.carryovers.lock().clone()
    }

    fn enter(&self) -> RunningGuard<'_> {
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_running.fetch_max(now, Ordering::SeqCst);
        RunningGuard(&self.running)
    }

    /// Wait for a release permit. Returns `false` when cancelled first.
    async fn hold(&self, cancel: &CancellationToken) -> bool {
        tokio::select! {
            _ = cancel.cancelled() => false,
            permit = self.release.0.acquire() => {
                if let Ok(permit) = permit {
                    permit.forget();
                }
                true
            }
        }
    }

    async fn unwind(&self, sink: &TurnEventSink) -> ProcessorResult<TurnOutcome> {
        if self.emit_cancelled.load(Ordering::SeqCst) {
            sink.emit(TurnPayload::Cancelled {
                reason: Some("processor_stopped".to_string()),
            })
            .await;
        }
        Ok(TurnOutcome::Cancelled)
    }

    async fn stream_reply(
        &self,
        sink: &TurnEventSink,
        fragments: &[&str],
        hold: bool,
        cancel: &CancellationToken,
    ) -> ProcessorResult<TurnOutcome> {
        for fragment in fragments {
            if cancel.is_cancelled() {
                return self.unwind(sink).await;
            }
            sink.emit(TurnPayload::AssistantTextDelta {
                text: fragment.to_string(),
            })
            .await;
        }

        if hold && !self.hold(cancel).await {
            return self.unwind(sink).await;
        }

        let text = fragments.concat();
        sink.emit(TurnPayload::AssistantTextFinal { text: text.clone() })
            .await;
        sink.emit(TurnPayload::AssistantAudioFinal).await;
        sink.emit(TurnPayload::Completed {
            latency_ms: 1,
            transcript_chars: 5,
            response_chars: text.chars().count(),
            model: FAKE_MODEL.to_string(),
        })
        .await;

        if self.linger_after_completion.load(Ordering::SeqCst) && !self.hold(cancel).await {
            // Already completed; the cancel arrives after the fact
            return Ok(TurnOutcome::Cancelled);
        }
        Ok(TurnOutcome::Completed)
    }
}

#[async_trait]
impl TurnProcessor for FakeProcessor {
    async fn start_stream(&self) -> ProcessorResult<()> {
        if self.fail_start_stream.load(Ordering::SeqCst) {
            return Err(ProcessorError::StreamStartFailed("upstream refused".to_string()));
        }
        self.streams_started.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn submit_audio(&self, _frame: AudioFrame) -> ProcessorResult<()> {
        if self.fail_submit.load(Ordering::SeqCst) {
            return Err(ProcessorError::AudioRejected("upstream dropped frame".to_string()));
        }
        self.frames_submitted.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn run_user_turn(
        &self,
        request: UserTurnRequest,
        sink: TurnEventSink,
        cancel: CancellationToken,
    ) -> ProcessorResult<TurnOutcome> {
        let _guard = self.enter();
        self.user_turns.fetch_add(1, Ordering::SeqCst);
        self.carryovers.lock().push(request.carryover.clone());

        if self.panic_turn.load(Ordering::SeqCst) {
            panic!("fake processor panic");
        }
        if self.fail_turn.load(Ordering::SeqCst) {
            return Err(ProcessorError::TurnFailed("model unavailable".to_string()));
        }

        sink.emit(TurnPayload::TranscriptFinal {
            text: "hello".to_string(),
        })
        .await;

        for seq in 0..self.flood_audio_chunks.load(Ordering::SeqCst) {
            if cancel.is_cancelled() {
                return self.unwind(&sink).await;
            }
            sink.emit(TurnPayload::AssistantAudioChunk {
                seq: seq as u64,
                audio_b64: "AAAA".to_string(),
                format: "pcm16".to_string(),
            })
            .await;
        }

        let hold = self.hold_user_turns.load(Ordering::SeqCst);
        self.stream_reply(&sink, &REPLY_FRAGMENTS, hold, &cancel)
            .await
    }

    async fn run_scripted_turn(
        &self,
        request: ScriptedTurnRequest,
        sink: TurnEventSink,
        cancel: CancellationToken,
    ) -> ProcessorResult<TurnOutcome> {
        let _guard = self.enter();
        let fragments: Vec<&str> = match &request.script {
            Script::Intro { onboarding: true } => vec!["Welcome! ", "Let me show you around."],
            Script::Intro { onboarding: false } => vec!["Welcome back."],
            Script::Summary { .. } => vec!["Here is ", "your summary."],
        };
        self.scripts.lock().push(request.script.clone());

        let hold = self.hold_scripted_turns.load(Ordering::SeqCst);
        self.stream_reply(&sink, &fragments, hold, &cancel).await
    }

    async fn discard_stream(&self) -> ProcessorResult<()> {
        self.discarded.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) -> ProcessorResult<()> {
        self.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Drives one scheduler over in-memory channels.
pub struct SchedulerHarness {
    pub processor: Arc<FakeProcessor>,
    inbound: futures_mpsc::UnboundedSender<Inbound>,
    outbound: mpsc::Receiver<MessageRoute>,
    task: Option<JoinHandle<SchedulerExit>>,
}

impl SchedulerHarness {
    pub fn start(session: Session, processor: Arc<FakeProcessor>) -> Self {
        let directory = Arc::new(InMemorySessionDirectory::new());
        directory.insert(session.clone());
        Self::start_with(session, processor, directory, settings())
    }

    pub fn start_with(
        session: Session,
        processor: Arc<FakeProcessor>,
        directory: Arc<dyn SessionDirectory>,
        settings: SchedulerSettings,
    ) -> Self {
        let (inbound_tx, inbound_rx) = futures_mpsc::unbounded();
        let (outbound_tx, outbound_rx) = mpsc::channel(256);

        let scheduler = TurnScheduler::new(
            session,
            processor.clone(),
            directory,
            outbound_tx,
            settings,
        );
        let task = tokio::spawn(scheduler.run(inbound_rx));

        Self {
            processor,
            inbound: inbound_tx,
            outbound: outbound_rx,
            task: Some(task),
        }
    }

    pub fn send(&self, message: Value) {
        self.send_raw(message.to_string());
    }

    pub fn send_raw(&self, text: impl Into<String>) {
        self.inbound
            .unbounded_send(Inbound::Text(text.into()))
            .expect("scheduler inbound closed");
    }

    pub fn send_binary(&self, data: &'static [u8]) {
        self.inbound
            .unbounded_send(Inbound::Binary(bytes::Bytes::from_static(data)))
            .expect("scheduler inbound closed");
    }

    pub fn start_session(&self, session_id: &str) {
        self.send(json!({"type": "session.start", "session_id": session_id}));
    }

    /// Send `count` small audio frames followed by a commit.
    pub fn speak(&self, count: u64) {
        for seq in 0..count {
            self.send(audio_frame(seq));
        }
        self.send(json!({"type": "audio.commit", "seq": count}));
    }

    pub fn cancel(&self) {
        self.send(json!({"type": "response.cancel", "reason": "user barged in"}));
    }

    pub async fn next_route(&mut self) -> MessageRoute {
        timeout(RECV_TIMEOUT, self.outbound.recv())
            .await
            .expect("timed out waiting for outbound message")
            .expect("outbound channel closed")
    }

    /// Next outgoing message as JSON.
    pub async fn next(&mut self) -> Value {
        match self.next_route().await {
            MessageRoute::Outgoing(message) => serde_json::to_value(&message).unwrap(),
            MessageRoute::Close { code, reason } => {
                panic!("unexpected close {code}: {reason}")
            }
        }
    }

    /// Next message, asserting its type.
    pub async fn expect(&mut self, event_type: &str) -> Value {
        let message = self.next().await;
        assert_eq!(message["type"], event_type, "unexpected message {message}");
        message
    }

    /// Collect messages up to and including the first of `event_type`.
    pub async fn until(&mut self, event_type: &str) -> Vec<Value> {
        let mut seen = Vec::new();
        loop {
            let message = self.next().await;
            let done = message["type"] == event_type;
            seen.push(message);
            if done {
                return seen;
            }
        }
    }

    /// Assert nothing is sent within `wait`.
    pub async fn expect_silence(&mut self, wait: Duration) {
        if let Ok(Some(route)) = timeout(wait, self.outbound.recv()).await {
            panic!("expected no message, got {route:?}");
        }
    }

    /// Close the inbound side and collect everything sent until the scheduler stops.
    pub async fn disconnect(mut self) -> (SchedulerExit, Vec<MessageRoute>) {
        self.inbound.close_channel();
        self.join().await
    }

    /// Wait for the scheduler to stop on its own.
    pub async fn join(&mut self) -> (SchedulerExit, Vec<MessageRoute>) {
        let task = self.task.take().expect("scheduler already joined");
        let exit = timeout(RECV_TIMEOUT, task)
            .await
            .expect("scheduler did not stop")
            .expect("scheduler task panicked");

        let mut rest = Vec::new();
        while let Ok(route) = self.outbound.try_recv() {
            rest.push(route);
        }
        (exit, rest)
    }
}

pub fn settings() -> SchedulerSettings {
    SchedulerSettings {
        idle_timeout: None,
        ..SchedulerSettings::default()
    }
}

pub fn audio_frame(seq: u64) -> Value {
    let pcm = base64::engine::general_purpose::STANDARD.encode([0u8; 320]);
    json!({
        "type": "audio.frame",
        "seq": seq,
        "pcm16_b64": pcm,
        "sample_rate_hz": 16000,
        "channels": 1,
    })
}

pub fn types(messages: &[Value]) -> Vec<String> {
    messages
        .iter()
        .map(|m| m["type"].as_str().unwrap_or_default().to_string())
        .collect()
}

pub fn count_type(messages: &[Value], event_type: &str) -> usize {
    messages.iter().filter(|m| m["type"] == event_type).count()
}

/// A first-time user whose onboarding intro gates the summary.
pub fn onboarding_session() -> Session {
    let mut session = Session::new("sess-onboard", "user-new", "chat-1");
    session.pending_intro = true;
    session.is_onboarding_intro = true;
    session
}

/// A session that owes a narrated summary.
pub fn narrated_session(summary: Option<&str>) -> Session {
    use parley_gateway::core::session::{ContentContext, LaunchMode};

    let mut session = Session::new("sess-narrate", "user-1", "chat-2");
    session.launch_mode = LaunchMode::NarrateSummary;
    session.read_only = true;
    session.content_context = Some(ContentContext {
        content_id: "doc-1".to_string(),
        title: Some("Quarterly report".to_string()),
        summary: summary.map(str::to_string),
    });
    session
}
