//! Loopback turn processor
//!
//! A self-contained processor for local development. It buffers inbound PCM,
//! describes the buffered audio as its "transcript" and streams a canned
//! reply back fragment by fragment, so the full turn lifecycle (including
//! barge-in and carryover) can be exercised without any upstream services.

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::base::{
    AudioFrame, ProcessorError, ProcessorFactory, ProcessorResult, Script, ScriptedTurnRequest,
    SharedProcessor, TurnEventSink, TurnOutcome, TurnPayload, TurnProcessor, UserTurnRequest,
};
use crate::core::session::Session;

/// Output sample rate of the synthesized audio fragments
pub const LOOPBACK_OUTPUT_SAMPLE_RATE: u32 = 24_000;

/// Format label attached to audio chunks
pub const LOOPBACK_AUDIO_FORMAT: &str = "pcm16_24000";

/// Milliseconds of audio synthesized per text fragment
const AUDIO_MS_PER_FRAGMENT: u32 = 20;

#[derive(Debug, Clone)]
pub struct LoopbackConfig {
    /// Model label reported in `turn.completed`
    pub model: String,
    /// Pause between streamed fragments
    pub chunk_delay: Duration,
}

impl Default for LoopbackConfig {
    fn default() -> Self {
        Self {
            model: "loopback-1".to_string(),
            chunk_delay: Duration::from_millis(40),
        }
    }
}

#[derive(Debug, Default)]
struct StreamState {
    buffered_bytes: usize,
    sample_rate_hz: u32,
    frames: u64,
}

/// Streams are queued so a committed utterance is never clobbered by the
/// next one opening before its turn task has consumed it.
pub struct LoopbackProcessor {
    config: LoopbackConfig,
    streams: Mutex<VecDeque<StreamState>>,
}

impl LoopbackProcessor {
    pub fn new(config: LoopbackConfig) -> Self {
        Self {
            config,
            streams: Mutex::new(VecDeque::new()),
        }
    }

    /// Consume the oldest stream, returning (bytes, sample rate).
    fn take_stream(&self) -> ProcessorResult<(usize, u32)> {
        let stream = self
            .streams
            .lock()
            .pop_front()
            .ok_or(ProcessorError::NotStreaming)?;
        Ok((stream.buffered_bytes, stream.sample_rate_hz))
    }

    /// Stream `reply` as text + audio fragments, honoring cancellation.
    async fn speak(
        &self,
        reply: &str,
        transcript_chars: usize,
        started: Instant,
        sink: &TurnEventSink,
        cancel: &CancellationToken,
    ) -> ProcessorResult<TurnOutcome> {
        let silence = silence_chunk(AUDIO_MS_PER_FRAGMENT);
        let fragments = split_fragments(reply);

        for (seq, fragment) in fragments.iter().enumerate() {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(turn_id = %sink.turn_id(), "Loopback turn cancelled");
                    sink.emit(TurnPayload::Cancelled { reason: None }).await;
                    return Ok(TurnOutcome::Cancelled);
                }
                _ = tokio::time::sleep(self.config.chunk_delay) => {}
            }

            if !sink
                .emit(TurnPayload::AssistantTextDelta {
                    text: fragment.clone(),
                })
                .await
            {
                return Err(ProcessorError::Closed);
            }
            sink.emit(TurnPayload::AssistantAudioChunk {
                seq: seq as u64,
                audio_b64: silence.clone(),
                format: LOOPBACK_AUDIO_FORMAT.to_string(),
            })
            .await;
        }

        if cancel.is_cancelled() {
            sink.emit(TurnPayload::Cancelled { reason: None }).await;
            return Ok(TurnOutcome::Cancelled);
        }

        sink.emit(TurnPayload::AssistantTextFinal {
            text: reply.to_string(),
        })
        .await;
        sink.emit(TurnPayload::AssistantAudioFinal).await;
        sink.emit(TurnPayload::Completed {
            latency_ms: started.elapsed().as_millis() as u64,
            transcript_chars,
            response_chars: reply.chars().count(),
            model: self.config.model.clone(),
        })
        .await;

        Ok(TurnOutcome::Completed)
    }
}

#[async_trait]
impl TurnProcessor for LoopbackProcessor {
    async fn start_stream(&self) -> ProcessorResult<()> {
        self.streams.lock().push_back(StreamState::default());
        Ok(())
    }

    async fn submit_audio(&self, frame: AudioFrame) -> ProcessorResult<()> {
        let mut streams = self.streams.lock();
        let stream = streams.back_mut().ok_or(ProcessorError::NotStreaming)?;
        if stream.sample_rate_hz != 0 && stream.sample_rate_hz != frame.sample_rate_hz {
            return Err(ProcessorError::AudioRejected(format!(
                "sample rate changed mid-stream ({} -> {})",
                stream.sample_rate_hz, frame.sample_rate_hz
            )));
        }
        stream.sample_rate_hz = frame.sample_rate_hz;
        stream.buffered_bytes += frame.pcm.len();
        stream.frames += 1;
        Ok(())
    }

    async fn run_user_turn(
        &self,
        request: UserTurnRequest,
        sink: TurnEventSink,
        cancel: CancellationToken,
    ) -> ProcessorResult<TurnOutcome> {
        let started = Instant::now();
        let (bytes, sample_rate) = self.take_stream()?;

        let seconds = if sample_rate == 0 {
            0.0
        } else {
            (bytes / 2) as f64 / sample_rate as f64
        };
        let transcript = format!("({seconds:.1} seconds of audio)");

        sink.emit(TurnPayload::TranscriptPartial {
            text: transcript.clone(),
        })
        .await;
        sink.emit(TurnPayload::TranscriptFinal {
            text: transcript.clone(),
        })
        .await;

        let mut reply = String::new();
        if let Some(carryover) = request.carryover.as_deref() {
            reply.push_str(&format!(
                "Picking up after \"{}\". ",
                last_words(carryover, 6)
            ));
        }
        reply.push_str(&format!(
            "I heard about {seconds:.1} seconds of audio on turn {}. \
             This is the loopback processor answering.",
            request.turn_index
        ));

        self.speak(
            &reply,
            transcript.chars().count(),
            started,
            &sink,
            &cancel,
        )
        .await
    }

    async fn run_scripted_turn(
        &self,
        request: ScriptedTurnRequest,
        sink: TurnEventSink,
        cancel: CancellationToken,
    ) -> ProcessorResult<TurnOutcome> {
        let started = Instant::now();
        let script = match request.script {
            Script::Intro { onboarding: true } => {
                "Welcome! I'm your voice assistant. Ask me anything, \
                 and feel free to interrupt me at any time."
                    .to_string()
            }
            Script::Intro { onboarding: false } => {
                "Welcome back. Let's pick up where we left off.".to_string()
            }
            Script::Summary { title, text } => match title {
                Some(title) => format!("Here is a quick summary of {title}. {text}"),
                None => format!("Here is a quick summary. {text}"),
            },
        };

        self.speak(&script, 0, started, &sink, &cancel).await
    }

    async fn discard_stream(&self) -> ProcessorResult<()> {
        let mut streams = self.streams.lock();
        if let Some(stream) = streams.pop_back() {
            debug!(
                frames = stream.frames,
                pending_streams = streams.len(),
                "Discarded open loopback stream"
            );
        }
        Ok(())
    }

    async fn close(&self) -> ProcessorResult<()> {
        let mut streams = self.streams.lock();
        let frames: u64 = streams.iter().map(|s| s.frames).sum();
        debug!(pending_streams = streams.len(), frames, "Closing loopback streams");
        streams.clear();
        Ok(())
    }
}

/// Factory producing one [`LoopbackProcessor`] per connection.
#[derive(Debug, Clone, Default)]
pub struct LoopbackFactory {
    config: LoopbackConfig,
}

impl LoopbackFactory {
    pub fn new(config: LoopbackConfig) -> Self {
        Self { config }
    }
}

impl ProcessorFactory for LoopbackFactory {
    fn create(&self, _session: &Session) -> ProcessorResult<SharedProcessor> {
        Ok(Arc::new(LoopbackProcessor::new(self.config.clone())))
    }
}

/// Split text into word fragments that keep their trailing whitespace.
fn split_fragments(text: &str) -> Vec<String> {
    text.split_inclusive(' ').map(str::to_string).collect()
}

fn last_words(text: &str, count: usize) -> String {
    let words: Vec<&str> = text.split_whitespace().collect();
    let start = words.len().saturating_sub(count);
    words[start..].join(" ")
}

fn silence_chunk(ms: u32) -> String {
    let samples = (LOOPBACK_OUTPUT_SAMPLE_RATE / 1000 * ms) as usize;
    BASE64.encode(vec![0u8; samples * 2])
}
