//! Turn coordinator: the per-call state machine.
//!
//! ```text
//!  transport ──audio──▶ segmenter ──utterance──▶ dialogue ──reply──▶ speech
//!      ▲                   ▲ mute/unmute                               │
//!      │                   │                                           │
//!      └──media+mark───────┴──────────── coordinator ◀──segment/done───┘
//! ```
//!
//! The coordinator task owns the [`CallSession`]. It creates the pipeline
//! stages when the `start` frame arrives and cancels them on `stop` or
//! socket close. While the agent is speaking (any reply still being
//! synthesized, or any sent segment not yet acknowledged) the segmenter is
//! muted, so inbound audio is discarded and barge-in is not possible. The
//! mute is lifted exactly once, when the last hold is released, or by the
//! playback-ack timeout if a marker never comes back.

pub mod playback;
pub mod session;

use crate::config::Config;
use crate::dialogue::{
    CallContext, DialogueEngine, DialogueHandle, LanguageModel, OpenAiChat, Reply, ToolRegistry,
};
use crate::error::SubmitError;
use crate::segmenter::backend::TranscriptionBackend;
use crate::segmenter::deepgram::DeepgramBackend;
use crate::segmenter::{sleep_until, Segmenter, SegmenterEvent, SegmenterHandle};
use crate::speech::{
    ElevenLabsSynthesizer, SpeechEvent, SpeechHandle, SpeechPipeline, SpeechSynthesizer,
};
use crate::transport::{PlaybackMarker, StreamStart, TransportEvent, TransportHandle};
use playback::{AckOutcome, MuteChange};
use session::CallSession;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

pub use playback::{PlaybackState, PlaybackTracker};

/// External services one call talks to. Shared by all calls.
#[derive(Clone)]
pub struct Backends {
    pub transcription: Arc<dyn TranscriptionBackend>,
    pub model: Arc<dyn LanguageModel>,
    pub tools: Arc<ToolRegistry>,
    pub speech: Arc<dyn SpeechSynthesizer>,
}

impl Backends {
    /// Deepgram, OpenAI chat completions, ElevenLabs, and the configured
    /// HTTP tools.
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        Ok(Self {
            transcription: Arc::new(DeepgramBackend::new(config.transcription.clone())),
            model: Arc::new(OpenAiChat::new(config.dialogue.clone())?),
            tools: Arc::new(ToolRegistry::from_config(&config.tools)?),
            speech: Arc::new(ElevenLabsSynthesizer::new(config.speech.clone())?),
        })
    }
}

/// Stage handles that exist between `start` and the end of the call.
struct Stages {
    cancel: CancellationToken,
    segmenter: SegmenterHandle,
    dialogue: DialogueHandle,
    speech: SpeechHandle,
}

struct StageEvents {
    segmenter: mpsc::Receiver<SegmenterEvent>,
    speech: mpsc::Receiver<SpeechEvent>,
}

pub struct TurnCoordinator {
    config: Arc<Config>,
    backends: Backends,
    transport: TransportHandle,
    cancel: CancellationToken,
    session: Option<CallSession>,
    stages: Option<Stages>,
    discarded_frames: u64,
}

impl TurnCoordinator {
    pub fn new(
        config: Arc<Config>,
        backends: Backends,
        transport: TransportHandle,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            config,
            backends,
            transport,
            cancel,
            session: None,
            stages: None,
            discarded_frames: 0,
        }
    }

    /// Drive the call until `stop`, socket close, or cancellation. Cancels
    /// `cancel` on the way out so the transport tasks stop too.
    pub async fn run(mut self, mut events: mpsc::Receiver<TransportEvent>) {
        let mut segmenter_events: Option<mpsc::Receiver<SegmenterEvent>> = None;
        let mut speech_events: Option<mpsc::Receiver<SpeechEvent>> = None;
        let mut replies: VecDeque<mpsc::Receiver<Reply>> = VecDeque::new();

        loop {
            let ack_deadline = self.ack_deadline();
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    tracing::debug!("Coordinator cancelled");
                    break;
                }
                event = events.recv() => {
                    let Some(event) = event else {
                        tracing::info!("Transport closed");
                        break;
                    };
                    match event {
                        TransportEvent::Start(start) => {
                            if let Some(stage_events) = self.on_start(start).await {
                                segmenter_events = Some(stage_events.segmenter);
                                speech_events = Some(stage_events.speech);
                            }
                        }
                        TransportEvent::AudioFrame(frame) => self.on_audio(frame),
                        TransportEvent::PlaybackAck(marker) => self.on_ack(marker).await,
                        TransportEvent::Stop => {
                            tracing::info!("Stop received");
                            break;
                        }
                    }
                }
                Some(event) = recv_from(&mut segmenter_events) => {
                    if let Some(rx) = self.on_segmenter_event(event) {
                        replies.push_back(rx);
                    }
                }
                Some(reply) = next_reply(&mut replies) => self.on_reply(reply).await,
                Some(event) = recv_from(&mut speech_events) => self.on_speech_event(event).await,
                _ = sleep_until(ack_deadline) => self.on_ack_timeout().await,
            }
        }

        self.shutdown();
    }

    fn ack_deadline(&self) -> Option<Instant> {
        self.session.as_ref().and_then(|session| {
            session
                .playback
                .deadline(self.config.coordinator.playback_ack_timeout())
        })
    }

    // ── Event handlers ─────────────────────────────────────────────

    async fn on_start(&mut self, start: StreamStart) -> Option<StageEvents> {
        if let Some(session) = &self.session {
            tracing::warn!(
                session_id = %session.session_id,
                stream_sid = %start.stream_sid,
                "Duplicate start frame ignored"
            );
            return None;
        }

        let session = CallSession::new(&start);
        let session_id = session.session_id.clone();
        tracing::info!(
            session_id = %session_id,
            stream_sid = %start.stream_sid,
            call_sid = %start.call_sid,
            caller = ?start.caller,
            "Call started"
        );

        let cancel = self.cancel.child_token();
        let (segmenter, segmenter_events) = Segmenter::spawn(
            session_id.clone(),
            self.config.segmenter.clone(),
            Arc::clone(&self.backends.transcription),
            cancel.clone(),
        );
        let dialogue = DialogueEngine::spawn(
            Arc::clone(&self.backends.model),
            Arc::clone(&self.backends.tools),
            self.config.dialogue.clone(),
            CallContext {
                session_id: session_id.clone(),
                call_sid: Some(start.call_sid).filter(|sid| !sid.is_empty()),
                caller: start.caller,
            },
            cancel.clone(),
        );
        let (speech, speech_events) = SpeechPipeline::spawn(
            session_id,
            Arc::clone(&self.backends.speech),
            &self.config.speech,
            cancel.clone(),
        );

        self.session = Some(session);
        self.stages = Some(Stages {
            cancel,
            segmenter,
            dialogue,
            speech,
        });

        let greeting = self.config.dialogue.greeting.trim().to_string();
        if !greeting.is_empty() {
            self.on_reply(Reply {
                text: greeting,
                turn: 0,
                is_final: true,
            })
            .await;
        }

        Some(StageEvents {
            segmenter: segmenter_events,
            speech: speech_events,
        })
    }

    fn on_audio(&mut self, frame: Vec<u8>) {
        let Some(stages) = &self.stages else {
            tracing::debug!("Audio frame before start, dropping");
            return;
        };
        if !stages.segmenter.push_audio(frame) {
            self.discarded_frames += 1;
            if self.discarded_frames == 1 || self.discarded_frames.is_multiple_of(250) {
                tracing::debug!(
                    discarded = self.discarded_frames,
                    "Discarding inbound audio while agent speaks"
                );
            }
        }
    }

    fn on_segmenter_event(&mut self, event: SegmenterEvent) -> Option<mpsc::Receiver<Reply>> {
        let (Some(session), Some(stages)) = (self.session.as_mut(), self.stages.as_ref()) else {
            return None;
        };
        match event {
            SegmenterEvent::Utterance(utterance) if session.muted => {
                // Finalized before the segmenter saw the mute.
                tracing::debug!(
                    session_id = %session.session_id,
                    seq = utterance.seq,
                    text = %utterance.text,
                    "Dropping utterance heard while agent speaks"
                );
                None
            }
            SegmenterEvent::Utterance(utterance) => {
                session.utterances += 1;
                tracing::info!(
                    session_id = %session.session_id,
                    seq = utterance.seq,
                    text = %utterance.text,
                    "Caller utterance"
                );
                match stages.dialogue.submit(utterance) {
                    Ok(rx) => Some(rx),
                    Err(SubmitError::Busy) => None,
                    Err(e) => {
                        tracing::warn!(session_id = %session.session_id, error = %e, "Utterance dropped");
                        None
                    }
                }
            }
            SegmenterEvent::TranscriptionLost { attempts } => {
                tracing::error!(
                    session_id = %session.session_id,
                    attempts,
                    "Transcription lost, continuing the call without it"
                );
                None
            }
        }
    }

    async fn on_reply(&mut self, reply: Reply) {
        let (Some(session), Some(stages)) = (self.session.as_mut(), self.stages.as_ref()) else {
            return;
        };
        session.turn = session.turn.max(reply.turn);
        tracing::info!(
            session_id = %session.session_id,
            turn = reply.turn,
            is_final = reply.is_final,
            text = %reply.text,
            "Agent reply"
        );
        if !stages.speech.speak(reply) {
            tracing::warn!(session_id = %session.session_id, "Speech pipeline stopped, reply dropped");
            return;
        }
        let change = session.playback.reserve(Instant::now());
        self.apply_mute(change).await;
    }

    async fn on_speech_event(&mut self, event: SpeechEvent) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        match event {
            SpeechEvent::Segment {
                turn,
                marker,
                audio,
            } => {
                let change = session.playback.register(marker.clone(), Instant::now());
                self.apply_mute(change).await;
                tracing::debug!(turn, marker = %marker, bytes = audio.len(), "Sending audio segment");

                if let Err(e) = self.transport.send_audio(audio, marker.clone()).await {
                    tracing::warn!(turn, marker = %marker, error = %e, "Audio segment not sent");
                    // No ack will ever come for a segment that never left.
                    self.resolve_marker(&marker).await;
                }
            }
            SpeechEvent::Finished {
                turn,
                is_final,
                segments,
            } => {
                tracing::debug!(
                    session_id = %session.session_id,
                    turn,
                    is_final,
                    segments,
                    "Reply playback queued"
                );
                let change = session.playback.reply_finished(Instant::now());
                self.apply_mute(change).await;
            }
        }
    }

    async fn on_ack(&mut self, marker: PlaybackMarker) {
        if self.session.is_none() {
            tracing::debug!(marker = %marker, "Acknowledgement before start, ignoring");
            return;
        }
        self.resolve_marker(&marker).await;
    }

    async fn resolve_marker(&mut self, marker: &PlaybackMarker) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        match session.playback.acknowledge(marker, Instant::now()) {
            AckOutcome::Unknown => {
                tracing::debug!(marker = %marker, "Ignoring acknowledgement for unknown marker");
            }
            AckOutcome::Pending { remaining } => {
                tracing::debug!(marker = %marker, remaining, "Segment played");
            }
            AckOutcome::Released => self.apply_mute(Some(MuteChange::Unmute)).await,
        }
    }

    async fn on_ack_timeout(&mut self) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        if let Some(abandoned) = session.playback.force_release() {
            tracing::warn!(
                session_id = %session.session_id,
                abandoned,
                timeout_ms = self.config.coordinator.playback_ack_timeout_ms,
                "Playback acknowledgement timed out, forcing unmute"
            );
            self.apply_mute(Some(MuteChange::Unmute)).await;
        }
    }

    async fn apply_mute(&mut self, change: Option<MuteChange>) {
        let (Some(session), Some(stages)) = (self.session.as_mut(), self.stages.as_ref()) else {
            return;
        };
        match change {
            Some(MuteChange::Mute) if !session.muted => {
                stages.segmenter.mute().await;
                session.muted = true;
                tracing::debug!(session_id = %session.session_id, turn = session.turn, "Agent speaking, segmenter muted");
            }
            Some(MuteChange::Unmute) if session.muted => {
                stages.segmenter.unmute().await;
                session.muted = false;
                tracing::info!(session_id = %session.session_id, turn = session.turn, "Playback complete, listening");
            }
            _ => {}
        }
    }

    fn shutdown(&mut self) {
        if let Some(stages) = self.stages.take() {
            stages.cancel.cancel();
        }
        if let Some(session) = self.session.take() {
            tracing::info!(
                session_id = %session.session_id,
                turns = session.turn,
                utterances = session.utterances,
                unacknowledged = session.playback.outstanding().len(),
                duration_secs = session.elapsed_secs(),
                "Call ended"
            );
        }
        self.cancel.cancel();
    }
}

async fn recv_from<T>(rx: &mut Option<mpsc::Receiver<T>>) -> Option<T> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// Next reply across the turns in flight, oldest turn first.
async fn next_reply(queue: &mut VecDeque<mpsc::Receiver<Reply>>) -> Option<Reply> {
    while let Some(front) = queue.front_mut() {
        match front.recv().await {
            Some(reply) => return Some(reply),
            None => {
                queue.pop_front();
            }
        }
    }
    std::future::pending().await
}
