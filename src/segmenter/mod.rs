//! Utterance segmenter: inbound audio in, finalized utterances out.
//!
//! One task per call owns the transcription connection and the
//! [`endpoint::Endpointer`]. It selects over
//!
//! - commands from the [`SegmenterHandle`] (audio frames, mute, unmute),
//! - transcript events from the live backend connection,
//! - the reconnect timer ([`backoff::Backoff`]),
//! - the endpointing silence deadline.
//!
//! While muted, audio is discarded at the handle and transcripts still in
//! flight are ignored. Unmuting starts from a clean buffer so nothing heard
//! around the agent's own turn leaks into the next utterance.
//!
//! When the backend drops, audio is buffered (bounded, oldest dropped first)
//! and flushed on reconnect. Once reconnect attempts are exhausted the
//! segmenter reports [`SegmenterEvent::TranscriptionLost`] and stops
//! transcribing; the call itself carries on.

pub mod backend;
pub mod backoff;
pub mod deepgram;
pub mod endpoint;

use crate::config::SegmenterConfig;
use backend::{TranscriptEvent, TranscriptionBackend, TranscriptionConnection};
use backoff::Backoff;
use chrono::{DateTime, Utc};
use endpoint::{EndpointSettings, Endpointer};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

const COMMAND_CAPACITY: usize = 256;
const EVENT_CAPACITY: usize = 32;

// ── Types ──────────────────────────────────────────────────────────

/// A finalized span of caller speech.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Utterance {
    pub text: String,
    /// Monotonically increasing per call, starting at 1.
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SegmenterEvent {
    Utterance(Utterance),
    /// Reconnect attempts exhausted; no further transcription this call.
    TranscriptionLost { attempts: u32 },
}

#[derive(Debug)]
enum Command {
    Audio(Vec<u8>),
    Mute,
    Unmute,
}

// ── Handle ─────────────────────────────────────────────────────────

/// Control surface used by the coordinator.
#[derive(Clone)]
pub struct SegmenterHandle {
    commands: mpsc::Sender<Command>,
    muted: Arc<AtomicBool>,
}

impl SegmenterHandle {
    /// Offer one inbound audio frame. Returns `false` if it was discarded
    /// (muted, queue full, or segmenter gone). Never blocks.
    pub fn push_audio(&self, frame: Vec<u8>) -> bool {
        if self.muted.load(Ordering::Acquire) {
            return false;
        }
        match self.commands.try_send(Command::Audio(frame)) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                tracing::warn!("Segmenter queue full, dropping audio frame");
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    /// Stop listening. Returns `true` if this call changed the state.
    pub async fn mute(&self) -> bool {
        if self.muted.swap(true, Ordering::AcqRel) {
            return false;
        }
        let _ = self.commands.send(Command::Mute).await;
        true
    }

    /// Resume listening. Returns `true` if this call changed the state.
    pub async fn unmute(&self) -> bool {
        if !self.muted.swap(false, Ordering::AcqRel) {
            return false;
        }
        let _ = self.commands.send(Command::Unmute).await;
        true
    }

    pub fn is_muted(&self) -> bool {
        self.muted.load(Ordering::Acquire)
    }
}

// ── Segmenter task ─────────────────────────────────────────────────

pub struct Segmenter {
    session_id: String,
    config: SegmenterConfig,
    backend: Arc<dyn TranscriptionBackend>,
    endpointer: Endpointer,
    backoff: Backoff,
    connection: Option<TranscriptionConnection>,
    reconnect_at: Option<Instant>,
    pending: VecDeque<Vec<u8>>,
    dropped_frames: u64,
    muted: bool,
    degraded: bool,
    seq: u64,
    events: mpsc::Sender<SegmenterEvent>,
}

impl Segmenter {
    /// Spawn the segmenter task; it connects to the backend immediately.
    pub fn spawn(
        session_id: String,
        config: SegmenterConfig,
        backend: Arc<dyn TranscriptionBackend>,
        cancel: CancellationToken,
    ) -> (SegmenterHandle, mpsc::Receiver<SegmenterEvent>) {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_CAPACITY);
        let (event_tx, event_rx) = mpsc::channel(EVENT_CAPACITY);

        let segmenter = Self::new(session_id, config, backend, event_tx);
        tokio::spawn(segmenter.run(command_rx, cancel));

        (
            SegmenterHandle {
                commands: command_tx,
                muted: Arc::new(AtomicBool::new(false)),
            },
            event_rx,
        )
    }

    fn new(
        session_id: String,
        config: SegmenterConfig,
        backend: Arc<dyn TranscriptionBackend>,
        events: mpsc::Sender<SegmenterEvent>,
    ) -> Self {
        Self {
            session_id,
            endpointer: Endpointer::new(EndpointSettings::from(&config)),
            backoff: Backoff::from_config(&config),
            config,
            backend,
            connection: None,
            reconnect_at: Some(Instant::now()),
            pending: VecDeque::new(),
            dropped_frames: 0,
            muted: false,
            degraded: false,
            seq: 0,
            events,
        }
    }

    async fn run(mut self, mut commands: mpsc::Receiver<Command>, cancel: CancellationToken) {
        tracing::info!(
            session_id = %self.session_id,
            backend = self.backend.name(),
            "Segmenter started"
        );

        loop {
            let silence_at = if self.muted {
                None
            } else {
                self.endpointer.next_deadline()
            };
            let reconnect_at = self.reconnect_at;

            tokio::select! {
                _ = cancel.cancelled() => break,
                command = commands.recv() => match command {
                    Some(command) => self.on_command(command).await,
                    None => break,
                },
                event = next_transcript(&mut self.connection) => self.on_backend_event(event).await,
                _ = sleep_until(reconnect_at) => self.connect().await,
                _ = sleep_until(silence_at) => {
                    if let Some(text) = self.endpointer.poll_silence(Instant::now()) {
                        self.emit(text).await;
                    }
                }
            }
        }

        tracing::info!(
            session_id = %self.session_id,
            utterances = self.seq,
            "Segmenter stopped"
        );
    }

    async fn on_command(&mut self, command: Command) {
        match command {
            Command::Audio(frame) => {
                if self.muted || self.degraded {
                    return;
                }
                self.endpointer.on_audio(Instant::now());
                self.forward(frame).await;
            }
            Command::Mute => {
                self.muted = true;
                self.endpointer.reset();
                tracing::debug!(session_id = %self.session_id, "Segmenter muted");
            }
            Command::Unmute => {
                self.muted = false;
                self.endpointer.reset();
                tracing::debug!(session_id = %self.session_id, "Segmenter unmuted");
            }
        }
    }

    async fn forward(&mut self, frame: Vec<u8>) {
        let Some(connection) = self.connection.as_ref() else {
            self.buffer(frame);
            return;
        };
        match connection.audio_tx.try_send(frame) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                tracing::debug!(session_id = %self.session_id, "Transcription backend lagging, dropping frame");
            }
            Err(TrySendError::Closed(frame)) => {
                self.buffer(frame);
                self.on_disconnect("audio channel closed").await;
            }
        }
    }

    /// Hold a frame for the next connection, dropping the oldest past the cap.
    fn buffer(&mut self, frame: Vec<u8>) {
        if self.degraded {
            return;
        }
        self.pending.push_back(frame);
        while self.pending.len() > self.config.max_pending_frames {
            self.pending.pop_front();
            self.dropped_frames += 1;
            if self.dropped_frames == 1 || self.dropped_frames.is_multiple_of(50) {
                tracing::warn!(
                    session_id = %self.session_id,
                    dropped = self.dropped_frames,
                    cap = self.config.max_pending_frames,
                    "Transcription offline, dropping oldest buffered audio"
                );
            }
        }
    }

    async fn on_backend_event(&mut self, event: Option<TranscriptEvent>) {
        match event {
            None => self.on_disconnect("transcription stream ended").await,
            Some(TranscriptEvent::Error(message)) => {
                tracing::warn!(session_id = %self.session_id, error = %message, "Transcription backend error");
            }
            Some(TranscriptEvent::Transcript { text, is_final }) => {
                if self.muted {
                    return;
                }
                if let Some(utterance) = self.endpointer.on_transcript(&text, is_final, Instant::now()) {
                    self.emit(utterance).await;
                }
            }
        }
    }

    async fn on_disconnect(&mut self, reason: &str) {
        if self.connection.take().is_none() && self.reconnect_at.is_some() {
            return;
        }
        tracing::warn!(session_id = %self.session_id, reason, "Transcription backend disconnected");
        self.schedule_reconnect().await;
    }

    async fn schedule_reconnect(&mut self) {
        match self.backoff.next_delay() {
            Some(delay) => {
                tracing::info!(
                    session_id = %self.session_id,
                    attempt = self.backoff.attempt(),
                    delay_ms = delay.as_millis() as u64,
                    "Scheduling transcription reconnect"
                );
                self.reconnect_at = Some(Instant::now() + delay);
            }
            None => self.give_up().await,
        }
    }

    async fn connect(&mut self) {
        self.reconnect_at = None;
        let attempt = tokio::time::timeout(
            self.config.connect_timeout(),
            self.backend.connect(&self.session_id),
        )
        .await;

        let connection = match attempt {
            Ok(Ok(connection)) => connection,
            Ok(Err(e)) => {
                tracing::warn!(session_id = %self.session_id, error = %e, "Transcription connect failed");
                self.schedule_reconnect().await;
                return;
            }
            Err(_) => {
                tracing::warn!(
                    session_id = %self.session_id,
                    timeout_ms = self.config.connect_timeout_ms,
                    "Transcription connect timed out"
                );
                self.schedule_reconnect().await;
                return;
            }
        };

        let flushed = self.pending.len();
        for frame in self.pending.drain(..) {
            if connection.audio_tx.send(frame).await.is_err() {
                break;
            }
        }
        tracing::info!(
            session_id = %self.session_id,
            backend = self.backend.name(),
            flushed,
            "Transcription connected"
        );
        self.backoff.reset();
        self.dropped_frames = 0;
        self.connection = Some(connection);
    }

    async fn give_up(&mut self) {
        self.degraded = true;
        self.pending.clear();
        let attempts = self.backoff.attempt();
        tracing::error!(
            session_id = %self.session_id,
            attempts,
            "Transcription reconnect attempts exhausted, continuing without transcription"
        );
        let _ = self
            .events
            .send(SegmenterEvent::TranscriptionLost { attempts })
            .await;
    }

    async fn emit(&mut self, text: String) {
        self.seq += 1;
        tracing::info!(
            session_id = %self.session_id,
            seq = self.seq,
            text = %text,
            "Utterance finalized"
        );
        let utterance = Utterance {
            text,
            seq: self.seq,
            timestamp: Utc::now(),
        };
        let _ = self.events.send(SegmenterEvent::Utterance(utterance)).await;
    }
}

async fn next_transcript(connection: &mut Option<TranscriptionConnection>) -> Option<TranscriptEvent> {
    match connection {
        Some(connection) => connection.events.recv().await,
        None => std::future::pending().await,
    }
}

/// Sleep until `deadline`, or forever when there is none.
pub(crate) async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
