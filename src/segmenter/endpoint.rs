//! End-of-utterance detection over a stream of interim/final transcripts.
//!
//! Pure state machine: the caller feeds transcript and audio timestamps and
//! polls for silence at [`Endpointer::next_deadline`]. An utterance is
//! finalized when either
//!
//! 1. the accumulated final text ends in sentence punctuation (`.`, `!`, `?`),
//! 2. `max_silent_interim_frames` consecutive empty transcripts arrive after
//!    `min_speech` has elapsed, or
//! 3. no new transcript content for `silence_window` and no audio for
//!    `audio_silence`, again only after `min_speech`.
//!
//! The minimum-speech guard keeps stray phonemes from becoming utterances.

use crate::config::SegmenterConfig;
use std::time::Duration;
use tokio::time::Instant;

const SENTENCE_TERMINATORS: [char; 3] = ['.', '!', '?'];

#[derive(Debug, Clone, Copy)]
pub struct EndpointSettings {
    pub silence_window: Duration,
    /// `Duration::ZERO` disables the audio half of the silence rule.
    pub audio_silence: Duration,
    pub min_speech: Duration,
    pub max_silent_interim_frames: u32,
}

impl From<&SegmenterConfig> for EndpointSettings {
    fn from(config: &SegmenterConfig) -> Self {
        Self {
            silence_window: config.silence_window(),
            audio_silence: config.audio_silence(),
            min_speech: config.min_speech(),
            max_silent_interim_frames: config.max_silent_interim_frames,
        }
    }
}

/// Where the current utterance is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointState {
    /// Nothing heard since the last utterance.
    Idle,
    /// Transcript text is buffered and waiting for an endpoint.
    Listening,
}

#[derive(Debug)]
pub struct Endpointer {
    settings: EndpointSettings,
    /// Concatenated final segments not yet emitted.
    finals: String,
    /// Latest interim hypothesis for the segment in progress.
    interim: String,
    speech_started: Option<Instant>,
    last_content: Option<Instant>,
    last_audio: Option<Instant>,
    silent_frames: u32,
    /// Last final segment consumed; a redelivery of it is ignored.
    last_final: Option<String>,
}

impl Endpointer {
    pub fn new(settings: EndpointSettings) -> Self {
        Self {
            settings,
            finals: String::new(),
            interim: String::new(),
            speech_started: None,
            last_content: None,
            last_audio: None,
            silent_frames: 0,
            last_final: None,
        }
    }

    pub fn state(&self) -> EndpointState {
        if self.finals.is_empty() && self.interim.is_empty() {
            EndpointState::Idle
        } else {
            EndpointState::Listening
        }
    }

    pub fn on_audio(&mut self, now: Instant) {
        self.last_audio = Some(now);
    }

    /// Feed one transcript event. Returns the finalized utterance text, if
    /// this event completed one.
    pub fn on_transcript(&mut self, text: &str, is_final: bool, now: Instant) -> Option<String> {
        let text = text.trim();
        if text.is_empty() {
            return self.on_silent_frame(now);
        }
        self.silent_frames = 0;

        if !is_final {
            self.last_final = None;
            if self.interim != text {
                self.interim = text.to_string();
                self.note_content(now);
            }
            return None;
        }

        if self.last_final.as_deref() == Some(text) {
            tracing::debug!(text = %text, "Ignoring redelivered final transcript");
            return None;
        }
        self.last_final = Some(text.to_string());
        self.note_content(now);
        self.finals = join(&self.finals, text);
        self.interim.clear();

        if is_complete_sentence(&self.finals) {
            return self.finalize();
        }
        None
    }

    /// Finalize on silence if the deadline has passed.
    pub fn poll_silence(&mut self, now: Instant) -> Option<String> {
        match self.next_deadline() {
            Some(deadline) if now >= deadline => self.finalize(),
            _ => None,
        }
    }

    /// Earliest instant at which the silence rule could finalize the buffer.
    pub fn next_deadline(&self) -> Option<Instant> {
        if self.state() == EndpointState::Idle {
            return None;
        }
        let started = self.speech_started?;
        let content = self.last_content.unwrap_or(started);

        let mut deadline = (started + self.settings.min_speech).max(content + self.settings.silence_window);
        if !self.settings.audio_silence.is_zero() {
            if let Some(audio) = self.last_audio {
                deadline = deadline.max(audio + self.settings.audio_silence);
            }
        }
        Some(deadline)
    }

    /// Drop everything heard so far (mute/unmute boundaries).
    pub fn reset(&mut self) {
        self.clear_tracking();
        self.last_final = None;
    }

    fn on_silent_frame(&mut self, now: Instant) -> Option<String> {
        if self.state() == EndpointState::Idle {
            return None;
        }
        self.silent_frames += 1;
        if self.silent_frames >= self.settings.max_silent_interim_frames && self.min_speech_elapsed(now) {
            return self.finalize();
        }
        None
    }

    fn note_content(&mut self, now: Instant) {
        self.speech_started.get_or_insert(now);
        self.last_content = Some(now);
    }

    fn min_speech_elapsed(&self, now: Instant) -> bool {
        self.speech_started
            .is_some_and(|started| now.duration_since(started) >= self.settings.min_speech)
    }

    fn finalize(&mut self) -> Option<String> {
        let text = join(&self.finals, &self.interim);
        self.clear_tracking();
        (!text.is_empty()).then_some(text)
    }

    fn clear_tracking(&mut self) {
        self.finals.clear();
        self.interim.clear();
        self.speech_started = None;
        self.last_content = None;
        self.silent_frames = 0;
    }
}

pub fn is_complete_sentence(text: &str) -> bool {
    text.trim_end().ends_with(SENTENCE_TERMINATORS)
}

fn join(head: &str, tail: &str) -> String {
    match (head.is_empty(), tail.is_empty()) {
        (true, _) => tail.to_string(),
        (_, true) => head.to_string(),
        _ => format!("{head} {tail}"),
    }
}
