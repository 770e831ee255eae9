//! Serial reply-to-audio pipeline for one call.
//!
//! Replies are synthesized strictly one after another in submission order,
//! so every segment of an earlier reply is handed out before any segment of
//! a later one. Each reply ends with exactly one [`SpeechEvent::Finished`],
//! including when synthesis failed and no audio was produced.

use super::SpeechSynthesizer;
use crate::config::SpeechConfig;
use crate::dialogue::Reply;
use crate::transport::PlaybackMarker;
use futures_util::StreamExt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const EVENT_BUFFER: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpeechEvent {
    /// One audio segment, to be sent followed by its marker.
    Segment {
        turn: u64,
        marker: PlaybackMarker,
        audio: Vec<u8>,
    },
    /// All segments of a reply have been handed out.
    Finished {
        turn: u64,
        is_final: bool,
        segments: usize,
    },
}

#[derive(Clone)]
pub struct SpeechHandle {
    replies: mpsc::UnboundedSender<Reply>,
}

impl SpeechHandle {
    /// Queue a reply. Returns `false` once the pipeline has stopped.
    pub fn speak(&self, reply: Reply) -> bool {
        self.replies.send(reply).is_ok()
    }
}

pub struct SpeechPipeline {
    session_id: String,
    synthesizer: Arc<dyn SpeechSynthesizer>,
    min_segment_bytes: usize,
    events: mpsc::Sender<SpeechEvent>,
}

impl SpeechPipeline {
    pub fn spawn(
        session_id: String,
        synthesizer: Arc<dyn SpeechSynthesizer>,
        config: &SpeechConfig,
        cancel: CancellationToken,
    ) -> (SpeechHandle, mpsc::Receiver<SpeechEvent>) {
        let (reply_tx, reply_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::channel(EVENT_BUFFER);
        let pipeline = Self {
            session_id,
            synthesizer,
            min_segment_bytes: config.min_segment_bytes,
            events: event_tx,
        };
        tokio::spawn(pipeline.run(reply_rx, cancel));
        (SpeechHandle { replies: reply_tx }, event_rx)
    }

    async fn run(self, mut replies: mpsc::UnboundedReceiver<Reply>, cancel: CancellationToken) {
        loop {
            let reply = tokio::select! {
                _ = cancel.cancelled() => break,
                reply = replies.recv() => match reply {
                    Some(reply) => reply,
                    None => break,
                },
            };
            let (turn, is_final) = (reply.turn, reply.is_final);
            let segments = tokio::select! {
                _ = cancel.cancelled() => break,
                segments = self.speak(&reply) => segments,
            };
            let Some(segments) = segments else { break };
            if self
                .events
                .send(SpeechEvent::Finished {
                    turn,
                    is_final,
                    segments,
                })
                .await
                .is_err()
            {
                break;
            }
        }
        tracing::debug!(session_id = %self.session_id, "Speech pipeline stopped");
    }

    /// Synthesize one reply and hand out its segments. Returns the number of
    /// segments sent, or `None` when the event receiver is gone.
    async fn speak(&self, reply: &Reply) -> Option<usize> {
        let text = reply.text.trim();
        if text.is_empty() {
            return Some(0);
        }

        let mut audio = match self.synthesizer.synthesize(text).await {
            Ok(audio) => audio,
            Err(e) => {
                tracing::error!(
                    session_id = %self.session_id,
                    turn = reply.turn,
                    backend = self.synthesizer.name(),
                    error = %e,
                    "Speech synthesis failed, skipping audio for reply"
                );
                return Some(0);
            }
        };

        let mut segments = 0usize;
        let mut pending: Vec<u8> = Vec::new();
        while let Some(chunk) = audio.next().await {
            match chunk {
                Ok(bytes) => pending.extend_from_slice(&bytes),
                Err(e) => {
                    tracing::error!(
                        session_id = %self.session_id,
                        turn = reply.turn,
                        segments,
                        error = %e,
                        "Speech stream failed mid-reply"
                    );
                    return Some(segments);
                }
            }
            if !pending.is_empty() && pending.len() >= self.min_segment_bytes {
                self.emit(reply.turn, std::mem::take(&mut pending)).await?;
                segments += 1;
            }
        }
        if !pending.is_empty() {
            self.emit(reply.turn, pending).await?;
            segments += 1;
        }

        tracing::debug!(
            session_id = %self.session_id,
            turn = reply.turn,
            is_final = reply.is_final,
            segments,
            "Reply synthesized"
        );
        Some(segments)
    }

    async fn emit(&self, turn: u64, audio: Vec<u8>) -> Option<()> {
        self.events
            .send(SpeechEvent::Segment {
                turn,
                marker: PlaybackMarker::generate(),
                audio,
            })
            .await
            .ok()
    }
}
