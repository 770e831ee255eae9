//! Frame transport adapter for one media-stream connection.
//!
//! Turns inbound wire frames into [`TransportEvent`]s and outbound
//! [`OutboundCommand`]s into wire frames. Owns both halves of the duplex
//! socket through two tasks:
//!
//! - **reader** decodes frames, binds the stream SID on `start`, and drops
//!   malformed frames with a warning.
//! - **writer** is the only task that writes to the socket, so every media
//!   frame is immediately followed by its own mark frame.
//!
//! The adapter is generic over `Stream<Item = String>` / `Sink<String>` so the
//! gateway can hand it an axum WebSocket and tests can hand it channels.

pub mod protocol;

use crate::error::TransportError;
use base64::Engine;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use parking_lot::Mutex;
use protocol::{InboundFrame, MarkPayload, MediaPayload, OutboundFrame};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Capacity of the inbound event and outbound command channels.
const CHANNEL_CAPACITY: usize = 256;

// ── Types ──────────────────────────────────────────────────────────

/// Opaque token paired with one outbound audio segment and echoed back by the
/// carrier once that segment has been played.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PlaybackMarker(String);

impl PlaybackMarker {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for PlaybackMarker {
    fn from(name: String) -> Self {
        Self(name)
    }
}

impl From<&str> for PlaybackMarker {
    fn from(name: &str) -> Self {
        Self(name.to_string())
    }
}

impl fmt::Display for PlaybackMarker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Stream metadata carried by the `start` frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamStart {
    pub stream_sid: String,
    pub call_sid: String,
    pub caller: Option<String>,
    pub custom_parameters: HashMap<String, String>,
}

/// One decoded inbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Start(StreamStart),
    /// Raw (still encoded) audio bytes of one frame.
    AudioFrame(Vec<u8>),
    PlaybackAck(PlaybackMarker),
    Stop,
}

/// Work for the writer task.
#[derive(Debug, Clone)]
pub enum OutboundCommand {
    /// Send one audio segment followed immediately by its marker.
    SendAudio {
        audio: Vec<u8>,
        marker: PlaybackMarker,
    },
}

// ── Handle ─────────────────────────────────────────────────────────

/// Cloneable sender side of the transport.
#[derive(Clone)]
pub struct TransportHandle {
    outbound_tx: mpsc::Sender<OutboundCommand>,
    stream_sid: Arc<Mutex<Option<String>>>,
}

impl TransportHandle {
    /// Queue an audio segment and its marker for the writer task.
    pub async fn send_audio(
        &self,
        audio: Vec<u8>,
        marker: PlaybackMarker,
    ) -> Result<(), TransportError> {
        if self.stream_sid.lock().is_none() {
            return Err(TransportError::Unbound);
        }
        self.outbound_tx
            .send(OutboundCommand::SendAudio { audio, marker })
            .await
            .map_err(|_| TransportError::Closed)
    }

    /// Stream SID bound by the `start` frame, if it has arrived.
    pub fn stream_sid(&self) -> Option<String> {
        self.stream_sid.lock().clone()
    }
}

// ── Adapter ────────────────────────────────────────────────────────

pub struct FrameTransport;

impl FrameTransport {
    /// Spawn the reader and writer tasks for one connection.
    ///
    /// The event receiver yields `None` once the socket closed, `stop` was
    /// received, or `cancel` fired.
    pub fn start<R, W>(
        connection_id: String,
        inbound: R,
        outbound: W,
        cancel: CancellationToken,
    ) -> (mpsc::Receiver<TransportEvent>, TransportHandle)
    where
        R: Stream<Item = String> + Send + 'static,
        W: Sink<String> + Send + 'static,
        W::Error: fmt::Display + Send,
    {
        let (event_tx, event_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (outbound_tx, outbound_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let stream_sid = Arc::new(Mutex::new(None));

        let sid_in = Arc::clone(&stream_sid);
        let id_in = connection_id.clone();
        let cancel_in = cancel.clone();
        tokio::spawn(async move {
            reader_loop(inbound, event_tx, sid_in, id_in, cancel_in).await;
        });

        let sid_out = Arc::clone(&stream_sid);
        tokio::spawn(async move {
            writer_loop(outbound, outbound_rx, sid_out, connection_id, cancel).await;
        });

        (
            event_rx,
            TransportHandle {
                outbound_tx,
                stream_sid,
            },
        )
    }
}

/// Decode one text frame. `Ok(None)` for frames that carry nothing for the
/// orchestrator (the `connected` handshake).
pub fn decode_frame(text: &str) -> Result<Option<TransportEvent>, TransportError> {
    let frame: InboundFrame = serde_json::from_str(text)?;
    let event = match frame {
        InboundFrame::Connected { .. } => return Ok(None),
        InboundFrame::Start { start } => TransportEvent::Start(StreamStart {
            caller: start.caller(),
            stream_sid: start.stream_sid,
            call_sid: start.call_sid,
            custom_parameters: start.custom_parameters,
        }),
        InboundFrame::Media { media } => TransportEvent::AudioFrame(
            base64::engine::general_purpose::STANDARD.decode(media.payload.as_bytes())?,
        ),
        InboundFrame::Mark { mark, .. } => TransportEvent::PlaybackAck(mark.name.into()),
        InboundFrame::Stop { .. } => TransportEvent::Stop,
    };
    Ok(Some(event))
}

/// Encode an audio segment as its `media` frame and the `mark` frame that
/// must follow it.
pub fn encode_segment(
    stream_sid: &str,
    audio: &[u8],
    marker: &PlaybackMarker,
) -> Result<[String; 2], TransportError> {
    let media = OutboundFrame::Media {
        stream_sid: stream_sid.to_string(),
        media: MediaPayload {
            payload: base64::engine::general_purpose::STANDARD.encode(audio),
        },
    };
    let mark = OutboundFrame::Mark {
        stream_sid: stream_sid.to_string(),
        mark: MarkPayload {
            name: marker.as_str().to_string(),
        },
    };
    Ok([serde_json::to_string(&media)?, serde_json::to_string(&mark)?])
}

// ── Internal loops ─────────────────────────────────────────────────

async fn reader_loop<R>(
    inbound: R,
    event_tx: mpsc::Sender<TransportEvent>,
    stream_sid: Arc<Mutex<Option<String>>>,
    connection_id: String,
    cancel: CancellationToken,
) where
    R: Stream<Item = String> + Send,
{
    tokio::pin!(inbound);
    let mut frame_count: u64 = 0;
    let mut dropped: u64 = 0;

    loop {
        let text = tokio::select! {
            _ = cancel.cancelled() => break,
            next = inbound.next() => match next {
                Some(text) => text,
                None => {
                    tracing::info!(connection_id = %connection_id, "Media stream closed by peer");
                    break;
                }
            },
        };
        frame_count += 1;

        let event = match decode_frame(&text) {
            Ok(Some(event)) => event,
            Ok(None) => continue,
            Err(e) => {
                dropped += 1;
                tracing::warn!(
                    connection_id = %connection_id,
                    error = %e,
                    dropped,
                    "Dropping malformed media stream frame"
                );
                continue;
            }
        };

        if let TransportEvent::Start(ref start) = event {
            *stream_sid.lock() = Some(start.stream_sid.clone());
            tracing::info!(
                connection_id = %connection_id,
                stream_sid = %start.stream_sid,
                call_sid = %start.call_sid,
                "Media stream started"
            );
        }

        let is_stop = matches!(event, TransportEvent::Stop);
        if event_tx.send(event).await.is_err() {
            tracing::debug!(connection_id = %connection_id, "Event receiver dropped, closing reader");
            break;
        }
        if is_stop {
            tracing::info!(connection_id = %connection_id, frames = frame_count, "Media stream stopped");
            break;
        }
    }
}

async fn writer_loop<W>(
    outbound: W,
    mut commands: mpsc::Receiver<OutboundCommand>,
    stream_sid: Arc<Mutex<Option<String>>>,
    connection_id: String,
    cancel: CancellationToken,
) where
    W: Sink<String> + Send,
    W::Error: fmt::Display + Send,
{
    tokio::pin!(outbound);
    let mut segment_count: u64 = 0;

    loop {
        let command = tokio::select! {
            _ = cancel.cancelled() => break,
            command = commands.recv() => match command {
                Some(command) => command,
                None => break,
            },
        };

        let OutboundCommand::SendAudio { audio, marker } = command;
        let Some(sid) = stream_sid.lock().clone() else {
            tracing::warn!(connection_id = %connection_id, marker = %marker, "Dropping audio for unbound stream");
            continue;
        };
        let frames = match encode_segment(&sid, &audio, &marker) {
            Ok(frames) => frames,
            Err(e) => {
                tracing::error!(connection_id = %connection_id, error = %e, "Failed to encode segment");
                continue;
            }
        };

        segment_count += 1;
        if segment_count == 1 || segment_count.is_multiple_of(50) {
            tracing::debug!(
                connection_id = %connection_id,
                segment = segment_count,
                bytes = audio.len(),
                marker = %marker,
                "Sending audio segment"
            );
        }
        for frame in frames {
            if let Err(e) = outbound.send(frame).await {
                tracing::warn!(
                    connection_id = %connection_id,
                    error = %e,
                    "Media stream write failed, closing writer"
                );
                return;
            }
        }
    }

    let _ = outbound.close().await;
    tracing::debug!(connection_id = %connection_id, "Media stream writer terminated");
}
