//! Deepgram live transcription over WebSocket.
//!
//! ## Protocol Overview
//!
//! 1. **Connect**: WebSocket to `wss://api.deepgram.com/v1/listen?...` with
//!    the codec and endpointing options in the query and `Token` auth.
//! 2. **Stream**: raw audio as binary frames; `KeepAlive` text frames while
//!    no audio flows (the segmenter stops forwarding while muted).
//! 3. **Receive**: `Results` messages carrying interim/final transcripts.
//! 4. **Close**: `CloseStream`, then a close frame.

use super::backend::{TranscriptEvent, TranscriptionBackend, TranscriptionConnection};
use crate::config::TranscriptionConfig;
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message as WsMessage;

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

// ── Backend ────────────────────────────────────────────────────────

pub struct DeepgramBackend {
    config: TranscriptionConfig,
}

impl DeepgramBackend {
    pub fn new(config: TranscriptionConfig) -> Self {
        Self { config }
    }

    /// Listen URL with codec and endpointing options.
    pub fn listen_url(&self) -> String {
        let c = &self.config;
        format!(
            "{}?encoding={}&sample_rate={}&model={}&punctuate=true&interim_results=true&endpointing={}&utterance_end_ms={}",
            c.api_url, c.encoding, c.sample_rate, c.model, c.endpointing_ms, c.utterance_end_ms
        )
    }
}

#[async_trait]
impl TranscriptionBackend for DeepgramBackend {
    fn name(&self) -> &str {
        "deepgram"
    }

    async fn connect(&self, session_id: &str) -> anyhow::Result<TranscriptionConnection> {
        let api_key = self
            .config
            .api_key
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("Deepgram API key is not configured"))?;

        tracing::info!(
            session_id = %session_id,
            model = %self.config.model,
            "Connecting to Deepgram"
        );

        let mut request = self
            .listen_url()
            .into_client_request()
            .map_err(|e| anyhow::anyhow!("Failed to build WebSocket request: {e}"))?;
        request.headers_mut().insert(
            "Authorization",
            format!("Token {api_key}")
                .parse()
                .map_err(|e| anyhow::anyhow!("Invalid auth header: {e}"))?,
        );

        let (ws_stream, _response) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to connect to Deepgram: {e}"))?;
        let (ws_sender, ws_receiver) = ws_stream.split();

        let (audio_tx, audio_rx) = mpsc::channel::<Vec<u8>>(256);
        let (event_tx, event_rx) = mpsc::channel::<TranscriptEvent>(256);

        let keepalive = Duration::from_secs(self.config.keepalive_secs.max(1));
        let sid_out = session_id.to_string();
        tokio::spawn(async move {
            outbound_loop(audio_rx, ws_sender, keepalive, sid_out).await;
        });

        let sid_in = session_id.to_string();
        tokio::spawn(async move {
            inbound_loop(ws_receiver, event_tx, sid_in).await;
        });

        Ok(TranscriptionConnection {
            audio_tx,
            events: event_rx,
        })
    }
}

// ── Internal loops ─────────────────────────────────────────────────

/// Forward audio as binary frames, keep the socket alive while idle.
async fn outbound_loop(
    mut audio_rx: mpsc::Receiver<Vec<u8>>,
    mut ws_sender: futures_util::stream::SplitSink<WsStream, WsMessage>,
    keepalive: Duration,
    session_id: String,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + keepalive, keepalive);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut last_audio = Instant::now();
    let mut chunk_count: u64 = 0;

    loop {
        tokio::select! {
            frame = audio_rx.recv() => {
                let Some(frame) = frame else {
                    let _ = ws_sender.send(WsMessage::text(r#"{"type":"CloseStream"}"#.to_string())).await;
                    let _ = ws_sender.send(WsMessage::Close(None)).await;
                    break;
                };
                chunk_count += 1;
                last_audio = Instant::now();
                if chunk_count == 1 || chunk_count.is_multiple_of(500) {
                    tracing::debug!(
                        session_id = %session_id,
                        chunk = chunk_count,
                        bytes = frame.len(),
                        "Sending audio to Deepgram"
                    );
                }
                if ws_sender.send(WsMessage::binary(frame)).await.is_err() {
                    tracing::warn!(session_id = %session_id, "Deepgram send failed, closing outbound loop");
                    break;
                }
            }
            _ = ticker.tick() => {
                if last_audio.elapsed() < keepalive {
                    continue;
                }
                if ws_sender.send(WsMessage::text(r#"{"type":"KeepAlive"}"#.to_string())).await.is_err() {
                    break;
                }
            }
        }
    }

    tracing::debug!(session_id = %session_id, "Deepgram outbound loop terminated");
}

/// Parse server messages into transcript events until the socket closes.
async fn inbound_loop(
    mut ws_receiver: futures_util::stream::SplitStream<WsStream>,
    event_tx: mpsc::Sender<TranscriptEvent>,
    session_id: String,
) {
    while let Some(msg_result) = ws_receiver.next().await {
        match msg_result {
            Ok(WsMessage::Text(text)) => {
                let Some(event) = parse_server_event(&text, &session_id) else {
                    continue;
                };
                if event_tx.send(event).await.is_err() {
                    tracing::debug!(session_id = %session_id, "Transcript receiver dropped");
                    return;
                }
            }
            Ok(WsMessage::Close(frame)) => {
                tracing::info!(
                    session_id = %session_id,
                    close_frame = ?frame,
                    "Deepgram connection closed"
                );
                break;
            }
            Ok(WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Frame(_) | WsMessage::Binary(_)) => {}
            Err(e) => {
                tracing::error!(session_id = %session_id, error = %e, "Deepgram WebSocket error");
                let _ = event_tx
                    .send(TranscriptEvent::Error(format!("WebSocket error: {e}")))
                    .await;
                break;
            }
        }
    }

    tracing::debug!(session_id = %session_id, "Deepgram inbound loop terminated");
}

// ── Server event parsing ───────────────────────────────────────────

/// Parse one Deepgram server message.
fn parse_server_event(json_text: &str, session_id: &str) -> Option<TranscriptEvent> {
    let value: serde_json::Value = match serde_json::from_str(json_text) {
        Ok(v) => v,
        Err(e) => {
            return Some(TranscriptEvent::Error(format!(
                "Failed to parse Deepgram event: {e}"
            )))
        }
    };

    let event_type = value.get("type").and_then(|v| v.as_str()).unwrap_or("");
    match event_type {
        "Results" => {
            let text = value
                .pointer("/channel/alternatives/0/transcript")
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .to_string();
            let is_final = value
                .get("is_final")
                .and_then(|v| v.as_bool())
                .unwrap_or(false);
            if !text.is_empty() {
                tracing::debug!(
                    session_id = %session_id,
                    is_final,
                    text = %text,
                    "Deepgram transcript"
                );
            }
            Some(TranscriptEvent::Transcript { text, is_final })
        }
        "Metadata" | "SpeechStarted" | "UtteranceEnd" => {
            tracing::trace!(session_id = %session_id, event_type, "Deepgram control event");
            None
        }
        "Error" => {
            let message = value
                .get("description")
                .or_else(|| value.get("message"))
                .and_then(|v| v.as_str())
                .unwrap_or("unknown error")
                .to_string();
            Some(TranscriptEvent::Error(message))
        }
        other => {
            tracing::debug!(session_id = %session_id, event_type = other, "Unhandled Deepgram event");
            None
        }
    }
}
