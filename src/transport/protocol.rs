//! Wire schema for the telephony media-stream WebSocket.
//!
//! ## Protocol
//!
//! ```text
//! Carrier ──WebSocket──▸ callturn
//!   connected, start, media…, mark…, stop
//!   ◂── media + mark pairs
//! ```
//!
//! All messages are JSON text frames discriminated by `event`. Audio payloads
//! are base64 inside JSON and are opaque to the orchestrator.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

// ── Carrier → Server messages ─────────────────────────────────────

/// Messages received from the telephony carrier.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum InboundFrame {
    /// Handshake sent before `start`; carries nothing we need.
    Connected {
        #[serde(default)]
        protocol: Option<String>,
    },

    /// Stream metadata; begins the call session.
    Start { start: StartPayload },

    /// One inbound audio frame.
    Media { media: MediaPayload },

    /// Playback of a previously sent marked segment finished.
    Mark {
        #[serde(rename = "sequenceNumber", default)]
        sequence_number: Option<serde_json::Value>,
        mark: MarkPayload,
    },

    /// The call ended.
    Stop {
        #[serde(default)]
        stop: Option<serde_json::Value>,
    },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartPayload {
    pub stream_sid: String,
    pub call_sid: String,
    /// Caller number, when the carrier puts it on the start message.
    #[serde(default)]
    pub from: Option<String>,
    /// `<Parameter>` values from the connect verb.
    #[serde(default)]
    pub custom_parameters: HashMap<String, String>,
}

impl StartPayload {
    /// Caller number from the start message or its custom parameters.
    pub fn caller(&self) -> Option<String> {
        self.from
            .clone()
            .or_else(|| self.custom_parameters.get("from").cloned())
            .filter(|from| !from.trim().is_empty())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaPayload {
    /// Base64-encoded audio frame.
    pub payload: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarkPayload {
    pub name: String,
}

// ── Server → Carrier messages ─────────────────────────────────────

/// Messages sent to the telephony carrier.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum OutboundFrame {
    Media {
        #[serde(rename = "streamSid")]
        stream_sid: String,
        media: MediaPayload,
    },
    Mark {
        #[serde(rename = "streamSid")]
        stream_sid: String,
        mark: MarkPayload,
    },
}
