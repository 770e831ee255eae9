//! Error taxonomy shared across the pipeline stages.
//!
//! Backend seams (transcription, model, tools, synthesis) return
//! `anyhow::Result`; the enums here cover the failures callers branch on.

use std::path::PathBuf;

/// Failures at the telephony transport boundary.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Inbound text frame was not a recognised protocol message.
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
    /// Media payload was not valid base64.
    #[error("invalid media payload: {0}")]
    InvalidPayload(#[from] base64::DecodeError),
    /// Outbound audio was queued before the stream was bound by `start`.
    #[error("stream is not bound yet")]
    Unbound,
    /// The socket (or the writer task) is gone.
    #[error("transport closed")]
    Closed,
}

/// Why the dialogue engine refused an utterance.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SubmitError {
    #[error("dialogue engine is still processing a previous utterance")]
    Busy,
    #[error("dialogue engine has stopped")]
    Stopped,
}

/// Configuration loading and validation failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("could not find home directory")]
    NoHomeDir,
    #[error("invalid config: {0}")]
    Invalid(String),
}
