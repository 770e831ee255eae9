//! Streaming transcription backend seam.

use async_trait::async_trait;
use tokio::sync::mpsc;

/// Event produced by a live transcription connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TranscriptEvent {
    /// Interim or final hypothesis for the current segment. Empty text means
    /// the backend heard nothing.
    Transcript { text: String, is_final: bool },
    /// Backend-reported error; the connection may still be alive.
    Error(String),
}

/// One live connection. Dropping `audio_tx` asks the backend to finish; the
/// `events` receiver ending means the connection is gone.
pub struct TranscriptionConnection {
    pub audio_tx: mpsc::Sender<Vec<u8>>,
    pub events: mpsc::Receiver<TranscriptEvent>,
}

#[async_trait]
pub trait TranscriptionBackend: Send + Sync {
    fn name(&self) -> &str;

    /// Open a new live connection for `session_id`.
    async fn connect(&self, session_id: &str) -> anyhow::Result<TranscriptionConnection>;
}
