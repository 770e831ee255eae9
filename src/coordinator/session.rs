//! Per-call state owned by the coordinator task.

use super::playback::PlaybackTracker;
use crate::transport::StreamStart;
use chrono::{DateTime, Utc};

#[derive(Debug)]
pub struct CallSession {
    pub session_id: String,
    pub stream_sid: String,
    pub call_sid: String,
    pub caller: Option<String>,
    /// Highest turn index a reply has been accepted for.
    pub turn: u64,
    /// Mirrors the segmenter mute; true exactly while `playback` holds anything.
    pub muted: bool,
    pub playback: PlaybackTracker,
    pub started_at: DateTime<Utc>,
    pub utterances: u64,
}

impl CallSession {
    pub fn new(start: &StreamStart) -> Self {
        let session_id = if start.call_sid.is_empty() {
            start.stream_sid.clone()
        } else {
            start.call_sid.clone()
        };
        Self {
            session_id,
            stream_sid: start.stream_sid.clone(),
            call_sid: start.call_sid.clone(),
            caller: start.caller.clone(),
            turn: 0,
            muted: false,
            playback: PlaybackTracker::new(),
            started_at: Utc::now(),
            utterances: 0,
        }
    }

    pub fn elapsed_secs(&self) -> i64 {
        (Utc::now() - self.started_at).num_seconds()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn session_id_prefers_call_sid() {
        let mut start = StreamStart {
            stream_sid: "MZ1".into(),
            call_sid: "CA1".into(),
            caller: Some("+15550100".into()),
            custom_parameters: HashMap::new(),
        };
        let session = CallSession::new(&start);
        assert_eq!(session.session_id, "CA1");
        assert!(!session.muted);
        assert_eq!(session.turn, 0);

        start.call_sid.clear();
        assert_eq!(CallSession::new(&start).session_id, "MZ1");
    }
}
