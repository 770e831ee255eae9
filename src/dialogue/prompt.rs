//! Request-time additions to the transcript.
//!
//! The stored transcript never changes after an append; the clock note is
//! applied to a rendered copy right before each model call.

use super::transcript::{Transcript, Turn};
use chrono::{DateTime, Utc};
use chrono_tz::Tz;

const DATETIME_KEY: &str = "current_datetime:";

/// `current_datetime: 2024-08-06 09:15:00` in the given zone.
pub fn datetime_note(now: DateTime<Utc>, tz: Tz) -> String {
    format!(
        "{DATETIME_KEY} {}",
        now.with_timezone(&tz).format("%Y-%m-%d %H:%M:%S")
    )
}

/// Copy of the transcript turns with `note` appended to the first system turn
/// (or prepended as one when there is none).
pub fn render_turns(transcript: &Transcript, note: &str) -> Vec<Turn> {
    let mut turns = transcript.turns().to_vec();
    let first_system = turns.iter().position(|turn| matches!(turn, Turn::System(_)));
    match first_system {
        Some(index) => {
            if let Turn::System(text) = &mut turns[index] {
                text.push_str("\n\n");
                text.push_str(note);
            }
        }
        None => turns.insert(0, Turn::System(note.to_string())),
    }
    turns
}

/// System notes describing the call, appended once when the engine starts.
pub fn call_context_notes(call_sid: Option<&str>, caller: Option<&str>) -> Vec<String> {
    let mut notes = Vec::new();
    if let Some(sid) = call_sid.filter(|s| !s.is_empty()) {
        notes.push(format!("callSid: {sid}"));
    }
    if let Some(number) = caller.filter(|s| !s.is_empty()) {
        notes.push(format!(
            "The caller's phone number is {number}. Let them know they'll receive a text \
             message with booking confirmation if they proceed."
        ));
    }
    notes
}
