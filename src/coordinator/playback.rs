//! Outstanding-playback bookkeeping behind the segmenter mute.
//!
//! The agent is speaking while any reply is still being synthesized
//! (a *reservation*) or any sent segment has not been acknowledged (a
//! *marker*). The tracker reports the two edges: [`MuteChange::Mute`] when
//! the first hold appears and [`MuteChange::Unmute`] when the last one goes.

use crate::transport::PlaybackMarker;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackState {
    Idle,
    AgentSpeaking,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MuteChange {
    Mute,
    Unmute,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    /// Not outstanding: never registered, already acked, or force-released.
    Unknown,
    /// Resolved, but other holds remain.
    Pending { remaining: usize },
    /// Resolved the last hold; listening may resume.
    Released,
}

#[derive(Debug, Default)]
pub struct PlaybackTracker {
    /// Sent, unacknowledged markers in send order.
    markers: Vec<PlaybackMarker>,
    reservations: usize,
    /// Replies force-released while still in synthesis. Their completions
    /// arrive first (synthesis is serial) and must not consume live holds.
    abandoned_reservations: usize,
    last_activity: Option<Instant>,
}

impl PlaybackTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> PlaybackState {
        if self.markers.is_empty() && self.reservations == 0 {
            PlaybackState::Idle
        } else {
            PlaybackState::AgentSpeaking
        }
    }

    pub fn outstanding(&self) -> &[PlaybackMarker] {
        &self.markers
    }

    pub fn reservations(&self) -> usize {
        self.reservations
    }

    /// A reply was accepted for synthesis.
    pub fn reserve(&mut self, now: Instant) -> Option<MuteChange> {
        let before = self.state();
        self.reservations += 1;
        self.last_activity = Some(now);
        self.edge(before)
    }

    /// A reply's synthesis finished; its markers (if any) are registered.
    pub fn reply_finished(&mut self, now: Instant) -> Option<MuteChange> {
        if self.abandoned_reservations > 0 {
            self.abandoned_reservations -= 1;
            return None;
        }
        let before = self.state();
        self.reservations = self.reservations.saturating_sub(1);
        self.last_activity = Some(now);
        self.edge(before)
    }

    /// A segment is about to be sent with `marker`.
    pub fn register(&mut self, marker: PlaybackMarker, now: Instant) -> Option<MuteChange> {
        let before = self.state();
        self.markers.push(marker);
        self.last_activity = Some(now);
        self.edge(before)
    }

    pub fn acknowledge(&mut self, marker: &PlaybackMarker, now: Instant) -> AckOutcome {
        let Some(index) = self.markers.iter().position(|m| m == marker) else {
            return AckOutcome::Unknown;
        };
        self.markers.remove(index);
        self.last_activity = Some(now);
        match self.state() {
            PlaybackState::Idle => AckOutcome::Released,
            PlaybackState::AgentSpeaking => AckOutcome::Pending {
                remaining: self.markers.len() + self.reservations,
            },
        }
    }

    /// Drop every hold. Returns how many markers were abandoned, or `None`
    /// when already idle. Replies still in synthesis are remembered so their
    /// later completion is absorbed.
    pub fn force_release(&mut self) -> Option<usize> {
        if self.state() == PlaybackState::Idle {
            return None;
        }
        let abandoned = self.markers.len();
        self.markers.clear();
        self.abandoned_reservations += self.reservations;
        self.reservations = 0;
        self.last_activity = None;
        Some(abandoned)
    }

    /// When a missing acknowledgement should be given up on.
    pub fn deadline(&self, timeout: Duration) -> Option<Instant> {
        match self.state() {
            PlaybackState::Idle => None,
            PlaybackState::AgentSpeaking => self.last_activity.map(|at| at + timeout),
        }
    }

    fn edge(&self, before: PlaybackState) -> Option<MuteChange> {
        match (before, self.state()) {
            (PlaybackState::Idle, PlaybackState::AgentSpeaking) => Some(MuteChange::Mute),
            (PlaybackState::AgentSpeaking, PlaybackState::Idle) => Some(MuteChange::Unmute),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn marker(name: &str) -> PlaybackMarker {
        PlaybackMarker::from(name)
    }

    #[test]
    fn two_markers_release_on_second_ack() {
        let now = Instant::now();
        let mut tracker = PlaybackTracker::new();
        assert_eq!(tracker.reserve(now), Some(MuteChange::Mute));
        assert_eq!(tracker.register(marker("m1"), now), None);
        assert_eq!(tracker.register(marker("m2"), now), None);
        assert_eq!(tracker.reply_finished(now), None);
        assert_eq!(tracker.state(), PlaybackState::AgentSpeaking);

        assert_eq!(
            tracker.acknowledge(&marker("m1"), now),
            AckOutcome::Pending { remaining: 1 }
        );
        assert_eq!(tracker.state(), PlaybackState::AgentSpeaking);
        assert_eq!(tracker.acknowledge(&marker("m2"), now), AckOutcome::Released);
        assert_eq!(tracker.state(), PlaybackState::Idle);
        // A repeated ack changes nothing.
        assert_eq!(tracker.acknowledge(&marker("m2"), now), AckOutcome::Unknown);
    }

    #[test]
    fn reservation_holds_mute_until_synthesis_finishes() {
        let now = Instant::now();
        let mut tracker = PlaybackTracker::new();
        tracker.reserve(now);
        tracker.register(marker("ack"), now);
        tracker.reply_finished(now);
        // Final reply accepted before the ack segment played.
        assert_eq!(tracker.reserve(now), None);
        assert_eq!(
            tracker.acknowledge(&marker("ack"), now),
            AckOutcome::Pending { remaining: 1 }
        );
        assert_eq!(tracker.reply_finished(now), Some(MuteChange::Unmute));
    }

    #[test]
    fn silent_reply_unmutes_on_finish() {
        let now = Instant::now();
        let mut tracker = PlaybackTracker::new();
        assert_eq!(tracker.reserve(now), Some(MuteChange::Mute));
        assert_eq!(tracker.reply_finished(now), Some(MuteChange::Unmute));
        assert_eq!(tracker.reply_finished(now), None);
        assert_eq!(tracker.reservations(), 0);
    }

    #[test]
    fn mute_edges_match_outstanding_set() {
        // Muted exactly while something is outstanding, over an interleaving
        // of replies, segments and acks.
        let now = Instant::now();
        let mut tracker = PlaybackTracker::new();
        let mut muted = false;
        let apply = |change: Option<MuteChange>, muted: &mut bool| match change {
            Some(MuteChange::Mute) => {
                assert!(!*muted);
                *muted = true;
            }
            Some(MuteChange::Unmute) => {
                assert!(*muted);
                *muted = false;
            }
            None => {}
        };

        for round in 0..3 {
            apply(tracker.reserve(now), &mut muted);
            for i in 0..round + 1 {
                apply(tracker.register(marker(&format!("{round}-{i}")), now), &mut muted);
                assert!(muted);
            }
            apply(tracker.reply_finished(now), &mut muted);
            for i in 0..round + 1 {
                let outcome = tracker.acknowledge(&marker(&format!("{round}-{i}")), now);
                if outcome == AckOutcome::Released {
                    apply(Some(MuteChange::Unmute), &mut muted);
                }
                assert_eq!(muted, tracker.state() == PlaybackState::AgentSpeaking);
            }
        }
        assert!(!muted);
    }

    #[test]
    fn deadline_follows_last_activity_and_force_release_clears() {
        let t0 = Instant::now();
        let timeout = Duration::from_secs(8);
        let mut tracker = PlaybackTracker::new();
        assert_eq!(tracker.deadline(timeout), None);

        tracker.reserve(t0);
        tracker.register(marker("lost"), t0 + Duration::from_secs(1));
        tracker.reply_finished(t0 + Duration::from_secs(2));
        assert_eq!(tracker.deadline(timeout), Some(t0 + Duration::from_secs(10)));

        assert_eq!(tracker.force_release(), Some(1));
        assert_eq!(tracker.state(), PlaybackState::Idle);
        assert_eq!(tracker.deadline(timeout), None);
        assert_eq!(tracker.force_release(), None);
        assert_eq!(tracker.acknowledge(&marker("lost"), t0), AckOutcome::Unknown);
    }

    #[test]
    fn late_finish_of_released_reply_keeps_newer_reply_muted() {
        let now = Instant::now();
        let mut tracker = PlaybackTracker::new();
        assert_eq!(tracker.reserve(now), Some(MuteChange::Mute));
        assert_eq!(tracker.force_release(), Some(0));
        assert_eq!(tracker.state(), PlaybackState::Idle);

        // Next reply accepted while the released one is still synthesizing.
        assert_eq!(tracker.reserve(now), Some(MuteChange::Mute));
        // The released reply finishes: absorbed, the new reply still holds.
        assert_eq!(tracker.reply_finished(now), None);
        assert_eq!(tracker.state(), PlaybackState::AgentSpeaking);
        assert_eq!(tracker.reservations(), 1);

        tracker.register(marker("b"), now);
        assert_eq!(tracker.reply_finished(now), None);
        assert_eq!(tracker.acknowledge(&marker("b"), now), AckOutcome::Released);
        assert_eq!(tracker.state(), PlaybackState::Idle);
    }
}
