//! Bounded exponential backoff for transcription reconnects.

use crate::config::SegmenterConfig;
use std::time::Duration;

/// Counts reconnect attempts and hands out the delay before each one.
///
/// Delays double from `base` up to `max`; after `max_attempts` delays the
/// backoff is exhausted until [`Backoff::reset`] (a successful connect).
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    max_attempts: u32,
    attempt: u32,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration, max_attempts: u32) -> Self {
        Self {
            base,
            max,
            max_attempts,
            attempt: 0,
        }
    }

    pub fn from_config(config: &SegmenterConfig) -> Self {
        Self::new(
            Duration::from_millis(config.reconnect_base_delay_ms),
            Duration::from_millis(config.reconnect_max_delay_ms),
            config.reconnect_max_attempts,
        )
    }

    /// Delay before the next attempt, or `None` when attempts are exhausted.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempt >= self.max_attempts {
            return None;
        }
        let factor = 2u32.saturating_pow(self.attempt);
        self.attempt += 1;
        Some(self.base.saturating_mul(factor).min(self.max))
    }

    /// Attempts handed out since the last reset.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn is_exhausted(&self) -> bool {
        self.attempt >= self.max_attempts
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}
