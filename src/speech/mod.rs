//! Speech output: reply text to ordered, marked audio segments.

pub mod elevenlabs;
pub mod pipeline;

use async_trait::async_trait;
use futures_util::Stream;
use std::pin::Pin;

pub use elevenlabs::ElevenLabsSynthesizer;
pub use pipeline::{SpeechEvent, SpeechHandle, SpeechPipeline};

/// Encoded audio as the synthesis backend produces it: one buffer or many
/// streamed chunks, in playback order.
pub type AudioStream = Pin<Box<dyn Stream<Item = anyhow::Result<Vec<u8>>> + Send>>;

#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    fn name(&self) -> &str;

    async fn synthesize(&self, text: &str) -> anyhow::Result<AudioStream>;
}
