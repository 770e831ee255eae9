//! ElevenLabs streaming text-to-speech.
//!
//! `POST {api_url}/v1/text-to-speech/{voice}/stream?output_format=ulaw_8000`
//! returns the encoded audio as a chunked body; each body chunk is yielded
//! as it arrives so playback can start before synthesis finishes.

use super::{AudioStream, SpeechSynthesizer};
use crate::config::SpeechConfig;
use async_trait::async_trait;
use futures_util::StreamExt;
use serde_json::json;
use std::time::Duration;

pub struct ElevenLabsSynthesizer {
    config: SpeechConfig,
    client: reqwest::Client,
}

impl ElevenLabsSynthesizer {
    pub fn new(config: SpeechConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to build HTTP client: {e}"))?;
        Ok(Self { config, client })
    }

    fn stream_url(&self, voice_id: &str) -> String {
        format!(
            "{}/v1/text-to-speech/{voice_id}/stream?output_format={}",
            self.config.api_url.trim_end_matches('/'),
            self.config.output_format
        )
    }
}

#[async_trait]
impl SpeechSynthesizer for ElevenLabsSynthesizer {
    fn name(&self) -> &str {
        "elevenlabs"
    }

    async fn synthesize(&self, text: &str) -> anyhow::Result<AudioStream> {
        let api_key = self
            .config
            .api_key
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("ElevenLabs API key is not configured"))?;
        let voice_id = self
            .config
            .voice_id
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("ElevenLabs voice id is not configured"))?;

        let body = json!({
            "text": text,
            "model_id": self.config.model_id,
            "voice_settings": {
                "stability": self.config.stability,
                "similarity_boost": self.config.similarity_boost,
            }
        });

        let response = self
            .client
            .post(self.stream_url(voice_id))
            .header("xi-api-key", api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("Synthesis request failed: {e}"))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Synthesis returned {status}: {body}");
        }

        Ok(response
            .bytes_stream()
            .map(|chunk| {
                chunk
                    .map(|bytes| bytes.to_vec())
                    .map_err(|e| anyhow::anyhow!("Synthesis stream error: {e}"))
            })
            .boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config(api_url: String) -> SpeechConfig {
        SpeechConfig {
            api_url,
            api_key: Some("xi-test".into()),
            voice_id: Some("voice-1".into()),
            ..SpeechConfig::default()
        }
    }

    #[tokio::test]
    async fn posts_text_and_streams_audio() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/text-to-speech/voice-1/stream"))
            .and(query_param("output_format", "ulaw_8000"))
            .and(header("xi-api-key", "xi-test"))
            .and(body_partial_json(json!({
                "text": "Hello caller.",
                "model_id": "eleven_turbo_v2_5",
                "voice_settings": { "stability": 0.75, "similarity_boost": 1.0 }
            })))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![0x7f_u8; 320]))
            .expect(1)
            .mount(&server)
            .await;

        let synth = ElevenLabsSynthesizer::new(config(server.uri())).unwrap();
        let chunks: Vec<_> = synth
            .synthesize("Hello caller.")
            .await
            .unwrap()
            .collect()
            .await;
        let audio: Vec<u8> = chunks.into_iter().flat_map(Result::unwrap).collect();
        assert_eq!(audio.len(), 320);
        assert!(audio.iter().all(|b| *b == 0x7f));
    }

    #[tokio::test]
    async fn error_status_is_a_synthesis_failure() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429).set_body_string("quota exceeded"))
            .mount(&server)
            .await;

        let synth = ElevenLabsSynthesizer::new(config(server.uri())).unwrap();
        let err = synth.synthesize("Hi").await.err().unwrap();
        assert!(err.to_string().contains("429"));
    }

    #[tokio::test]
    async fn missing_voice_is_rejected_before_request() {
        let synth = ElevenLabsSynthesizer::new(SpeechConfig {
            api_key: Some("xi-test".into()),
            voice_id: None,
            ..SpeechConfig::default()
        })
        .unwrap();
        let err = synth.synthesize("Hi").await.err().unwrap();
        assert!(err.to_string().contains("voice id"));
    }
}
