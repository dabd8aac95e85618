//! Streaming TTS: audio chunks are yielded as they arrive from the provider.

use futures::StreamExt;
use tracing::debug;

use voxrelay_core::config::TtsConfig;
use voxrelay_core::error::SpeechError;

use crate::http::{map_request_error, map_status};
use crate::speech::AudioStream;

const ELEVENLABS_BASE_URL: &str = "https://api.elevenlabs.io";

/// Build the ElevenLabs streaming TTS request URL for a given voice.
pub fn build_tts_url(voice: &str) -> String {
    format!("{ELEVENLABS_BASE_URL}/v1/text-to-speech/{voice}/stream")
}

/// ElevenLabs streaming synthesis client.
pub struct ElevenLabsTts {
    config: TtsConfig,
    client: reqwest::Client,
}

impl ElevenLabsTts {
    pub fn new(config: TtsConfig, client: reqwest::Client) -> Self {
        Self { config, client }
    }

    pub fn voice(&self) -> &str {
        self.config.default_voice.as_deref().unwrap_or("Rachel")
    }

    fn model(&self) -> &str {
        self.config
            .default_model
            .as_deref()
            .unwrap_or("eleven_turbo_v2")
    }

    fn output_format(&self) -> &str {
        self.config
            .output_format
            .as_deref()
            .unwrap_or("mp3_44100_128")
    }

    /// Start a synthesis; the returned stream forwards response body chunks.
    pub async fn stream(&self, text: &str) -> Result<AudioStream, SpeechError> {
        let api_key = self
            .config
            .resolve_api_key()
            .ok_or_else(|| SpeechError::ProviderUnavailable("No TTS API key configured".into()))?;

        let voice = self.voice();
        let url = build_tts_url(voice);

        debug!(voice, model = self.model(), text_len = text.len(), "Starting TTS stream");

        let resp = self
            .client
            .post(&url)
            .query(&[("output_format", self.output_format())])
            .header("xi-api-key", &api_key)
            .header("Content-Type", "application/json")
            .json(&serde_json::json!({
                "text": text,
                "model_id": self.model(),
            }))
            .send()
            .await
            .map_err(map_request_error)?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(map_status(status, &body, false));
        }

        let stream = resp
            .bytes_stream()
            .map(|chunk| chunk.map_err(map_request_error));
        Ok(Box::pin(stream))
    }
}
