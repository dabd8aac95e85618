//! Speech-to-text over a Whisper-compatible HTTP API.

use tracing::debug;

use voxrelay_core::config::TranscriptionConfig;
use voxrelay_core::error::SpeechError;

use crate::http::{map_request_error, map_status};

/// Wrap raw little-endian 16-bit PCM bytes in a WAV container.
pub fn pcm_to_wav(pcm: &[u8], sample_rate: u32, channels: u16, bits_per_sample: u16) -> Vec<u8> {
    let data_len = pcm.len();
    let byte_rate = sample_rate * channels as u32 * bits_per_sample as u32 / 8;
    let block_align = channels * bits_per_sample / 8;
    let file_size = 36 + data_len as u32;

    let mut wav = Vec::with_capacity(44 + data_len);

    // RIFF header
    wav.extend_from_slice(b"RIFF");
    wav.extend_from_slice(&file_size.to_le_bytes());
    wav.extend_from_slice(b"WAVE");

    // fmt chunk
    wav.extend_from_slice(b"fmt ");
    wav.extend_from_slice(&16u32.to_le_bytes()); // chunk size
    wav.extend_from_slice(&1u16.to_le_bytes()); // PCM format
    wav.extend_from_slice(&channels.to_le_bytes());
    wav.extend_from_slice(&sample_rate.to_le_bytes());
    wav.extend_from_slice(&byte_rate.to_le_bytes());
    wav.extend_from_slice(&block_align.to_le_bytes());
    wav.extend_from_slice(&bits_per_sample.to_le_bytes());

    // data chunk
    wav.extend_from_slice(b"data");
    wav.extend_from_slice(&(data_len as u32).to_le_bytes());
    wav.extend_from_slice(pcm);

    wav
}

/// Get the transcription API URL for a given provider.
pub fn provider_url(config: &TranscriptionConfig) -> &'static str {
    match config.provider.as_str() {
        "openai" => "https://api.openai.com/v1/audio/transcriptions",
        _ => "https://api.groq.com/openai/v1/audio/transcriptions",
    }
}

/// Whisper-style multipart transcription client.
pub struct WhisperTranscriber {
    config: TranscriptionConfig,
    client: reqwest::Client,
}

impl WhisperTranscriber {
    pub fn new(config: TranscriptionConfig, client: reqwest::Client) -> Self {
        Self { config, client }
    }

    pub fn provider(&self) -> &str {
        &self.config.provider
    }

    /// Prepare the upload body: raw PCM is wrapped, encoded audio passes through.
    fn upload(&self, audio: &[u8]) -> (Vec<u8>, &'static str, &'static str) {
        if self.config.raw_pcm {
            let wav = pcm_to_wav(audio, self.config.sample_rate, 1, 16);
            (wav, "audio.wav", "audio/wav")
        } else {
            (audio.to_vec(), "audio.webm", "audio/webm")
        }
    }

    pub async fn transcribe(&self, audio: &[u8]) -> Result<String, SpeechError> {
        if self.config.raw_pcm && audio.len() % 2 != 0 {
            return Err(SpeechError::InvalidAudio(
                "PCM length must be even for 16-bit samples".into(),
            ));
        }

        let api_key = self.config.resolve_api_key().ok_or_else(|| {
            SpeechError::ProviderUnavailable("No transcription API key configured".into())
        })?;

        let (body, file_name, mime) = self.upload(audio);
        let url = provider_url(&self.config);
        let model = self
            .config
            .model
            .as_deref()
            .unwrap_or("whisper-large-v3-turbo");

        debug!(url, model, upload_bytes = body.len(), "Sending audio for transcription");

        let part = reqwest::multipart::Part::bytes(body)
            .file_name(file_name)
            .mime_str(mime)
            .map_err(|e| SpeechError::InvalidAudio(e.to_string()))?;

        let mut form = reqwest::multipart::Form::new()
            .text("model", model.to_string())
            .text("response_format", "text")
            .part("file", part);
        if let Some(language) = &self.config.language {
            form = form.text("language", language.clone());
        }

        let resp = self
            .client
            .post(url)
            .header("Authorization", format!("Bearer {api_key}"))
            .multipart(form)
            .send()
            .await
            .map_err(map_request_error)?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(map_status(status, &body, true));
        }

        let text = resp.text().await.map_err(map_request_error)?;
        Ok(text.trim().to_string())
    }
}
