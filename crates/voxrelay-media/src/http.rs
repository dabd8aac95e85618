//! HTTP-backed speech provider and provider error mapping.

use async_trait::async_trait;
use reqwest::StatusCode;
use tracing::warn;

use voxrelay_core::config::SpeechConfig;
use voxrelay_core::error::SpeechError;

use crate::speech::{AudioStream, SpeechProvider};
use crate::stt::WhisperTranscriber;
use crate::tts_stream::ElevenLabsTts;

/// Map a non-success provider response to a [`SpeechError`].
///
/// `recognition` marks STT requests, where client errors mean the audio
/// itself was rejected.
pub fn map_status(status: StatusCode, body: &str, recognition: bool) -> SpeechError {
    warn!(%status, body = %truncate(body, 200), "Speech provider returned an error");
    match status {
        StatusCode::TOO_MANY_REQUESTS => SpeechError::RateLimited,
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => SpeechError::Timeout,
        StatusCode::BAD_REQUEST
        | StatusCode::PAYLOAD_TOO_LARGE
        | StatusCode::UNSUPPORTED_MEDIA_TYPE
        | StatusCode::UNPROCESSABLE_ENTITY
            if recognition =>
        {
            SpeechError::InvalidAudio(format!("{status}: {}", truncate(body, 200)))
        }
        _ => SpeechError::ProviderUnavailable(format!("{status}: {}", truncate(body, 200))),
    }
}

/// Map a transport-level reqwest failure.
pub fn map_request_error(err: reqwest::Error) -> SpeechError {
    if err.is_timeout() {
        SpeechError::Timeout
    } else {
        SpeechError::ProviderUnavailable(err.to_string())
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// Whisper-compatible STT plus ElevenLabs streaming TTS over one shared client.
pub struct HttpSpeechProvider {
    id: String,
    stt: WhisperTranscriber,
    tts: ElevenLabsTts,
}

impl HttpSpeechProvider {
    pub fn from_config(config: &SpeechConfig) -> Self {
        let client = reqwest::Client::new();
        let transcription = config.transcription.clone().unwrap_or_else(|| {
            voxrelay_core::config::TranscriptionConfig {
                provider: "groq".into(),
                api_key: None,
                api_key_env: Some("GROQ_API_KEY".into()),
                model: None,
                language: None,
                raw_pcm: false,
                sample_rate: 16_000,
            }
        });
        let tts = config
            .tts
            .clone()
            .unwrap_or_else(|| voxrelay_core::config::TtsConfig {
                provider: "elevenlabs".into(),
                api_key: None,
                api_key_env: Some("ELEVENLABS_API_KEY".into()),
                default_voice: None,
                default_model: None,
                output_format: None,
            });

        let id = format!("{}+{}", transcription.provider, tts.provider);
        Self {
            id,
            stt: WhisperTranscriber::new(transcription, client.clone()),
            tts: ElevenLabsTts::new(tts, client),
        }
    }
}

#[async_trait]
impl SpeechProvider for HttpSpeechProvider {
    fn id(&self) -> &str {
        &self.id
    }

    fn voice(&self) -> &str {
        self.tts.voice()
    }

    async fn transcribe(&self, audio: &[u8]) -> Result<String, SpeechError> {
        self.stt.transcribe(audio).await
    }

    async fn synthesize(&self, text: &str) -> Result<AudioStream, SpeechError> {
        self.tts.stream(text).await
    }
}
