//! Speech service client: the facade every session uses to reach STT and TTS.
//!
//! Wraps a [`SpeechProvider`] with a bounded per-attempt timeout, a single
//! automatic retry for transient failures, and caller-driven cancellation.
//! Synthesis results are lazy streams that are forwarded as they arrive.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use voxrelay_core::config::SpeechConfig;
use voxrelay_core::error::SpeechError;

use crate::cache::SynthesisCache;
use crate::pronounce::Pronunciation;

/// Lazy, finite, non-restartable sequence of synthesized audio chunks.
pub type AudioStream = Pin<Box<dyn Stream<Item = Result<Bytes, SpeechError>> + Send>>;

/// An external STT/TTS backend.
#[async_trait]
pub trait SpeechProvider: Send + Sync {
    /// Provider identifier (e.g., "groq+elevenlabs").
    fn id(&self) -> &str;

    /// Voice used for synthesis, part of the synthesis cache key.
    fn voice(&self) -> &str {
        "default"
    }

    /// Transcribe one complete utterance.
    async fn transcribe(&self, audio: &[u8]) -> Result<String, SpeechError>;

    /// Start synthesizing `text`; chunks are yielded as the provider produces them.
    async fn synthesize(&self, text: &str) -> Result<AudioStream, SpeechError>;
}

/// Timeout and retry settings applied to every provider call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpeechPolicy {
    /// Bound on a single attempt, and on the gap between streamed chunks.
    pub timeout: Duration,
    /// Fixed delay before the retry.
    pub retry_backoff: Duration,
    /// Automatic retries for `Timeout` and `RateLimited`; never more than one.
    pub max_retries: u32,
}

impl Default for SpeechPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(15_000),
            retry_backoff: Duration::from_millis(250),
            max_retries: 1,
        }
    }
}

impl SpeechPolicy {
    pub fn from_config(config: &SpeechConfig) -> Self {
        let defaults = Self::default();
        Self {
            timeout: config
                .timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.timeout),
            retry_backoff: config
                .retry_backoff_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.retry_backoff),
            max_retries: config.max_retries.unwrap_or(defaults.max_retries).min(1),
        }
    }
}

/// Shared, read-only facade over the configured speech provider.
pub struct SpeechClient {
    provider: Arc<dyn SpeechProvider>,
    policy: SpeechPolicy,
    pronunciation: Pronunciation,
    cache: Option<SynthesisCache>,
}

impl SpeechClient {
    pub fn new(provider: Arc<dyn SpeechProvider>, policy: SpeechPolicy) -> Self {
        Self {
            provider,
            policy,
            pronunciation: Pronunciation::default(),
            cache: None,
        }
    }

    /// Build a client from the `speech` config section.
    pub fn from_config(
        provider: Arc<dyn SpeechProvider>,
        config: &SpeechConfig,
    ) -> anyhow::Result<Self> {
        let pronunciation = Pronunciation::from_rules(&config.pronunciation)?;
        let client = Self::new(provider, SpeechPolicy::from_config(config))
            .with_pronunciation(pronunciation)
            .with_cache(config.cache_entries.unwrap_or(64));
        Ok(client)
    }

    pub fn with_pronunciation(mut self, pronunciation: Pronunciation) -> Self {
        self.pronunciation = pronunciation;
        self
    }

    /// Keep up to `entries` completed syntheses; 0 disables the cache.
    pub fn with_cache(mut self, entries: usize) -> Self {
        self.cache = (entries > 0).then(|| SynthesisCache::new(entries));
        self
    }

    pub fn provider_id(&self) -> &str {
        self.provider.id()
    }

    /// Transcribe a complete utterance.
    pub async fn transcribe(
        &self,
        audio: &[u8],
        cancel: &CancellationToken,
    ) -> Result<String, SpeechError> {
        if audio.is_empty() {
            return Err(SpeechError::InvalidAudio("empty utterance".into()));
        }
        debug!(provider = self.provider.id(), bytes = audio.len(), "Transcribing utterance");
        self.call_with_retry("transcribe", cancel, || self.provider.transcribe(audio))
            .await
    }

    /// Synthesize `text`, returning a stream that ends early if `cancel` fires.
    pub async fn synthesize(
        &self,
        text: &str,
        cancel: &CancellationToken,
    ) -> Result<AudioStream, SpeechError> {
        let spoken = self.pronunciation.apply(text);
        if spoken.trim().is_empty() {
            return Ok(Box::pin(futures::stream::empty()));
        }

        let key = SynthesisCache::key(self.provider.voice(), &spoken);
        if let Some(chunks) = self.cache.as_ref().and_then(|c| c.get(&key)) {
            debug!(chunks = chunks.len(), "Synthesis cache hit");
            let replay = futures::stream::iter(chunks.iter().cloned().map(Ok).collect::<Vec<_>>());
            return Ok(guard_stream(Box::pin(replay), cancel.clone(), self.policy.timeout));
        }

        debug!(provider = self.provider.id(), chars = spoken.len(), "Starting synthesis");
        let stream = self
            .call_with_retry("synthesize", cancel, || self.provider.synthesize(&spoken))
            .await?;
        let stream = guard_stream(stream, cancel.clone(), self.policy.timeout);

        Ok(match &self.cache {
            Some(cache) => cache.record(key, stream),
            None => stream,
        })
    }

    async fn call_with_retry<T, F, Fut>(
        &self,
        op: &'static str,
        cancel: &CancellationToken,
        mut call: F,
    ) -> Result<T, SpeechError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, SpeechError>>,
    {
        let mut attempt = 0;
        loop {
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(SpeechError::Cancelled),
                result = tokio::time::timeout(self.policy.timeout, call()) => {
                    result.unwrap_or(Err(SpeechError::Timeout))
                }
            };

            match result {
                Err(e) if e.is_retryable() && attempt < self.policy.max_retries => {
                    attempt += 1;
                    warn!(op, attempt, error = %e, "Speech call failed, retrying");
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(SpeechError::Cancelled),
                        _ = tokio::time::sleep(self.policy.retry_backoff) => {}
                    }
                }
                other => return other,
            }
        }
    }
}

/// Bound the gap between chunks and stop the stream once `cancel` fires.
///
/// A cancelled or timed-out stream yields one final error and then ends; the
/// provider stream is dropped with it.
fn guard_stream(inner: AudioStream, cancel: CancellationToken, idle: Duration) -> AudioStream {
    Box::pin(futures::stream::unfold(Some(inner), move |state| {
        let cancel = cancel.clone();
        async move {
            let mut inner = state?;
            tokio::select! {
                biased;
                _ = cancel.cancelled() => Some((Err(SpeechError::Cancelled), None)),
                next = tokio::time::timeout(idle, inner.next()) => match next {
                    Ok(Some(Ok(chunk))) => Some((Ok(chunk), Some(inner))),
                    Ok(Some(Err(e))) => Some((Err(e), None)),
                    Ok(None) => None,
                    Err(_) => Some((Err(SpeechError::Timeout), None)),
                },
            }
        }
    }))
}
