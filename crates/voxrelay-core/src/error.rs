use thiserror::Error;

use crate::protocol::ErrorKind;

/// Failures of the transport channel itself.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChannelError {
    #[error("Malformed frame: {0}")]
    Malformed(String),

    #[error("Frame exceeds {limit} bytes")]
    FrameTooLarge { limit: usize },

    #[error("Transport closed")]
    Closed,
}

impl ChannelError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::FrameTooLarge { .. } => ErrorKind::FrameTooLarge,
            Self::Malformed(_) | Self::Closed => ErrorKind::MalformedFrame,
        }
    }
}

/// Failures reported by the external STT/TTS providers.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SpeechError {
    #[error("Speech provider unavailable: {0}")]
    ProviderUnavailable(String),

    #[error("Speech provider timed out")]
    Timeout,

    #[error("Invalid audio: {0}")]
    InvalidAudio(String),

    #[error("Speech provider rate limited")]
    RateLimited,

    /// The caller cancelled the request. Never reported to the client.
    #[error("Speech request cancelled")]
    Cancelled,
}

impl SpeechError {
    /// Only transient failures get an automatic retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout | Self::RateLimited)
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::ProviderUnavailable(_) | Self::Cancelled => ErrorKind::ProviderUnavailable,
            Self::Timeout => ErrorKind::Timeout,
            Self::InvalidAudio(_) => ErrorKind::InvalidAudio,
            Self::RateLimited => ErrorKind::RateLimited,
        }
    }
}

/// Failures of the reply-generation collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReplyError {
    #[error("Reply unavailable: {0}")]
    Unavailable(String),

    #[error("Reply cancelled")]
    Cancelled,
}

impl ReplyError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::ReplyUnavailable
    }
}

/// Caller errors raised synchronously by the session registry.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("Session '{0}' already exists")]
    DuplicateSession(String),

    #[error("Maximum concurrent sessions ({limit}) reached")]
    Full { limit: usize },
}

#[derive(Debug, Error)]
pub enum VoxRelayError {
    #[error("Config error: {0}")]
    Config(String),

    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error(transparent)]
    Speech(#[from] SpeechError),

    #[error(transparent)]
    Reply(#[from] ReplyError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, VoxRelayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_speech_errors() {
        assert!(SpeechError::Timeout.is_retryable());
        assert!(SpeechError::RateLimited.is_retryable());
        assert!(!SpeechError::InvalidAudio("empty".into()).is_retryable());
        assert!(!SpeechError::ProviderUnavailable("down".into()).is_retryable());
        assert!(!SpeechError::Cancelled.is_retryable());
    }

    #[test]
    fn test_error_kinds() {
        assert_eq!(SpeechError::Timeout.kind(), ErrorKind::Timeout);
        assert_eq!(
            SpeechError::InvalidAudio("x".into()).kind(),
            ErrorKind::InvalidAudio
        );
        assert_eq!(
            ReplyError::Unavailable("x".into()).kind(),
            ErrorKind::ReplyUnavailable
        );
        assert_eq!(
            ChannelError::FrameTooLarge { limit: 10 }.kind(),
            ErrorKind::FrameTooLarge
        );
    }

    #[test]
    fn test_registry_error_message() {
        let err = RegistryError::DuplicateSession("abc".into());
        assert_eq!(err.to_string(), "Session 'abc' already exists");
    }
}
