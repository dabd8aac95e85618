//! voxrelay wire protocol.
//!
//! Client and server exchange JSON frames tagged by `type`. Audio payloads are
//! base64 in JSON. A client may also send an audio chunk as a binary message:
//! an 8-byte big-endian sequence number followed by the raw audio bytes.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ChannelError;

/// Length of the sequence-number prefix on binary audio frames.
pub const BINARY_SEQ_LEN: usize = 8;

/// Client -> server frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundFrame {
    StartAudio,
    AudioChunk {
        seq: u64,
        #[serde(with = "base64_bytes")]
        bytes: Vec<u8>,
    },
    EndAudio,
    TextMessage {
        text: String,
    },
    Stop,
}

impl InboundFrame {
    /// Decode a binary audio frame (`seq` as u64 big-endian, then audio bytes).
    pub fn from_binary(data: &[u8]) -> Result<Self, ChannelError> {
        if data.len() < BINARY_SEQ_LEN {
            return Err(ChannelError::Malformed(format!(
                "binary audio frame shorter than {BINARY_SEQ_LEN}-byte header"
            )));
        }
        let (header, audio) = data.split_at(BINARY_SEQ_LEN);
        let mut seq = [0u8; BINARY_SEQ_LEN];
        seq.copy_from_slice(header);
        Ok(Self::AudioChunk {
            seq: u64::from_be_bytes(seq),
            bytes: audio.to_vec(),
        })
    }

    /// Short name used in logs.
    pub fn name(&self) -> &'static str {
        match self {
            Self::StartAudio => "start_audio",
            Self::AudioChunk { .. } => "audio_chunk",
            Self::EndAudio => "end_audio",
            Self::TextMessage { .. } => "text_message",
            Self::Stop => "stop",
        }
    }
}

/// Server -> client frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundFrame {
    Transcript {
        text: String,
    },
    ReplyText {
        text: String,
    },
    AudioChunk {
        seq: u64,
        #[serde(with = "base64_bytes")]
        bytes: Vec<u8>,
    },
    StreamEnd,
    Error {
        kind: ErrorKind,
        message: String,
    },
    Status {
        phase: Phase,
    },
    Warning {
        message: String,
    },
}

impl OutboundFrame {
    pub fn error(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self::Error {
            kind,
            message: message.into(),
        }
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self::Warning {
            message: message.into(),
        }
    }
}

/// Session lifecycle phase, reported in `status` frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Idle,
    Buffering,
    Processing,
    Streaming,
    Closed,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Buffering => "buffering",
            Self::Processing => "processing",
            Self::Streaming => "streaming",
            Self::Closed => "closed",
        }
    }

    /// A pipeline run is in flight.
    pub fn is_busy(&self) -> bool {
        matches!(self, Self::Processing | Self::Streaming)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Machine-readable error category carried by `error` frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    ProviderUnavailable,
    Timeout,
    InvalidAudio,
    RateLimited,
    ReplyUnavailable,
    MalformedFrame,
    FrameTooLarge,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ProviderUnavailable => "provider_unavailable",
            Self::Timeout => "timeout",
            Self::InvalidAudio => "invalid_audio",
            Self::RateLimited => "rate_limited",
            Self::ReplyUnavailable => "reply_unavailable",
            Self::MalformedFrame => "malformed_frame",
            Self::FrameTooLarge => "frame_too_large",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

mod base64_bytes {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}
