//! Speech pipeline plumbing: the STT/TTS client facade, HTTP providers,
//! synthesis cache, and pronunciation rules.

pub mod cache;
pub mod http;
pub mod pronounce;
pub mod speech;
pub mod stt;
pub mod tts_stream;

pub use speech::{AudioStream, SpeechClient, SpeechPolicy, SpeechProvider};
