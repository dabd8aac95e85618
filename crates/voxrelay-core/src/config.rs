//! Configuration loading and validation.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Top-level voxrelay configuration, loaded from a JSON5 file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gateway: Option<GatewayConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub speech: Option<SpeechConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply: Option<ReplyConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub session: Option<SessionConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub logging: Option<LoggingConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub bind: Option<String>,

    /// Largest inbound frame accepted, including a partially reassembled one.
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,

    /// Maximum concurrent sessions (one per connection).
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            bind: None,
            max_frame_bytes: default_max_frame_bytes(),
            max_sessions: default_max_sessions(),
        }
    }
}

fn default_port() -> u16 {
    18790
}

fn default_max_frame_bytes() -> usize {
    1_048_576
}

fn default_max_sessions() -> usize {
    256
}

// --- Speech providers ---

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SpeechConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transcription: Option<TranscriptionConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub tts: Option<TtsConfig>,

    /// Per-attempt timeout for transcribe/synthesize (default: 15000).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,

    /// Fixed delay before the single retry (default: 250).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_backoff_ms: Option<u64>,

    /// Automatic retries for timeouts and rate limits (default: 1, max: 1).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,

    /// Completed syntheses kept in memory (default: 64, 0 disables).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_entries: Option<usize>,

    /// Replacements applied to text before synthesis only.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pronunciation: Vec<PronunciationRule>,
}

/// Voice transcription (speech-to-text) configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptionConfig {
    /// Provider: "groq" or "openai" (default: "groq").
    #[serde(default = "default_transcription_provider")]
    pub provider: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,

    /// Model name (e.g. "whisper-large-v3-turbo").
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    /// Language hint passed to the provider (e.g. "ja").
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,

    /// Clients send raw 16-bit mono PCM that must be wrapped in WAV.
    #[serde(default)]
    pub raw_pcm: bool,

    /// Sample rate of raw PCM input (default: 16000).
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,
}

fn default_transcription_provider() -> String {
    "groq".into()
}

fn default_sample_rate() -> u32 {
    16_000
}

impl TranscriptionConfig {
    pub fn resolve_api_key(&self) -> Option<String> {
        resolve_secret_field(&self.api_key, &self.api_key_env)
    }
}

/// Text-to-speech (TTS) configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TtsConfig {
    /// TTS provider (default: "elevenlabs").
    #[serde(default = "default_tts_provider")]
    pub provider: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,

    /// Default voice ID.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_voice: Option<String>,

    /// Default model ID (e.g. "eleven_turbo_v2").
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_model: Option<String>,

    /// Output format (default: "mp3_44100_128").
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_format: Option<String>,
}

fn default_tts_provider() -> String {
    "elevenlabs".into()
}

impl TtsConfig {
    pub fn resolve_api_key(&self) -> Option<String> {
        resolve_secret_field(&self.api_key, &self.api_key_env)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PronunciationRule {
    /// Regular expression matched against the reply text.
    pub pattern: String,
    /// Replacement; `$1`-style capture references are allowed.
    pub replacement: String,
}

// --- Reply generation ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplyConfig {
    /// Provider: "openai", "openrouter", "ollama", or "echo" (default: "openai").
    #[serde(default = "default_reply_provider")]
    pub provider: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,

    /// JSON file of keyword rules consulted before the model.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rules_path: Option<String>,

    /// Conversation turns kept per session (default: 20).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub history_turns: Option<usize>,

    /// Reply request timeout (default: 30000).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl Default for ReplyConfig {
    fn default() -> Self {
        Self {
            provider: default_reply_provider(),
            api_key: None,
            api_key_env: None,
            base_url: None,
            model: None,
            system_prompt: None,
            max_tokens: None,
            temperature: None,
            rules_path: None,
            history_turns: None,
            timeout_ms: None,
        }
    }
}

fn default_reply_provider() -> String {
    "openai".into()
}

impl ReplyConfig {
    pub fn resolve_api_key(&self) -> Option<String> {
        resolve_secret_field(&self.api_key, &self.api_key_env)
    }
}

// --- Session behavior ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Send `status` frames on every phase change (default: true).
    #[serde(default = "default_true")]
    pub emit_status: bool,

    /// Capacity of each session's inbound event queue (default: 64).
    #[serde(default = "default_inbound_queue")]
    pub inbound_queue: usize,

    /// How long a disconnect waits for the session task to wind down (default: 2000).
    #[serde(default = "default_close_grace_ms")]
    pub close_grace_ms: u64,

    /// Largest utterance buffered between `start_audio` and `end_audio` (default: 10 MiB).
    #[serde(default = "default_max_utterance_bytes")]
    pub max_utterance_bytes: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            emit_status: true,
            inbound_queue: default_inbound_queue(),
            close_grace_ms: default_close_grace_ms(),
            max_utterance_bytes: default_max_utterance_bytes(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_inbound_queue() -> usize {
    64
}

fn default_close_grace_ms() -> u64 {
    2_000
}

fn default_max_utterance_bytes() -> usize {
    10 * 1_048_576
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log format: "plain" (default) or "json".
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Log level override (trace/debug/info/warn/error).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,

    /// Per-crate log level overrides (e.g. "voxrelay_gateway=debug").
    #[serde(default)]
    pub filters: Vec<String>,

    /// Output target: "stderr" (default) or "stdout".
    #[serde(default = "default_log_output")]
    pub output: String,
}

fn default_log_format() -> String {
    "plain".into()
}

fn default_log_output() -> String {
    "stderr".into()
}

/// Resolve a secret: check the direct value first, then the env-var reference.
pub fn resolve_secret_field(direct: &Option<String>, env_var: &Option<String>) -> Option<String> {
    if let Some(val) = direct {
        if !val.is_empty() {
            return Some(val.clone());
        }
    }
    if let Some(env) = env_var {
        if let Ok(val) = std::env::var(env) {
            if !val.is_empty() {
                return Some(val);
            }
        }
    }
    None
}

/// Substitute `${ENV_VAR}` patterns in a string with their environment variable values.
fn substitute_env_vars(input: &str) -> String {
    let re = regex::Regex::new(r"\$\{([^}]+)\}").expect("static regex");
    re.replace_all(input, |caps: &regex::Captures| {
        let var_name = &caps[1];
        std::env::var(var_name).unwrap_or_default()
    })
    .into_owned()
}

impl Config {
    /// Load config from a JSON5 file, substituting `${ENV_VAR}` references.
    pub fn load(path: &Path) -> crate::error::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let raw = std::fs::read_to_string(path).map_err(crate::error::VoxRelayError::Io)?;
        Self::parse(&raw)
    }

    /// Parse config text (JSON5) after env substitution.
    pub fn parse(raw: &str) -> crate::error::Result<Self> {
        let substituted = substitute_env_vars(raw);
        json5::from_str(&substituted)
            .map_err(|e| crate::error::VoxRelayError::Config(e.to_string()))
    }

    /// Default config file location.
    pub fn config_path() -> PathBuf {
        data_dir().join("config.json")
    }

    pub fn gateway(&self) -> GatewayConfig {
        self.gateway.clone().unwrap_or_default()
    }

    pub fn speech(&self) -> SpeechConfig {
        self.speech.clone().unwrap_or_default()
    }

    pub fn reply(&self) -> ReplyConfig {
        self.reply.clone().unwrap_or_default()
    }

    pub fn session(&self) -> SessionConfig {
        self.session.clone().unwrap_or_default()
    }

    /// Gateway port.
    pub fn gateway_port(&self) -> u16 {
        self.gateway
            .as_ref()
            .map(|g| g.port)
            .unwrap_or_else(default_port)
    }

    /// Gateway bind address.
    pub fn gateway_bind(&self) -> String {
        self.gateway
            .as_ref()
            .and_then(|g| g.bind.clone())
            .unwrap_or_else(|| "0.0.0.0".to_string())
    }

    /// Get a config value by dotted path (e.g. "gateway.port", "speech.tts.default_voice").
    pub fn get_path(&self, path: &str) -> Option<serde_json::Value> {
        let json = serde_json::to_value(self).ok()?;
        let mut current = &json;
        for segment in path.split('.') {
            current = current.get(segment)?;
        }
        Some(current.clone())
    }

    /// Validate config, returning (warnings, errors).
    pub fn validate(&self) -> (Vec<String>, Vec<String>) {
        let mut warnings = Vec::new();
        let mut errors = Vec::new();

        let speech = self.speech();
        match &speech.transcription {
            Some(t) if t.resolve_api_key().is_none() => warnings.push(format!(
                "Transcription provider '{}' has no API key configured",
                t.provider
            )),
            Some(_) => {}
            None => warnings.push("No transcription provider configured".to_string()),
        }
        match &speech.tts {
            Some(t) if t.resolve_api_key().is_none() => warnings.push(format!(
                "TTS provider '{}' has no API key configured",
                t.provider
            )),
            Some(_) => {}
            None => warnings.push("No TTS provider configured".to_string()),
        }
        if speech.max_retries.is_some_and(|r| r > 1) {
            warnings.push("speech.max_retries is capped at 1".to_string());
        }
        for rule in &speech.pronunciation {
            if let Err(e) = regex::Regex::new(&rule.pattern) {
                errors.push(format!("Invalid pronunciation pattern '{}': {e}", rule.pattern));
            }
        }

        let reply = self.reply();
        if !matches!(reply.provider.as_str(), "ollama" | "echo") && reply.resolve_api_key().is_none()
        {
            warnings.push(format!(
                "Reply provider '{}' has no API key configured",
                reply.provider
            ));
        }
        if let Some(rules) = &reply.rules_path {
            let expanded = shellexpand_tilde(rules);
            if !expanded.exists() {
                errors.push(format!("Reply rules file not found: {}", expanded.display()));
            }
        }

        if let Some(gw) = &self.gateway {
            if gw.port == 0 {
                errors.push("Gateway port cannot be 0".to_string());
            }
            if gw.max_frame_bytes == 0 {
                errors.push("gateway.max_frame_bytes cannot be 0".to_string());
            }
            if gw.max_sessions == 0 {
                errors.push("gateway.max_sessions cannot be 0".to_string());
            }
        }

        if self.session().inbound_queue == 0 {
            errors.push("session.inbound_queue cannot be 0".to_string());
        }
        if self.session().max_utterance_bytes == 0 {
            errors.push("session.max_utterance_bytes cannot be 0".to_string());
        }

        (warnings, errors)
    }
}

/// Expand a leading `~` in a configured path.
pub fn shellexpand_tilde(path: &str) -> PathBuf {
    let expanded = shellexpand::tilde(path);
    PathBuf::from(expanded.as_ref())
}

/// Base directory for voxrelay data: `~/.voxrelay/`
pub fn data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".voxrelay")
}
