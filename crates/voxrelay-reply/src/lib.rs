//! Reply generation.
//!
//! Each generator implements the [`ReplyGenerator`] trait. The session asks
//! for exactly one reply per user turn; keyword rules are consulted first and
//! an OpenAI-compatible chat model answers everything else.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::info;

use voxrelay_core::config::{ReplyConfig, shellexpand_tilde};
use voxrelay_core::error::ReplyError;

pub mod chain;
pub mod history;
pub mod openai;
pub mod rules;
pub mod sse;

pub use chain::ReplyChain;
pub use history::{ConversationHistory, ConversationTurn, Role};
pub use openai::ChatReply;
pub use rules::KeywordRules;

/// Everything a generator gets to see for one user turn.
#[derive(Debug, Clone)]
pub struct ReplyContext {
    pub session_id: String,
    pub text: String,
    /// Earlier turns of this session, oldest first.
    pub history: Vec<ConversationTurn>,
}

impl ReplyContext {
    pub fn new(session_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            text: text.into(),
            history: Vec::new(),
        }
    }

    pub fn with_history(mut self, history: Vec<ConversationTurn>) -> Self {
        self.history = history;
        self
    }
}

/// The core reply generator trait.
#[async_trait]
pub trait ReplyGenerator: Send + Sync {
    /// Generator identifier (e.g., "openai", "rules").
    fn id(&self) -> &str;

    /// Produce the reply text for `ctx.text`.
    async fn reply(&self, ctx: &ReplyContext) -> Result<String, ReplyError>;
}

/// Offline generator that repeats the user's words back.
pub struct EchoReply;

#[async_trait]
impl ReplyGenerator for EchoReply {
    fn id(&self) -> &str {
        "echo"
    }

    async fn reply(&self, ctx: &ReplyContext) -> Result<String, ReplyError> {
        Ok(format!("You said: {}", ctx.text.trim()))
    }
}

/// Build the configured generator chain: keyword rules (if any), then the provider.
pub fn build_generator(config: &ReplyConfig) -> anyhow::Result<Arc<dyn ReplyGenerator>> {
    let fallback: Arc<dyn ReplyGenerator> = match config.provider.as_str() {
        "echo" => Arc::new(EchoReply),
        "openai" | "openrouter" | "ollama" => {
            let timeout = Duration::from_millis(config.timeout_ms.unwrap_or(30_000));
            Arc::new(ChatReply::from_config(config, timeout)?)
        }
        other => anyhow::bail!("Unknown reply provider: {other}"),
    };

    let rules = match &config.rules_path {
        Some(path) => {
            let path = shellexpand_tilde(path);
            let rules = KeywordRules::load(&path)?;
            info!(path = %path.display(), count = rules.len(), "Loaded keyword rules");
            rules
        }
        None => KeywordRules::default(),
    };

    Ok(Arc::new(ReplyChain::new(rules, fallback)))
}
