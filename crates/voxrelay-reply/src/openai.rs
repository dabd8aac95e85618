//! OpenAI Chat Completions reply generator.
//!
//! Streams `/v1/chat/completions` and concatenates the text deltas. Also
//! serves OpenRouter, Ollama, and other OpenAI-compatible endpoints.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio_stream::StreamExt;
use tracing::{debug, trace, warn};

use voxrelay_core::config::ReplyConfig;
use voxrelay_core::error::ReplyError;

use crate::history::ConversationTurn;
use crate::sse::{SseEvent, parse_sse_stream};
use crate::{ReplyContext, ReplyGenerator};

const OPENAI_BASE_URL: &str = "https://api.openai.com";
const OPENROUTER_BASE_URL: &str = "https://openrouter.ai/api";
const OLLAMA_BASE_URL: &str = "http://localhost:11434";

const DEFAULT_SYSTEM_PROMPT: &str = "You are a friendly voice assistant. Answer in one to three short spoken sentences without markdown or lists.";

/// API style; determines minor behavior differences.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiStyle {
    OpenAi,
    OpenRouter,
    Ollama,
}

pub struct ChatReply {
    pub base_url: String,
    pub api_style: ApiStyle,
    provider_id: String,
    model: String,
    api_key: Option<String>,
    system_prompt: String,
    max_tokens: u32,
    temperature: Option<f64>,
    client: reqwest::Client,
}

impl ChatReply {
    fn with_style(style: ApiStyle, base_url: Option<&str>, timeout: Duration) -> anyhow::Result<Self> {
        let (default_url, id, model) = match style {
            ApiStyle::OpenAi => (OPENAI_BASE_URL, "openai", "gpt-4o-mini"),
            ApiStyle::OpenRouter => (OPENROUTER_BASE_URL, "openrouter", "openai/gpt-4o-mini"),
            ApiStyle::Ollama => (OLLAMA_BASE_URL, "ollama", "llama3.2"),
        };
        Ok(Self {
            base_url: base_url
                .unwrap_or(default_url)
                .trim_end_matches('/')
                .to_string(),
            api_style: style,
            provider_id: id.into(),
            model: model.into(),
            api_key: None,
            system_prompt: DEFAULT_SYSTEM_PROMPT.into(),
            max_tokens: 256,
            temperature: None,
            client: reqwest::Client::builder().timeout(timeout).build()?,
        })
    }

    pub fn openai(base_url: Option<&str>, timeout: Duration) -> anyhow::Result<Self> {
        Self::with_style(ApiStyle::OpenAi, base_url, timeout)
    }

    pub fn openrouter(base_url: Option<&str>, timeout: Duration) -> anyhow::Result<Self> {
        Self::with_style(ApiStyle::OpenRouter, base_url, timeout)
    }

    pub fn ollama(base_url: Option<&str>, timeout: Duration) -> anyhow::Result<Self> {
        Self::with_style(ApiStyle::Ollama, base_url, timeout)
    }

    pub fn from_config(config: &ReplyConfig, timeout: Duration) -> anyhow::Result<Self> {
        let base_url = config.base_url.as_deref();
        let mut reply = match config.provider.as_str() {
            "openrouter" => Self::openrouter(base_url, timeout)?,
            "ollama" => Self::ollama(base_url, timeout)?,
            _ => Self::openai(base_url, timeout)?,
        };
        if let Some(model) = &config.model {
            reply.model = model.clone();
        }
        if let Some(prompt) = &config.system_prompt {
            reply.system_prompt = prompt.clone();
        }
        if let Some(max_tokens) = config.max_tokens {
            reply.max_tokens = max_tokens;
        }
        reply.temperature = config.temperature;
        reply.api_key = config.resolve_api_key();
        if reply.api_key.is_none() && reply.api_style != ApiStyle::Ollama {
            warn!(provider = %reply.provider_id, "No reply API key configured; requests will fail");
        }
        Ok(reply)
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// System prompt, prior turns, then the new user message.
    pub fn format_messages(&self, ctx: &ReplyContext) -> Vec<serde_json::Value> {
        let mut messages = Vec::with_capacity(ctx.history.len() + 2);
        messages.push(json!({ "role": "system", "content": self.system_prompt }));
        messages.extend(ctx.history.iter().map(turn_message));
        messages.push(json!({ "role": "user", "content": ctx.text }));
        messages
    }
}

fn turn_message(turn: &ConversationTurn) -> serde_json::Value {
    json!({ "role": turn.role.as_str(), "content": turn.text })
}

// --- OpenAI request/response types ---

#[derive(Debug, Serialize)]
struct OpenAiRequest<'a> {
    model: &'a str,
    messages: Vec<serde_json::Value>,
    max_tokens: u32,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionChunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: ChunkDelta,
}

#[derive(Debug, Default, Deserialize)]
struct ChunkDelta {
    #[serde(default)]
    content: Option<String>,
}

/// Outcome of one SSE event.
enum Step {
    Delta(String),
    Skip,
    Done,
}

fn parse_event(event: &SseEvent) -> Step {
    let data = event.data.trim();
    // OpenAI terminates with "data: [DONE]"
    if data == "[DONE]" {
        return Step::Done;
    }
    let chunk: ChatCompletionChunk = match serde_json::from_str(data) {
        Ok(c) => c,
        Err(e) => {
            trace!(%e, data, "Failed to parse OpenAI chunk");
            return Step::Skip;
        }
    };
    match chunk.choices.into_iter().next().and_then(|c| c.delta.content) {
        Some(content) if !content.is_empty() => Step::Delta(content),
        _ => Step::Skip,
    }
}

/// Concatenate the text deltas of an SSE event stream.
async fn collect_deltas<S>(mut events: S) -> Result<String, ReplyError>
where
    S: futures::Stream<Item = anyhow::Result<SseEvent>> + Unpin,
{
    let mut text = String::new();
    while let Some(event) = events.next().await {
        let event = event.map_err(|e| ReplyError::Unavailable(e.to_string()))?;
        match parse_event(&event) {
            Step::Delta(delta) => text.push_str(&delta),
            Step::Skip => {}
            Step::Done => break,
        }
    }
    let text = text.trim().to_string();
    if text.is_empty() {
        return Err(ReplyError::Unavailable("model returned an empty reply".into()));
    }
    Ok(text)
}

#[async_trait]
impl ReplyGenerator for ChatReply {
    fn id(&self) -> &str {
        &self.provider_id
    }

    async fn reply(&self, ctx: &ReplyContext) -> Result<String, ReplyError> {
        let body = OpenAiRequest {
            model: &self.model,
            messages: self.format_messages(ctx),
            max_tokens: self.max_tokens,
            stream: true,
            temperature: self.temperature,
        };

        debug!(
            session_id = %ctx.session_id,
            model = %self.model,
            base_url = %self.base_url,
            history = ctx.history.len(),
            "Streaming OpenAI-compatible API"
        );

        let mut req_builder = self
            .client
            .post(format!("{}/v1/chat/completions", self.base_url))
            .header("content-type", "application/json");

        // Auth differs by style
        if self.api_style != ApiStyle::Ollama {
            let api_key = self
                .api_key
                .as_deref()
                .ok_or_else(|| ReplyError::Unavailable("No reply API key configured".into()))?;
            req_builder = req_builder.header("authorization", format!("Bearer {api_key}"));
        }
        if self.api_style == ApiStyle::OpenRouter {
            req_builder = req_builder.header("X-Title", "voxrelay");
        }

        let response = req_builder
            .json(&body)
            .send()
            .await
            .map_err(|e| ReplyError::Unavailable(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(ReplyError::Unavailable(format!("API error {status}: {body}")));
        }

        collect_deltas(Box::pin(parse_sse_stream(response))).await
    }
}
