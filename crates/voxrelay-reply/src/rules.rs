//! Keyword rules consulted before the chat model.
//!
//! Rules are a JSON array:
//!
//! ```json
//! [{ "id": "greeting", "match": { "any_keywords": ["hello", "hi"] }, "response": "Hello!" }]
//! ```
//!
//! The first rule with a keyword contained in the (lowercased) user text wins.

use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use voxrelay_core::error::ReplyError;

use crate::{ReplyContext, ReplyGenerator};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeywordRule {
    pub id: String,
    #[serde(rename = "match", default)]
    pub matcher: RuleMatch,
    pub response: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuleMatch {
    #[serde(default)]
    pub any_keywords: Vec<String>,
}

impl KeywordRule {
    fn matches(&self, lowered: &str) -> bool {
        self.matcher
            .any_keywords
            .iter()
            .filter(|k| !k.is_empty())
            .any(|k| lowered.contains(&k.to_lowercase()))
    }
}

#[derive(Debug, Clone, Default)]
pub struct KeywordRules {
    rules: Vec<KeywordRule>,
}

impl KeywordRules {
    pub fn new(rules: Vec<KeywordRule>) -> Self {
        Self { rules }
    }

    pub fn parse(raw: &str) -> anyhow::Result<Self> {
        let rules: Vec<KeywordRule> = serde_json::from_str(raw)?;
        Ok(Self { rules })
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read rules {}: {e}", path.display()))?;
        Self::parse(&raw)
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Return the first matching rule.
    pub fn find(&self, text: &str) -> Option<&KeywordRule> {
        let lowered = text.to_lowercase();
        self.rules.iter().find(|r| r.matches(&lowered))
    }
}

#[async_trait]
impl ReplyGenerator for KeywordRules {
    fn id(&self) -> &str {
        "rules"
    }

    async fn reply(&self, ctx: &ReplyContext) -> Result<String, ReplyError> {
        match self.find(&ctx.text) {
            Some(rule) => {
                debug!(session_id = %ctx.session_id, rule = %rule.id, "Keyword rule matched");
                Ok(rule.response.clone())
            }
            None => Err(ReplyError::Unavailable("no keyword rule matched".into())),
        }
    }
}
