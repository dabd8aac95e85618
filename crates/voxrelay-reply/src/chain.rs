//! Rules-then-model chain.
//!
//! Keyword rules answer first; when none matches, the fallback generator
//! is asked.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use voxrelay_core::error::ReplyError;

use crate::rules::KeywordRules;
use crate::{ReplyContext, ReplyGenerator};

pub struct ReplyChain {
    rules: KeywordRules,
    fallback: Arc<dyn ReplyGenerator>,
    label: String,
}

impl ReplyChain {
    pub fn new(rules: KeywordRules, fallback: Arc<dyn ReplyGenerator>) -> Self {
        let label = format!("rules+{}", fallback.id());
        Self {
            rules,
            fallback,
            label,
        }
    }
}

#[async_trait]
impl ReplyGenerator for ReplyChain {
    fn id(&self) -> &str {
        &self.label
    }

    async fn reply(&self, ctx: &ReplyContext) -> Result<String, ReplyError> {
        if let Some(rule) = self.rules.find(&ctx.text) {
            debug!(session_id = %ctx.session_id, rule = %rule.id, "Answered by keyword rule");
            return Ok(rule.response.clone());
        }
        self.fallback.reply(ctx).await
    }
}
