//! Pronunciation rules applied to reply text right before synthesis.
//!
//! The client still receives the original reply text; only the TTS input is
//! rewritten (units spelled out, readings for words the voice gets wrong).

use regex::Regex;

use voxrelay_core::config::PronunciationRule;

#[derive(Debug, Clone, Default)]
pub struct Pronunciation {
    rules: Vec<(Regex, String)>,
}

impl Pronunciation {
    pub fn from_rules(rules: &[PronunciationRule]) -> Result<Self, regex::Error> {
        let rules = rules
            .iter()
            .map(|r| Ok((Regex::new(&r.pattern)?, r.replacement.clone())))
            .collect::<Result<Vec<_>, regex::Error>>()?;
        Ok(Self { rules })
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Apply every rule in order.
    pub fn apply(&self, text: &str) -> String {
        self.rules
            .iter()
            .fold(text.to_string(), |acc, (pattern, replacement)| {
                pattern.replace_all(&acc, replacement.as_str()).into_owned()
            })
    }
}
