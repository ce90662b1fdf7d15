//! Chooses which field carries chain-of-thought text on the way to the caller.

use crate::types::Message;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasoningFormat {
    /// DeepSeek-style `reasoning_content`.
    ReasoningContent,
    /// OpenRouter-style `reasoning`.
    Reasoning,
    /// Anthropic-style `thinking`.
    Thinking,
    /// No preference; written as `reasoning_content`.
    #[default]
    Unspecified,
}

impl ReasoningFormat {
    /// Parses the `reasoning_format` query parameter.
    pub fn from_query(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "reasoning_content" => ReasoningFormat::ReasoningContent,
            "reasoning" => ReasoningFormat::Reasoning,
            "thinking" => ReasoningFormat::Thinking,
            _ => ReasoningFormat::Unspecified,
        }
    }

    pub fn field(&self) -> &'static str {
        match self {
            ReasoningFormat::Reasoning => "reasoning",
            ReasoningFormat::Thinking => "thinking",
            ReasoningFormat::ReasoningContent | ReasoningFormat::Unspecified => "reasoning_content",
        }
    }

    /// Puts `text` into exactly one reasoning field of `msg`.
    pub fn apply(&self, msg: &mut Message, text: String) {
        msg.clear_reasoning();
        match self {
            ReasoningFormat::Reasoning => msg.reasoning = Some(text),
            ReasoningFormat::Thinking => msg.thinking = Some(text),
            ReasoningFormat::ReasoningContent | ReasoningFormat::Unspecified => {
                msg.reasoning_content = Some(text)
            }
        }
    }

    /// Moves reasoning found in any field into the selected one.
    ///
    /// Returns `true` when the message changed.
    pub fn normalize(&self, msg: &mut Message) -> bool {
        let current = [
            msg.reasoning_content.is_some(),
            msg.reasoning.is_some(),
            msg.thinking.is_some(),
        ]
        .iter()
        .filter(|present| **present)
        .count();
        let text = msg
            .reasoning_content
            .clone()
            .or_else(|| msg.reasoning.clone())
            .or_else(|| msg.thinking.clone());
        let Some(text) = text else {
            return false;
        };
        let already = match self {
            ReasoningFormat::Reasoning => msg.reasoning.is_some(),
            ReasoningFormat::Thinking => msg.thinking.is_some(),
            _ => msg.reasoning_content.is_some(),
        };
        if already && current == 1 {
            return false;
        }
        self.apply(msg, text);
        true
    }
}
