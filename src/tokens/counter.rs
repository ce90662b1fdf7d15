//! Token counter implementations.

use crate::types::{ClaudeContent, ClaudeRequest, ContentPart, GeneralRequest, Message};

/// Fixed cost of one image part; matches the low-detail OpenAI price.
const IMAGE_PART_TOKENS: usize = 85;
const AUDIO_PART_TOKENS: usize = 100;
/// Role and separator overhead per message.
const PER_MESSAGE_TOKENS: usize = 3;

pub trait TokenCounter: Send + Sync {
    fn count(&self, text: &str) -> usize;

    fn count_messages(&self, messages: &[Message]) -> usize {
        let mut total = 0;
        for message in messages {
            total += PER_MESSAGE_TOKENS;
            for part in message.parse_content() {
                total += match part {
                    ContentPart::Text { text } => self.count(&text),
                    ContentPart::Thinking { thinking, .. } => self.count(&thinking),
                    ContentPart::ImageUrl { .. } => IMAGE_PART_TOKENS,
                    ContentPart::InputAudio { .. } => AUDIO_PART_TOKENS,
                };
            }
            if let Some(r) = message.reasoning_text() {
                if !matches!(message.content, Some(crate::types::MessageContent::Parts(_))) {
                    total += self.count(&r);
                }
            }
            for call in message.tool_calls.iter().flatten() {
                total += self.count(&call.function.name) + self.count(call.arguments());
            }
        }
        total
    }

    fn count_claude_blocks(&self, blocks: &[ClaudeContent]) -> usize {
        blocks
            .iter()
            .map(|block| match block {
                ClaudeContent::Text { text, .. } => self.count(text),
                ClaudeContent::Thinking { thinking, .. } => self.count(thinking),
                ClaudeContent::Image { .. } => IMAGE_PART_TOKENS,
                ClaudeContent::ToolUse { name, input, .. } => {
                    self.count(name) + self.count(&input.to_string())
                }
                ClaudeContent::ToolResult { content, .. } => match content {
                    Some(crate::types::ClaudeMessageContent::Text(t)) => self.count(t),
                    Some(crate::types::ClaudeMessageContent::Blocks(b)) => {
                        self.count_claude_blocks(b)
                    }
                    None => 0,
                },
                ClaudeContent::RedactedThinking { .. } => 0,
            })
            .sum()
    }
}

/// Character-based approximation: 4 characters per token, rounded up.
#[derive(Debug, Clone)]
pub struct CharacterEstimator {
    chars_per_token: f64,
}

impl CharacterEstimator {
    pub fn new() -> Self {
        Self::with_ratio(4.0)
    }

    pub fn with_ratio(r: f64) -> Self {
        Self { chars_per_token: r }
    }
}

impl Default for CharacterEstimator {
    fn default() -> Self {
        Self::new()
    }
}

impl TokenCounter for CharacterEstimator {
    fn count(&self, text: &str) -> usize {
        (text.chars().count() as f64 / self.chars_per_token).ceil() as usize
    }
}

/// Estimated tokens of a completion text.
pub fn count_text_tokens(text: &str) -> u64 {
    CharacterEstimator::new().count(text) as u64
}

/// Prompt pre-count of an OpenAI-shaped request (messages, tools, embedding input).
pub fn count_request_tokens(request: &GeneralRequest) -> u64 {
    let counter = CharacterEstimator::new();
    let mut total = counter.count_messages(&request.messages);
    for tool in request.tools.iter().flatten() {
        total += counter.count(&tool.function.name);
        if let Some(d) = &tool.function.description {
            total += counter.count(d);
        }
        if let Some(p) = &tool.function.parameters {
            total += counter.count(&p.to_string());
        }
    }
    if let Some(input) = &request.input {
        total += input.to_vec().iter().map(|s| counter.count(s)).sum::<usize>();
    }
    if let Some(q) = &request.query {
        total += counter.count(q);
    }
    for doc in request.documents.iter().flatten() {
        total += counter.count(doc);
    }
    total as u64
}

/// Prompt pre-count of a Claude Messages request.
pub fn count_claude_request_tokens(request: &ClaudeRequest) -> u64 {
    let counter = CharacterEstimator::new();
    let mut total = request
        .system
        .as_ref()
        .map_or(0, |s| counter.count(&s.text()));
    for msg in &request.messages {
        total += PER_MESSAGE_TOKENS + counter.count_claude_blocks(&msg.blocks());
    }
    for tool in request.tools.iter().flatten() {
        total += counter.count(&tool.name) + counter.count(&tool.input_schema.to_string());
    }
    total as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_character_estimate_rounds_up() {
        let c = CharacterEstimator::new();
        assert_eq!(c.count(""), 0);
        assert_eq!(c.count("abc"), 1);
        assert_eq!(c.count("abcde"), 2);
        // counted in characters, not bytes
        assert_eq!(c.count("你好世界"), 1);
    }

    #[test]
    fn test_request_count_includes_overhead_and_tools() {
        let req: GeneralRequest = serde_json::from_str(
            r#"{"model":"m","messages":[{"role":"user","content":"abcdefgh"}],
                "tools":[{"type":"function","function":{"name":"w","parameters":{}}}]}"#,
        )
        .unwrap();
        // 3 overhead + 2 text + 1 name + 1 schema
        assert_eq!(count_request_tokens(&req), 7);
    }
}
