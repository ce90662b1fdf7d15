//! OpenAI-shaped response objects emitted to the caller.

use super::message::Message;
use super::usage::Usage;
use serde::{Deserialize, Serialize};

/// Unix seconds, used for the `created` field.
pub fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}

/// `chatcmpl-<uuid>` style identifier.
pub fn completion_id() -> String {
    format!("chatcmpl-{}", uuid::Uuid::new_v4().simple())
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TextResponse {
    #[serde(default)]
    pub id: String,
    #[serde(default = "chat_completion_object")]
    pub object: String,
    #[serde(default)]
    pub created: i64,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub choices: Vec<TextResponseChoice>,
    #[serde(default)]
    pub usage: Usage,
}

fn chat_completion_object() -> String {
    "chat.completion".to_string()
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TextResponseChoice {
    #[serde(default)]
    pub index: u32,
    #[serde(default)]
    pub message: Message,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

impl TextResponse {
    pub fn new(model: impl Into<String>, message: Message, finish_reason: Option<String>, usage: Usage) -> Self {
        Self {
            id: completion_id(),
            object: chat_completion_object(),
            created: unix_now(),
            model: model.into(),
            choices: vec![TextResponseChoice {
                index: 0,
                message,
                finish_reason,
            }],
            usage,
        }
    }

    /// Text and reasoning of every choice, for fallback token counting.
    pub fn assembled_text(&self) -> String {
        let mut out = String::new();
        for choice in &self.choices {
            if let Some(r) = choice.message.reasoning_text() {
                out.push_str(&r);
            }
            out.push_str(&choice.message.string_content());
            for tool in choice.message.tool_calls.iter().flatten() {
                out.push_str(&tool.function.name);
                out.push_str(tool.arguments());
            }
        }
        out
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChatCompletionsStreamResponse {
    #[serde(default)]
    pub id: String,
    #[serde(default = "chunk_object")]
    pub object: String,
    #[serde(default)]
    pub created: i64,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub choices: Vec<StreamChoice>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

fn chunk_object() -> String {
    "chat.completion.chunk".to_string()
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamChoice {
    #[serde(default)]
    pub index: u32,
    #[serde(default)]
    pub delta: Message,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

impl ChatCompletionsStreamResponse {
    pub fn new(id: impl Into<String>, model: impl Into<String>, created: i64) -> Self {
        Self {
            id: id.into(),
            object: chunk_object(),
            created,
            model: model.into(),
            choices: Vec::new(),
            usage: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingResponse {
    #[serde(default = "list_object")]
    pub object: String,
    pub data: Vec<EmbeddingData>,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub usage: Usage,
}

fn list_object() -> String {
    "list".to_string()
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingData {
    #[serde(default = "embedding_object")]
    pub object: String,
    pub index: usize,
    pub embedding: Vec<f64>,
}

fn embedding_object() -> String {
    "embedding".to_string()
}

impl EmbeddingResponse {
    pub fn new(model: impl Into<String>, vectors: Vec<Vec<f64>>, usage: Usage) -> Self {
        Self {
            object: list_object(),
            data: vectors
                .into_iter()
                .enumerate()
                .map(|(index, embedding)| EmbeddingData {
                    object: embedding_object(),
                    index,
                    embedding,
                })
                .collect(),
            model: model.into(),
            usage,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImageResponse {
    pub created: i64,
    pub data: Vec<ImageData>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImageData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub b64_json: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revised_prompt: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VideoResponse {
    pub id: String,
    pub model: String,
    pub created: i64,
    pub status: String,
    pub data: Vec<VideoData>,
    pub usage: Usage,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VideoData {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RerankResponse {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub model: String,
    pub results: Vec<RerankResult>,
    #[serde(default)]
    pub usage: Usage,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RerankResult {
    pub index: usize,
    pub relevance_score: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_roundtrips_unknown_object() {
        let c: ChatCompletionsStreamResponse = serde_json::from_str(
            r#"{"id":"x","choices":[{"index":0,"delta":{"content":"hi"},"finish_reason":null}]}"#,
        )
        .unwrap();
        assert_eq!(c.object, "chat.completion.chunk");
        assert_eq!(c.choices[0].delta.string_content(), "hi");
    }

    #[test]
    fn test_assembled_text_includes_reasoning_and_tools() {
        let mut msg = Message::assistant("b");
        msg.reasoning_content = Some("a".into());
        msg.tool_calls = Some(vec![crate::types::Tool::call("c", "f", "{}")]);
        let r = TextResponse::new("m", msg, Some("stop".into()), Usage::default());
        assert_eq!(r.assembled_text(), "abf{}");
    }
}
