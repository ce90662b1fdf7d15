//! Chat messages whose `content` is either a plain string or a list of parts.

use super::tool::Tool;
use serde::{Deserialize, Serialize};

/// Message role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    #[default]
    User,
    Assistant,
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        }
    }
}

/// Message content: a bare string or an ordered list of parts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text {
        text: String,
    },
    ImageUrl {
        image_url: ImageUrl,
    },
    InputAudio {
        input_audio: InputAudio,
    },
    Thinking {
        thinking: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        signature: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageUrl {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputAudio {
    /// Base64 payload.
    pub data: String,
    pub format: String,
}

/// Chat message in the OpenAI dialect, also used for streamed deltas.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(default)]
    pub role: Role,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<MessageContent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<Tool>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking: Option<String>,
}

impl Message {
    pub fn new(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            content: Some(MessageContent::Text(text.into())),
            ..Default::default()
        }
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self::new(Role::System, text)
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::new(Role::User, text)
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::new(Role::Assistant, text)
    }

    pub fn tool_result(tool_call_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: Some(MessageContent::Text(text.into())),
            tool_call_id: Some(tool_call_id.into()),
            ..Default::default()
        }
    }

    /// Concatenated text of the message; non-text parts are skipped.
    pub fn string_content(&self) -> String {
        match &self.content {
            None => String::new(),
            Some(MessageContent::Text(s)) => s.clone(),
            Some(MessageContent::Parts(parts)) => parts
                .iter()
                .filter_map(|p| match p {
                    ContentPart::Text { text } => Some(text.as_str()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join(""),
        }
    }

    /// Content normalized into a list of parts. A bare string becomes one text part.
    pub fn parse_content(&self) -> Vec<ContentPart> {
        match &self.content {
            None => Vec::new(),
            Some(MessageContent::Text(s)) if s.is_empty() => Vec::new(),
            Some(MessageContent::Text(s)) => vec![ContentPart::Text { text: s.clone() }],
            Some(MessageContent::Parts(parts)) => parts.clone(),
        }
    }

    /// Reasoning text carried by this message, whichever surface it arrived on.
    pub fn reasoning_text(&self) -> Option<String> {
        for field in [&self.reasoning_content, &self.reasoning, &self.thinking] {
            if let Some(text) = field.as_deref().filter(|t| !t.is_empty()) {
                return Some(text.to_string());
            }
        }
        if let Some(MessageContent::Parts(parts)) = &self.content {
            let joined: String = parts
                .iter()
                .filter_map(|p| match p {
                    ContentPart::Thinking { thinking, .. } => Some(thinking.as_str()),
                    _ => None,
                })
                .collect();
            if !joined.is_empty() {
                return Some(joined);
            }
        }
        None
    }

    /// Signature echoed back by the client on a thinking part, if any.
    pub fn thinking_signature(&self) -> Option<String> {
        match &self.content {
            Some(MessageContent::Parts(parts)) => parts.iter().find_map(|p| match p {
                ContentPart::Thinking { signature, .. } => {
                    signature.clone().filter(|s| !s.is_empty())
                }
                _ => None,
            }),
            _ => None,
        }
    }

    pub fn has_tool_calls(&self) -> bool {
        self.tool_calls.as_ref().map_or(false, |t| !t.is_empty())
    }

    pub fn clear_reasoning(&mut self) {
        self.reasoning_content = None;
        self.reasoning = None;
        self.thinking = None;
    }
}

/// Splits `data:<mime>;base64,<payload>` into `(mime, payload)`.
///
/// Returns `None` for anything that is not a base64 data URL.
pub fn parse_data_url(url: &str) -> Option<(String, String)> {
    let rest = url.strip_prefix("data:")?;
    let (header, payload) = rest.split_once(',')?;
    let mime = header.strip_suffix(";base64")?;
    let mime = if mime.is_empty() { "application/octet-stream" } else { mime };
    Some((mime.to_string(), payload.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_accepts_both_shapes() {
        let a: Message = serde_json::from_str(r#"{"role":"user","content":"hi"}"#).unwrap();
        let b: Message = serde_json::from_str(
            r#"{"role":"user","content":[{"type":"text","text":"h"},{"type":"text","text":"i"},
                {"type":"image_url","image_url":{"url":"https://x/y.png"}}]}"#,
        )
        .unwrap();
        assert_eq!(a.string_content(), "hi");
        assert_eq!(b.string_content(), "hi");
        assert_eq!(b.parse_content().len(), 3);
    }

    #[test]
    fn test_parse_data_url() {
        let (mime, data) = parse_data_url("data:image/png;base64,iVBORw0K").unwrap();
        assert_eq!(mime, "image/png");
        assert_eq!(data, "iVBORw0K");
        assert!(parse_data_url("https://example.com/a.png").is_none());
        assert!(parse_data_url("data:text/plain,hello").is_none());
    }

    #[test]
    fn test_reasoning_text_prefers_fields_then_parts() {
        let mut m = Message::assistant("answer");
        assert!(m.reasoning_text().is_none());
        m.reasoning = Some("because".into());
        assert_eq!(m.reasoning_text().as_deref(), Some("because"));

        let parts: Message = serde_json::from_str(
            r#"{"role":"assistant","content":[{"type":"thinking","thinking":"hmm","signature":"s1"},
                {"type":"text","text":"ok"}]}"#,
        )
        .unwrap();
        assert_eq!(parts.reasoning_text().as_deref(), Some("hmm"));
        assert_eq!(parts.thinking_signature().as_deref(), Some("s1"));
    }
}
