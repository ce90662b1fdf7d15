use super::reasoning::ReasoningFormat;
use crate::types::response::{completion_id, unix_now};
use crate::types::{ChatCompletionsStreamResponse, Message, Role, StreamChoice, Tool, Usage};

/// Builds OpenAI chunks that share one id, model and timestamp.
#[derive(Debug, Clone)]
pub struct ChunkBuilder {
    pub id: String,
    pub model: String,
    pub created: i64,
    format: ReasoningFormat,
}

impl ChunkBuilder {
    pub fn new(model: impl Into<String>, format: ReasoningFormat) -> Self {
        Self {
            id: completion_id(),
            model: model.into(),
            created: unix_now(),
            format,
        }
    }

    pub fn set_id(&mut self, id: impl Into<String>) {
        let id = id.into();
        if !id.is_empty() {
            self.id = id;
        }
    }

    pub fn set_model(&mut self, model: impl Into<String>) {
        let model = model.into();
        if !model.is_empty() {
            self.model = model;
        }
    }

    pub fn delta(&self, delta: Message, finish_reason: Option<String>) -> ChatCompletionsStreamResponse {
        let mut chunk = ChatCompletionsStreamResponse::new(&self.id, &self.model, self.created);
        chunk.choices.push(StreamChoice {
            index: 0,
            delta,
            finish_reason,
        });
        chunk
    }

    /// First chunk of a stream: role only.
    pub fn role(&self) -> ChatCompletionsStreamResponse {
        self.delta(
            Message {
                role: Role::Assistant,
                content: Some(crate::types::MessageContent::Text(String::new())),
                ..Default::default()
            },
            None,
        )
    }

    pub fn text(&self, text: impl Into<String>) -> ChatCompletionsStreamResponse {
        self.delta(Message::assistant(text), None)
    }

    pub fn reasoning(&self, text: impl Into<String>) -> ChatCompletionsStreamResponse {
        let mut delta = Message {
            role: Role::Assistant,
            ..Default::default()
        };
        self.format.apply(&mut delta, text.into());
        self.delta(delta, None)
    }

    pub fn tool_calls(&self, calls: Vec<Tool>) -> ChatCompletionsStreamResponse {
        self.delta(
            Message {
                role: Role::Assistant,
                tool_calls: Some(calls),
                ..Default::default()
            },
            None,
        )
    }

    pub fn finish(&self, reason: impl Into<String>) -> ChatCompletionsStreamResponse {
        self.delta(
            Message {
                role: Role::Assistant,
                ..Default::default()
            },
            Some(reason.into()),
        )
    }

    /// Trailing usage chunk with no choices, as `include_usage` streams end.
    pub fn usage(&self, usage: Usage) -> ChatCompletionsStreamResponse {
        let mut chunk = ChatCompletionsStreamResponse::new(&self.id, &self.model, self.created);
        chunk.usage = Some(usage);
        chunk
    }

    pub fn format(&self) -> ReasoningFormat {
        self.format
    }
}
