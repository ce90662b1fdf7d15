//! Re-elevates OpenAI chunks into Anthropic Messages SSE events for callers
//! that spoke Claude Messages to a non-Claude backend.

use crate::convert::openai_finish_to_claude;
use crate::types::{ChatCompletionsStreamResponse, Usage};
use serde_json::{json, Value};

/// One outgoing Claude SSE event: `(event name, payload)`.
pub type ClaudeEvent = (&'static str, Value);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Block {
    Text,
    Thinking,
    /// OpenAI tool-call index the block belongs to.
    Tool(usize),
}

#[derive(Debug, Default)]
pub struct ClaudeStreamEmitter {
    started: bool,
    finished: bool,
    message_id: String,
    model: String,
    next_index: usize,
    open: Option<Block>,
    stop_reason: Option<String>,
    usage: Option<Usage>,
    input_tokens_hint: u64,
}

impl ClaudeStreamEmitter {
    pub fn new(model: impl Into<String>, input_tokens_hint: u64) -> Self {
        Self {
            model: model.into(),
            input_tokens_hint,
            ..Default::default()
        }
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    fn ensure_started(&mut self, events: &mut Vec<ClaudeEvent>, chunk: &ChatCompletionsStreamResponse) {
        if self.started {
            return;
        }
        self.started = true;
        self.message_id = if chunk.id.is_empty() {
            format!("msg_{}", uuid::Uuid::new_v4().simple())
        } else {
            chunk.id.clone()
        };
        if !chunk.model.is_empty() {
            self.model = chunk.model.clone();
        }
        events.push((
            "message_start",
            json!({
                "type": "message_start",
                "message": {
                    "id": self.message_id,
                    "type": "message",
                    "role": "assistant",
                    "model": self.model,
                    "content": [],
                    "stop_reason": null,
                    "stop_sequence": null,
                    "usage": {"input_tokens": self.input_tokens_hint, "output_tokens": 0}
                }
            }),
        ));
    }

    fn close_block(&mut self, events: &mut Vec<ClaudeEvent>) {
        if self.open.take().is_some() {
            events.push((
                "content_block_stop",
                json!({"type": "content_block_stop", "index": self.next_index}),
            ));
            self.next_index += 1;
        }
    }

    fn open_block(&mut self, events: &mut Vec<ClaudeEvent>, block: Block, content_block: Value) {
        if self.open == Some(block) {
            return;
        }
        self.close_block(events);
        events.push((
            "content_block_start",
            json!({
                "type": "content_block_start",
                "index": self.next_index,
                "content_block": content_block
            }),
        ));
        self.open = Some(block);
    }

    fn block_delta(&self, events: &mut Vec<ClaudeEvent>, delta: Value) {
        events.push((
            "content_block_delta",
            json!({"type": "content_block_delta", "index": self.next_index, "delta": delta}),
        ));
    }

    pub fn on_chunk(&mut self, chunk: &ChatCompletionsStreamResponse) -> Vec<ClaudeEvent> {
        let mut events = Vec::new();
        if self.finished {
            return events;
        }
        if let Some(usage) = &chunk.usage {
            self.usage = Some(usage.clone());
        }
        let Some(choice) = chunk.choices.first() else {
            return events;
        };
        self.ensure_started(&mut events, chunk);
        let delta = &choice.delta;

        if let Some(reasoning) = delta.reasoning_text() {
            self.open_block(&mut events, Block::Thinking, json!({"type": "thinking", "thinking": ""}));
            self.block_delta(&mut events, json!({"type": "thinking_delta", "thinking": reasoning}));
        }

        let text = delta.string_content();
        if !text.is_empty() {
            self.open_block(&mut events, Block::Text, json!({"type": "text", "text": ""}));
            self.block_delta(&mut events, json!({"type": "text_delta", "text": text}));
        }

        for call in delta.tool_calls.iter().flatten() {
            let index = match (call.index, self.open) {
                (Some(i), _) => i,
                (None, Some(Block::Tool(i))) => i,
                (None, _) => 0,
            };
            if self.open != Some(Block::Tool(index)) {
                let id = call
                    .id
                    .clone()
                    .unwrap_or_else(|| format!("toolu_{}", uuid::Uuid::new_v4().simple()));
                self.open_block(
                    &mut events,
                    Block::Tool(index),
                    json!({"type": "tool_use", "id": id, "name": call.function.name, "input": {}}),
                );
            }
            let args = call.arguments();
            if !args.is_empty() {
                self.block_delta(&mut events, json!({"type": "input_json_delta", "partial_json": args}));
            }
        }

        if let Some(reason) = &choice.finish_reason {
            self.stop_reason = Some(openai_finish_to_claude(reason).to_string());
            self.close_block(&mut events);
        }
        events
    }

    /// Usage to report in the closing `message_delta`, overriding any
    /// usage chunk seen so far.
    pub fn set_usage(&mut self, usage: Usage) {
        self.usage = Some(usage);
    }

    /// Closes the message. Safe to call more than once.
    pub fn finish(&mut self) -> Vec<ClaudeEvent> {
        let mut events = Vec::new();
        if self.finished {
            return events;
        }
        if !self.started {
            self.ensure_started(&mut events, &ChatCompletionsStreamResponse::default());
        }
        self.close_block(&mut events);
        self.finished = true;
        let usage = self.usage.clone().unwrap_or_default();
        let input_tokens = if usage.prompt_tokens > 0 {
            usage.prompt_tokens
        } else {
            self.input_tokens_hint
        };
        events.push((
            "message_delta",
            json!({
                "type": "message_delta",
                "delta": {
                    "stop_reason": self.stop_reason.clone().unwrap_or_else(|| "end_turn".to_string()),
                    "stop_sequence": null
                },
                "usage": {"input_tokens": input_tokens, "output_tokens": usage.completion_tokens}
            }),
        ));
        events.push(("message_stop", json!({"type": "message_stop"})));
        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Message, StreamChoice, Tool};

    fn chunk(delta: Message, finish: Option<&str>) -> ChatCompletionsStreamResponse {
        ChatCompletionsStreamResponse {
            id: "chatcmpl-1".into(),
            model: "gpt-4o".into(),
            choices: vec![StreamChoice {
                index: 0,
                delta,
                finish_reason: finish.map(String::from),
            }],
            ..Default::default()
        }
    }

    fn names(events: &[ClaudeEvent]) -> Vec<&'static str> {
        events.iter().map(|(n, _)| *n).collect()
    }

    #[test]
    fn test_text_then_tool_then_finish() {
        let mut em = ClaudeStreamEmitter::new("gpt-4o", 5);
        let e1 = em.on_chunk(&chunk(Message::assistant("Hi"), None));
        assert_eq!(names(&e1), vec!["message_start", "content_block_start", "content_block_delta"]);

        let mut call = Tool::call("call_1", "w", "{\"a\":");
        call.index = Some(0);
        let mut d = Message::default();
        d.tool_calls = Some(vec![call]);
        let e2 = em.on_chunk(&chunk(d, None));
        assert_eq!(
            names(&e2),
            vec!["content_block_stop", "content_block_start", "content_block_delta"]
        );
        assert_eq!(e2[1].1["index"], 1);
        assert_eq!(e2[1].1["content_block"]["type"], "tool_use");

        let e3 = em.on_chunk(&chunk(Message::default(), Some("tool_calls")));
        assert_eq!(names(&e3), vec!["content_block_stop"]);

        let e4 = em.finish();
        assert_eq!(names(&e4), vec!["message_delta", "message_stop"]);
        assert_eq!(e4[0].1["delta"]["stop_reason"], "tool_use");
        assert!(em.finish().is_empty());
    }

    #[test]
    fn test_reasoning_becomes_thinking_block() {
        let mut em = ClaudeStreamEmitter::new("m", 0);
        let mut d = Message::default();
        d.reasoning_content = Some("hmm".into());
        let e = em.on_chunk(&chunk(d, None));
        assert_eq!(e[1].1["content_block"]["type"], "thinking");
        assert_eq!(e[2].1["delta"]["thinking"], "hmm");
    }

    #[test]
    fn test_set_usage_overrides_reported_usage() {
        let mut em = ClaudeStreamEmitter::new("deepseek-chat", 0);
        em.on_chunk(&chunk(Message::assistant("Hello"), Some("stop")));
        em.set_usage(Usage::new(9, 11));
        let events = em.finish();
        assert_eq!(events[0].0, "message_delta");
        assert_eq!(events[0].1["usage"]["input_tokens"], 9);
        assert_eq!(events[0].1["usage"]["output_tokens"], 11);
    }
}
