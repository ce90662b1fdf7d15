//! Anthropic SSE to OpenAI chunks, or native pass-through for Claude callers.

use super::response::claude_usage_to_openai;
use crate::adaptor::common::check_status;
use crate::cache::SignatureKey;
use crate::context::RelayContext;
use crate::convert::claude_stop_to_openai;
use crate::meta::{Meta, Mode};
use crate::stream::reasoning::ReasoningFormat;
use crate::stream::{
    fallback_usage, sse_data, sse_event, ChunkBuilder, ClientDialect, LineReader, ReadOutcome, ResponseWriter,
    ToolCallAssembler,
};
use crate::transport::UpstreamResponse;
use crate::types::{
    ChatCompletionsStreamResponse, ClaudeContent, ClaudeStreamEvent, Function, Tool, Usage,
};
use crate::{Error, Result};

/// What one Anthropic event turned into.
#[derive(Debug, Default)]
pub struct Translated {
    pub chunks: Vec<ChatCompletionsStreamResponse>,
    /// `(thinking ordinal, signature)` of a thinking block that just closed.
    pub signature: Option<(usize, String)>,
    pub error: Option<Error>,
}

/// Stateful Anthropic event translator.
///
/// Tool calls are indexed in the order their `tool_use` blocks open;
/// `input_json_delta` always extends the most recent one. Thinking
/// signatures are collected per block and handed back, never emitted.
#[derive(Debug)]
pub struct ClaudeStreamTranslator {
    builder: ChunkBuilder,
    tools: ToolCallAssembler,
    usage: Usage,
    produced: String,
    finish_reason: Option<String>,
    in_thinking: bool,
    thinking_ordinal: usize,
    signature: String,
}

impl ClaudeStreamTranslator {
    pub fn new(model: impl Into<String>, format: ReasoningFormat) -> Self {
        Self {
            builder: ChunkBuilder::new(model, format),
            tools: ToolCallAssembler::new(),
            usage: Usage::default(),
            produced: String::new(),
            finish_reason: None,
            in_thinking: false,
            thinking_ordinal: 0,
            signature: String::new(),
        }
    }

    fn tool_delta(index: usize, id: Option<String>, name: String, arguments: String) -> Tool {
        Tool {
            id,
            tool_type: "function".to_string(),
            function: Function {
                name,
                arguments: Some(arguments),
                ..Default::default()
            },
            index: Some(index),
        }
    }

    pub fn on_event(&mut self, event: &ClaudeStreamEvent) -> Translated {
        let mut out = Translated::default();
        match event.kind.as_str() {
            "message_start" => {
                if let Some(msg) = &event.message {
                    self.builder.set_id(msg.id.clone());
                    self.builder.set_model(msg.model.clone());
                    let started = claude_usage_to_openai(&msg.usage);
                    self.usage.prompt_tokens = started.prompt_tokens;
                    self.usage.prompt_tokens_details = started.prompt_tokens_details;
                    self.usage.completion_tokens = started.completion_tokens;
                }
                out.chunks.push(self.builder.role());
            }
            "content_block_start" => match &event.content_block {
                Some(ClaudeContent::ToolUse { id, name, .. }) => {
                    let index = self.tools.start(id.clone(), name.clone());
                    self.produced.push_str(name);
                    let call = Self::tool_delta(index, Some(id.clone()), name.clone(), String::new());
                    out.chunks.push(self.builder.tool_calls(vec![call]));
                }
                Some(ClaudeContent::Thinking { thinking, signature }) => {
                    self.in_thinking = true;
                    self.signature = signature.clone().unwrap_or_default();
                    if !thinking.is_empty() {
                        self.produced.push_str(thinking);
                        out.chunks.push(self.builder.reasoning(thinking.clone()));
                    }
                }
                Some(ClaudeContent::Text { text, .. }) if !text.is_empty() => {
                    self.produced.push_str(text);
                    out.chunks.push(self.builder.text(text.clone()));
                }
                _ => {}
            },
            "content_block_delta" => {
                let Some(delta) = &event.delta else {
                    return out;
                };
                match delta.kind.as_deref() {
                    Some("text_delta") | None if delta.text.is_some() => {
                        let text = delta.text.clone().unwrap_or_default();
                        self.produced.push_str(&text);
                        out.chunks.push(self.builder.text(text));
                    }
                    Some("input_json_delta") => {
                        let fragment = delta.partial_json.clone().unwrap_or_default();
                        self.produced.push_str(&fragment);
                        if let Some(index) = self.tools.append_to_last(&fragment) {
                            let call = Self::tool_delta(index, None, String::new(), fragment);
                            out.chunks.push(self.builder.tool_calls(vec![call]));
                        }
                    }
                    Some("thinking_delta") => {
                        let text = delta.thinking.clone().unwrap_or_default();
                        if !text.is_empty() {
                            self.produced.push_str(&text);
                            out.chunks.push(self.builder.reasoning(text));
                        }
                    }
                    Some("signature_delta") => {
                        if let Some(sig) = &delta.signature {
                            self.signature.push_str(sig);
                        }
                    }
                    _ => {}
                }
            }
            "content_block_stop" => {
                if self.in_thinking {
                    let signature = std::mem::take(&mut self.signature);
                    if !signature.is_empty() {
                        out.signature = Some((self.thinking_ordinal, signature));
                    }
                    self.thinking_ordinal += 1;
                    self.in_thinking = false;
                }
            }
            "message_delta" => {
                if let Some(reason) = event.delta.as_ref().and_then(|d| d.stop_reason.as_deref()) {
                    self.finish_reason = Some(claude_stop_to_openai(reason).to_string());
                }
                if let Some(u) = &event.usage {
                    self.usage.completion_tokens = u.output_tokens;
                    if u.input_tokens > 0 {
                        self.usage.prompt_tokens = claude_usage_to_openai(u).prompt_tokens;
                    }
                }
            }
            "error" => {
                let message = event
                    .error
                    .as_ref()
                    .map(|e| format!("{}: {}", e.kind, e.message))
                    .unwrap_or_else(|| "stream error".to_string());
                let status = match event.error.as_ref().map(|e| e.kind.as_str()) {
                    Some("overloaded_error") => 529,
                    Some("rate_limit_error") => 429,
                    Some("invalid_request_error") => 400,
                    _ => 500,
                };
                out.error = Some(Error::Upstream {
                    status,
                    message,
                    provider_code: event.error.as_ref().map(|e| e.kind.clone()),
                });
            }
            _ => {}
        }
        out
    }

    /// Closing chunks: `{}` for a last tool call that never got arguments,
    /// the finish reason, then the aggregated usage.
    pub fn finish(&mut self, prompt_tokens_hint: u64) -> Vec<ChatCompletionsStreamResponse> {
        let mut chunks = Vec::new();
        if let Some(index) = self.tools.fill_empty_last_arguments() {
            let call = Self::tool_delta(index, None, String::new(), "{}".to_string());
            chunks.push(self.builder.tool_calls(vec![call]));
        }
        let reason = self.finish_reason.clone().unwrap_or_else(|| "stop".to_string());
        chunks.push(self.builder.finish(reason));
        chunks.push(self.builder.usage(self.usage(prompt_tokens_hint)));
        chunks
    }

    /// Reported usage, or the estimate over everything produced.
    pub fn usage(&self, prompt_tokens_hint: u64) -> Usage {
        if self.usage.is_empty() {
            return fallback_usage(prompt_tokens_hint, &self.produced);
        }
        let mut u = self.usage.clone();
        if u.prompt_tokens == 0 {
            u.prompt_tokens = prompt_tokens_hint;
        }
        u.finalize()
    }

    pub fn tool_calls(&self) -> &[Tool] {
        self.tools.calls()
    }
}

/// Whether the caller spoke Claude and gets Anthropic events unchanged.
pub fn is_native(ctx: &RelayContext, meta: &Meta, out: &ResponseWriter<'_>) -> bool {
    meta.mode == Mode::ClaudeMessages && !ctx.claude_messages_conversion && out.dialect() == ClientDialect::Claude
}

/// Drives one Anthropic event stream into the caller's writer.
///
/// Shared by the Anthropic SSE reader and the Bedrock eventstream reader.
pub struct ClaudeStreamRelay {
    translator: ClaudeStreamTranslator,
    native: bool,
    prompt_tokens_hint: u64,
    stopped: bool,
}

impl ClaudeStreamRelay {
    pub fn new(ctx: &RelayContext, meta: &Meta, out: &ResponseWriter<'_>) -> Self {
        Self {
            translator: ClaudeStreamTranslator::new(meta.actual_model_name.clone(), ctx.reasoning_format),
            native: is_native(ctx, meta, out),
            prompt_tokens_hint: meta.prompt_tokens,
            stopped: false,
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    /// Handles one event payload. `event_name` is the SSE `event:` line, if any.
    pub async fn on_data(
        &mut self,
        ctx: &RelayContext,
        out: &mut ResponseWriter<'_>,
        event_name: Option<&str>,
        data: &str,
    ) -> Result<()> {
        let event: ClaudeStreamEvent = match serde_json::from_str(data) {
            Ok(e) => e,
            Err(e) => {
                tracing::debug!(error = %e, line = %data, "skipping undecodable anthropic event");
                return Ok(());
            }
        };
        let translated = self.translator.on_event(&event);

        if let Some((ordinal, signature)) = translated.signature {
            if let Some(anchor) = ctx.thinking_anchor() {
                let key = SignatureKey::new(
                    ctx.token_key(),
                    anchor.conversation_id.as_str(),
                    anchor.message_index,
                    ordinal,
                );
                ctx.signatures().store(&key, &signature).await;
            }
        }

        if self.native {
            let name = event_name.unwrap_or(event.kind.as_str());
            out.send_claude_raw(name, data).await?;
            if translated.error.is_some() || event.kind == "message_stop" {
                out.close();
                self.stopped = translated.error.is_some();
            }
            return Ok(());
        }

        if let Some(err) = translated.error {
            tracing::warn!(error = %err, "anthropic stream reported an error");
            out.send_error(&err).await?;
            self.stopped = true;
            return Ok(());
        }
        for chunk in &translated.chunks {
            out.send_chunk(chunk).await?;
        }
        Ok(())
    }

    /// Reports a transport failure mid-stream.
    pub async fn fail(&mut self, out: &mut ResponseWriter<'_>, err: &Error) -> Result<()> {
        tracing::warn!(error = %err, "anthropic stream read failed");
        self.stopped = true;
        out.send_error(err).await
    }

    /// Writes the closing events unless the stream already stopped, and returns usage.
    pub async fn finish(mut self, out: &mut ResponseWriter<'_>) -> Result<Usage> {
        if !self.stopped {
            if self.native {
                out.close();
            } else {
                for chunk in self.translator.finish(self.prompt_tokens_hint) {
                    out.send_chunk(&chunk).await?;
                }
                out.send_done().await?;
            }
        }
        Ok(self.translator.usage(self.prompt_tokens_hint))
    }

    /// Usage so far, for streams that end early.
    pub fn usage(&self) -> Usage {
        self.translator.usage(self.prompt_tokens_hint)
    }
}

pub async fn stream_handler(
    ctx: &mut RelayContext,
    resp: UpstreamResponse,
    meta: &Meta,
    out: &mut ResponseWriter<'_>,
) -> Result<Usage> {
    let resp = check_status(ctx.cancellation(), resp).await?;
    out.begin_stream();
    let mut relay = ClaudeStreamRelay::new(ctx, meta, out);
    let mut reader = LineReader::from_response(resp);
    let mut event_name: Option<String> = None;

    loop {
        match reader.next_line(ctx.cancellation()).await {
            Ok(ReadOutcome::Line(line)) => {
                if let Some(name) = sse_event(&line) {
                    event_name = Some(name.to_string());
                    continue;
                }
                let Some(data) = sse_data(&line) else {
                    continue;
                };
                relay.on_data(ctx, out, event_name.take().as_deref(), data).await?;
                if relay.is_stopped() {
                    return Ok(relay.usage());
                }
            }
            Ok(ReadOutcome::Eof) => break,
            Ok(ReadOutcome::Cancelled) => {
                tracing::debug!(model = %meta.actual_model_name, "caller went away, stopping stream");
                return Ok(relay.usage());
            }
            Err(e) => {
                relay.fail(out, &e).await?;
                return Ok(relay.usage());
            }
        }
    }
    relay.finish(out).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event(v: serde_json::Value) -> ClaudeStreamEvent {
        serde_json::from_value(v).unwrap()
    }

    #[test]
    fn test_tool_arguments_extend_last_call() {
        let mut t = ClaudeStreamTranslator::new("claude", ReasoningFormat::Unspecified);
        t.on_event(&event(json!({"type":"content_block_start","index":0,
            "content_block":{"type":"tool_use","id":"t1","name":"w","input":{}}})));
        for frag in ["{\"loc\"", ":\"SF\"", "}"] {
            let out = t.on_event(&event(json!({"type":"content_block_delta","index":0,
                "delta":{"type":"input_json_delta","partial_json":frag}})));
            assert_eq!(out.chunks[0].choices[0].delta.tool_calls.as_ref().unwrap()[0].index, Some(0));
        }
        t.on_event(&event(json!({"type":"content_block_stop","index":0})));
        assert_eq!(t.tool_calls().len(), 1);
        assert_eq!(t.tool_calls()[0].arguments(), r#"{"loc":"SF"}"#);
    }

    #[test]
    fn test_empty_tool_arguments_become_object() {
        let mut t = ClaudeStreamTranslator::new("claude", ReasoningFormat::Unspecified);
        t.on_event(&event(json!({"type":"content_block_start","index":0,
            "content_block":{"type":"tool_use","id":"t1","name":"now","input":{}}})));
        t.on_event(&event(json!({"type":"message_delta","delta":{"stop_reason":"tool_use"},
            "usage":{"output_tokens":4}})));
        let chunks = t.finish(3);
        assert_eq!(chunks[0].choices[0].delta.tool_calls.as_ref().unwrap()[0].arguments(), "{}");
        assert_eq!(chunks[1].choices[0].finish_reason.as_deref(), Some("tool_calls"));
        let usage = chunks[2].usage.clone().unwrap();
        assert_eq!((usage.prompt_tokens, usage.completion_tokens, usage.total_tokens), (3, 4, 7));
    }

    #[test]
    fn test_signature_is_collected_not_emitted() {
        let mut t = ClaudeStreamTranslator::new("claude", ReasoningFormat::Reasoning);
        t.on_event(&event(json!({"type":"content_block_start","index":0,
            "content_block":{"type":"thinking","thinking":""}})));
        let out = t.on_event(&event(json!({"type":"content_block_delta","index":0,
            "delta":{"type":"thinking_delta","thinking":"let me see"}})));
        let v = serde_json::to_value(&out.chunks[0]).unwrap();
        assert_eq!(v["choices"][0]["delta"]["reasoning"], "let me see");
        let out = t.on_event(&event(json!({"type":"content_block_delta","index":0,
            "delta":{"type":"signature_delta","signature":"sig_1"}})));
        assert!(out.chunks.is_empty());
        let out = t.on_event(&event(json!({"type":"content_block_stop","index":0})));
        assert_eq!(out.signature, Some((0, "sig_1".to_string())));
    }

    #[test]
    fn test_stop_reasons() {
        for (claude, openai) in [
            ("end_turn", "stop"),
            ("stop_sequence", "stop"),
            ("max_tokens", "length"),
            ("tool_use", "tool_calls"),
        ] {
            let mut t = ClaudeStreamTranslator::new("claude", ReasoningFormat::Unspecified);
            t.on_event(&event(json!({"type":"message_delta","delta":{"stop_reason":claude}})));
            let chunks = t.finish(0);
            assert_eq!(chunks[0].choices[0].finish_reason.as_deref(), Some(openai));
        }
    }

    #[test]
    fn test_error_event() {
        let mut t = ClaudeStreamTranslator::new("claude", ReasoningFormat::Unspecified);
        let out = t.on_event(&event(json!({"type":"error",
            "error":{"type":"overloaded_error","message":"Overloaded"}})));
        assert_eq!(out.error.unwrap().status(), 529);
    }
}
