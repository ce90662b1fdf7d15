//! 协议互转模块：Claude Messages 与 OpenAI Chat Completions 之间的请求/响应转换。
//!
//! # Dialect Conversion
//!
//! The OpenAI Chat Completions shape is the hub. A Claude Messages request
//! bound for a non-Claude backend is lowered here first; the backend's reply
//! comes back as an OpenAI completion and is re-elevated on the way out.
//!
//! | Function | Direction |
//! |----------|-----------|
//! | [`claude_to_openai_request`] | Claude request to canonical request |
//! | [`openai_to_claude_response`] | OpenAI completion to Claude `message` |
//! | [`claude_stop_to_openai`] | `end_turn`/`max_tokens`/`tool_use` to `stop`/`length`/`tool_calls` |
//! | [`openai_finish_to_claude`] | The reverse mapping |
//!
//! Thinking blocks on earlier assistant turns are dropped when lowering: a
//! non-Claude backend cannot verify their signatures, and no `<think>` text
//! is ever synthesized on this path.

use crate::types::{
    ClaudeContent, ClaudeMessageContent, ClaudeRequest, ClaudeResponse, ClaudeToolChoice,
    ClaudeUsage, ContentPart, Function, GeneralRequest, ImageUrl, Message, MessageContent, Role,
    StopSequences, TextResponse, Tool, ToolChoice,
};
use serde_json::Value;

/// Anthropic stop reason to OpenAI finish reason.
pub fn claude_stop_to_openai(reason: &str) -> &str {
    match reason {
        "end_turn" | "stop_sequence" => "stop",
        "max_tokens" => "length",
        "tool_use" => "tool_calls",
        other => other,
    }
}

/// OpenAI finish reason to Anthropic stop reason.
pub fn openai_finish_to_claude(reason: &str) -> &str {
    match reason {
        "stop" => "end_turn",
        "length" => "max_tokens",
        "tool_calls" | "function_call" => "tool_use",
        "content_filter" => "end_turn",
        other => other,
    }
}

fn image_part(source: &crate::types::ImageSource) -> Option<ContentPart> {
    let url = match source.kind.as_str() {
        "base64" => format!(
            "data:{};base64,{}",
            source.media_type.as_deref().unwrap_or("image/png"),
            source.data.as_deref()?
        ),
        _ => source.url.clone()?,
    };
    Some(ContentPart::ImageUrl {
        image_url: ImageUrl { url, detail: None },
    })
}

fn tool_result_text(content: &Option<ClaudeMessageContent>) -> String {
    match content {
        None => String::new(),
        Some(ClaudeMessageContent::Text(s)) => s.clone(),
        Some(ClaudeMessageContent::Blocks(blocks)) => blocks
            .iter()
            .filter_map(|b| b.as_text())
            .collect::<Vec<_>>()
            .join("\n"),
    }
}

/// Collapses a single text part back into a plain string.
fn into_content(parts: Vec<ContentPart>) -> Option<MessageContent> {
    match parts.as_slice() {
        [] => None,
        [ContentPart::Text { text }] => Some(MessageContent::Text(text.clone())),
        _ => Some(MessageContent::Parts(parts)),
    }
}

fn lower_message(role: &str, blocks: Vec<ClaudeContent>, out: &mut Vec<Message>) {
    let role = match role {
        "assistant" => Role::Assistant,
        _ => Role::User,
    };
    let mut parts = Vec::new();
    let mut calls = Vec::new();

    for block in blocks {
        match block {
            ClaudeContent::Text { text, .. } => parts.push(ContentPart::Text { text }),
            ClaudeContent::Image { source } => parts.extend(image_part(&source)),
            ClaudeContent::ToolUse { id, name, input } => {
                let args = if input.is_null() {
                    "{}".to_string()
                } else {
                    input.to_string()
                };
                calls.push(Tool::call(id, name, args));
            }
            ClaudeContent::ToolResult {
                tool_use_id,
                content,
                ..
            } => out.push(Message::tool_result(tool_use_id, tool_result_text(&content))),
            ClaudeContent::Thinking { .. } | ClaudeContent::RedactedThinking { .. } => {}
        }
    }

    if parts.is_empty() && calls.is_empty() {
        return;
    }
    out.push(Message {
        role,
        content: into_content(parts),
        tool_calls: (!calls.is_empty()).then_some(calls),
        ..Default::default()
    });
}

fn lower_tool_choice(choice: &ClaudeToolChoice) -> (Option<ToolChoice>, Option<bool>) {
    let parallel = choice.disable_parallel_tool_use.map(|d| !d);
    let mapped = match choice.kind.as_str() {
        "auto" => ToolChoice::Mode("auto".to_string()),
        "any" => ToolChoice::Mode("required".to_string()),
        "none" => ToolChoice::Mode("none".to_string()),
        "tool" => match choice.name.as_deref() {
            Some(name) => ToolChoice::named(name),
            None => ToolChoice::Mode("required".to_string()),
        },
        _ => return (None, parallel),
    };
    (Some(mapped), parallel)
}

/// Lowers a Claude Messages request into the canonical OpenAI shape.
pub fn claude_to_openai_request(req: &ClaudeRequest) -> GeneralRequest {
    let mut messages = Vec::new();
    if let Some(system) = &req.system {
        let text = system.text();
        if !text.is_empty() {
            messages.push(Message::system(text));
        }
    }
    for msg in &req.messages {
        lower_message(&msg.role, msg.blocks(), &mut messages);
    }

    let tools = req.tools.as_ref().map(|tools| {
        tools
            .iter()
            .map(|t| Tool {
                id: None,
                tool_type: "function".to_string(),
                function: Function {
                    name: t.name.clone(),
                    description: t.description.clone(),
                    parameters: Some(t.input_schema.clone()),
                    arguments: None,
                },
                index: None,
            })
            .collect::<Vec<_>>()
    });
    let (tool_choice, parallel_tool_calls) = req
        .tool_choice
        .as_ref()
        .map(lower_tool_choice)
        .unwrap_or((None, None));

    GeneralRequest {
        model: req.model.clone(),
        messages,
        max_tokens: (req.max_tokens > 0).then_some(req.max_tokens),
        temperature: req.temperature,
        top_p: req.top_p,
        top_k: req.top_k,
        stop: req
            .stop_sequences
            .clone()
            .filter(|s| !s.is_empty())
            .map(StopSequences::Many),
        stream: req.is_stream(),
        tools: tools.filter(|t| !t.is_empty()),
        tool_choice,
        parallel_tool_calls,
        thinking: req.thinking.clone(),
        user: req
            .metadata
            .as_ref()
            .and_then(|m| m.get("user_id"))
            .and_then(Value::as_str)
            .map(String::from),
        ..Default::default()
    }
}

/// Re-elevates an OpenAI completion into a Claude `message`.
pub fn openai_to_claude_response(resp: &TextResponse) -> ClaudeResponse {
    let mut content = Vec::new();
    let mut finish = None;
    if let Some(choice) = resp.choices.first() {
        let msg = &choice.message;
        if let Some(reasoning) = msg.reasoning_text() {
            content.push(ClaudeContent::Thinking {
                thinking: reasoning,
                signature: None,
            });
        }
        let text = msg.string_content();
        if !text.is_empty() {
            content.push(ClaudeContent::text(text));
        }
        for call in msg.tool_calls.iter().flatten() {
            let input = serde_json::from_str::<Value>(call.arguments())
                .ok()
                .filter(Value::is_object)
                .unwrap_or_else(|| Value::Object(Default::default()));
            content.push(ClaudeContent::ToolUse {
                id: call.id.clone().unwrap_or_default(),
                name: call.function.name.clone(),
                input,
            });
        }
        finish = choice.finish_reason.clone();
    }

    ClaudeResponse {
        id: resp.id.clone(),
        kind: "message".to_string(),
        role: "assistant".to_string(),
        content,
        model: resp.model.clone(),
        stop_reason: Some(
            finish
                .as_deref()
                .map(openai_finish_to_claude)
                .unwrap_or("end_turn")
                .to_string(),
        ),
        stop_sequence: None,
        usage: ClaudeUsage {
            input_tokens: resp.usage.prompt_tokens,
            output_tokens: resp.usage.completion_tokens,
            cache_read_input_tokens: resp
                .usage
                .prompt_tokens_details
                .as_ref()
                .and_then(|d| d.cached_tokens),
            ..Default::default()
        },
        error: None,
    }
}
