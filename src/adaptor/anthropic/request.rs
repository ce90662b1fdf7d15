//! Canonical request to Anthropic Messages.

use crate::cache::{generate_conversation_id, SignatureKey};
use crate::context::RelayContext;
use crate::types::{
    parse_data_url, ClaudeContent, ClaudeMessage, ClaudeMessageContent, ClaudeRequest, ClaudeSystem,
    ClaudeTool, ClaudeToolChoice, ContentPart, GeneralRequest, ImageSource, Message, Role, Thinking,
    ThinkingType, ToolChoice,
};
use crate::{Error, Result};
use serde_json::{json, Value};

pub const DEFAULT_MAX_TOKENS: u32 = 500;
/// Budget cap when the caller enabled thinking without one.
pub const DEFAULT_THINKING_BUDGET: u32 = 1024;
/// Thinking needs more room than the budget floor.
pub const MIN_THINKING_MAX_TOKENS: u32 = 1024;
pub const THINKING_SUFFIX: &str = "-thinking";
pub const EMPTY_CONTENT_PLACEHOLDER: &str = "(no content)";

/// Legacy model names Anthropic no longer accepts.
pub fn resolve_model_alias(model: &str) -> &str {
    match model {
        "claude-instant-1" => "claude-instant-1.1",
        "claude-2" => "claude-2.1",
        other => other,
    }
}

/// Image part as an Anthropic image source. Data URLs become `base64`
/// sources, anything else a `url` source.
pub fn image_source(url: &str) -> ImageSource {
    match parse_data_url(url) {
        Some((media_type, data)) => ImageSource {
            kind: "base64".to_string(),
            media_type: Some(media_type),
            data: Some(data),
            url: None,
        },
        None => ImageSource {
            kind: "url".to_string(),
            media_type: None,
            data: None,
            url: Some(url.to_string()),
        },
    }
}

fn user_blocks(msg: &Message) -> Vec<ClaudeContent> {
    msg.parse_content()
        .into_iter()
        .filter_map(|part| match part {
            ContentPart::Text { text } if !text.is_empty() => Some(ClaudeContent::text(text)),
            ContentPart::ImageUrl { image_url } => Some(ClaudeContent::Image {
                source: image_source(&image_url.url),
            }),
            _ => None,
        })
        .collect()
}

/// Reasoning segments of an assistant message with any signature the client echoed.
fn reasoning_segments(msg: &Message) -> Vec<(String, Option<String>)> {
    if let Some(crate::types::MessageContent::Parts(parts)) = &msg.content {
        let segments: Vec<_> = parts
            .iter()
            .filter_map(|p| match p {
                ContentPart::Thinking { thinking, signature } if !thinking.is_empty() => {
                    Some((thinking.clone(), signature.clone().filter(|s| !s.is_empty())))
                }
                _ => None,
            })
            .collect();
        if !segments.is_empty() {
            return segments;
        }
    }
    [&msg.reasoning_content, &msg.reasoning, &msg.thinking]
        .into_iter()
        .find_map(|f| f.as_deref().filter(|t| !t.is_empty()))
        .map(|t| vec![(t.to_string(), None)])
        .unwrap_or_default()
}

/// Converts an assistant message. Returns the blocks and whether reasoning had
/// to be inlined as `<think>` text.
async fn assistant_blocks(
    ctx: &RelayContext,
    messages: &[Message],
    index: usize,
    thinking_on: bool,
) -> (Vec<ClaudeContent>, bool) {
    let msg = &messages[index];
    let mut blocks = Vec::new();
    let mut inlined = false;
    let mut think_prefix = String::new();

    let segments = if thinking_on { reasoning_segments(msg) } else { Vec::new() };
    if !segments.is_empty() {
        let conversation = ctx
            .conversation_id
            .clone()
            .unwrap_or_else(|| generate_conversation_id(&messages[..index]));
        let mut restored = Vec::with_capacity(segments.len());
        for (ordinal, (text, echoed)) in segments.iter().enumerate() {
            let signature = match echoed {
                Some(sig) => Some(sig.clone()),
                None => {
                    let key = SignatureKey::new(ctx.token_key(), conversation.as_str(), index, ordinal);
                    ctx.signatures().get(&key).await
                }
            };
            restored.push((text.clone(), signature));
        }
        if restored.iter().all(|(_, sig)| sig.is_some()) {
            for (thinking, signature) in restored {
                blocks.push(ClaudeContent::Thinking { thinking, signature });
            }
        } else {
            tracing::debug!(message_index = index, "no thinking signature cached, inlining reasoning");
            let joined: String = segments.iter().map(|(t, _)| t.as_str()).collect();
            think_prefix = format!("<think>{}</think>\n\n", joined);
            inlined = true;
        }
    }

    let text = msg.string_content();
    if !think_prefix.is_empty() {
        blocks.push(ClaudeContent::text(format!("{}{}", think_prefix, text)));
    } else if !text.is_empty() {
        blocks.push(ClaudeContent::text(text));
    }
    for call in msg.tool_calls.iter().flatten() {
        let input = serde_json::from_str::<Value>(call.arguments())
            .ok()
            .filter(Value::is_object)
            .unwrap_or_else(|| json!({}));
        blocks.push(ClaudeContent::ToolUse {
            id: call.id.clone().unwrap_or_default(),
            name: call.function.name.clone(),
            input,
        });
    }
    (blocks, inlined)
}

fn tool_result_block(msg: &Message) -> ClaudeContent {
    ClaudeContent::ToolResult {
        tool_use_id: msg.tool_call_id.clone().unwrap_or_default(),
        content: Some(ClaudeMessageContent::Text(msg.string_content())),
        is_error: None,
    }
}

fn push_message(out: &mut Vec<ClaudeMessage>, role: &str, mut blocks: Vec<ClaudeContent>) {
    if blocks.is_empty() {
        blocks.push(ClaudeContent::text(EMPTY_CONTENT_PLACEHOLDER));
    }
    out.push(ClaudeMessage::new(role, blocks));
}

fn tool_choice(choice: &ToolChoice) -> Option<ClaudeToolChoice> {
    match choice {
        ToolChoice::Mode(mode) => match mode.as_str() {
            "auto" => Some(ClaudeToolChoice::of("auto")),
            "required" | "any" => Some(ClaudeToolChoice::of("any")),
            "none" => Some(ClaudeToolChoice::of("none")),
            _ => None,
        },
        ToolChoice::Named(named) => Some(ClaudeToolChoice {
            kind: "tool".to_string(),
            name: Some(named.function.name.clone()),
            disable_parallel_tool_use: None,
        }),
    }
}

/// Converts a canonical request into an Anthropic Messages request.
///
/// Earlier assistant reasoning is replayed as signed thinking blocks when a
/// signature is known (echoed by the client or cached by the relay). When
/// one is missing the reasoning is inlined as `<think>` text and thinking is
/// switched off for the request, which Anthropic would otherwise reject.
pub async fn convert_request(ctx: &RelayContext, request: &GeneralRequest, model: &str) -> Result<ClaudeRequest> {
    let mut model = if model.is_empty() { request.model.as_str() } else { model };
    let mut thinking_on = request.thinking_enabled();
    if let Some(stripped) = model.strip_suffix(THINKING_SUFFIX) {
        model = stripped;
        thinking_on = true;
    }
    let model = resolve_model_alias(model).to_string();
    let max_tokens = request.effective_max_tokens().unwrap_or(DEFAULT_MAX_TOKENS);

    let mut thinking = None;
    if thinking_on {
        if max_tokens <= MIN_THINKING_MAX_TOKENS {
            return Err(Error::invalid_request(format!(
                "max_tokens must be greater than {} when thinking is enabled",
                MIN_THINKING_MAX_TOKENS
            )));
        }
        let budget = request
            .thinking
            .as_ref()
            .filter(|t| t.kind == ThinkingType::Enabled)
            .and_then(|t| t.budget_tokens)
            .unwrap_or_else(|| DEFAULT_THINKING_BUDGET.min(max_tokens / 2));
        thinking = Some(Thinking::enabled(budget));
    }

    let mut system = Vec::new();
    let mut messages: Vec<ClaudeMessage> = Vec::new();
    let mut inlined_any = false;
    for (i, msg) in request.messages.iter().enumerate() {
        match msg.role {
            Role::System => {
                let text = msg.string_content();
                if !text.is_empty() {
                    system.push(text);
                }
            }
            Role::User => push_message(&mut messages, "user", user_blocks(msg)),
            Role::Assistant => {
                let (blocks, inlined) = assistant_blocks(ctx, &request.messages, i, thinking_on).await;
                inlined_any |= inlined;
                push_message(&mut messages, "assistant", blocks);
            }
            Role::Tool => {
                let block = tool_result_block(msg);
                let merge = messages.last().map_or(false, |last| {
                    last.role == "user" && last.blocks().iter().all(ClaudeContent::is_tool_result)
                });
                if merge {
                    if let Some(ClaudeMessage {
                        content: ClaudeMessageContent::Blocks(blocks),
                        ..
                    }) = messages.last_mut()
                    {
                        blocks.push(block);
                        continue;
                    }
                }
                push_message(&mut messages, "user", vec![block]);
            }
        }
    }

    let tools = request.tools.as_ref().map(|tools| {
        tools
            .iter()
            .map(|t| ClaudeTool {
                name: t.function.name.clone(),
                description: t.function.description.clone(),
                input_schema: t
                    .function
                    .parameters
                    .clone()
                    .unwrap_or_else(|| json!({"type": "object", "properties": {}})),
            })
            .collect::<Vec<_>>()
    });
    let mut choice = request.tool_choice.as_ref().and_then(tool_choice);
    if request.parallel_tool_calls == Some(false) {
        choice
            .get_or_insert_with(|| ClaudeToolChoice::of("auto"))
            .disable_parallel_tool_use = Some(true);
    }

    let mut top_p = request.top_p;
    if thinking.is_some() {
        top_p = None;
    }
    if inlined_any {
        thinking = None;
    }

    Ok(ClaudeRequest {
        model,
        messages,
        system: (!system.is_empty()).then(|| ClaudeSystem::Text(system.join("\n"))),
        max_tokens,
        stop_sequences: request.stop.as_ref().map(|s| s.to_vec()).filter(|s| !s.is_empty()),
        temperature: request.temperature.map(|t| t.clamp(0.0, 1.0)),
        top_p,
        top_k: request.top_k,
        stream: request.stream.then_some(true),
        tools: tools.filter(|t| !t.is_empty()),
        tool_choice: choice,
        thinking,
        metadata: request.user.as_ref().map(|u| json!({ "user_id": u })),
    })
}
