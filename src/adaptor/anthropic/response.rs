//! Whole Anthropic `message` replies.

use super::stream::is_native;
use crate::adaptor::common::{read_checked_json, to_value};
use crate::cache::SignatureKey;
use crate::context::RelayContext;
use crate::convert::claude_stop_to_openai;
use crate::meta::Meta;
use crate::stream::ResponseWriter;
use crate::transport::UpstreamResponse;
use crate::types::{
    ClaudeContent, ClaudeResponse, ClaudeUsage, Message, PromptTokensDetails, TextResponse, Tool,
    Usage,
};
use crate::Result;

/// Anthropic usage in OpenAI terms. Cache writes and reads are part of the prompt.
pub fn claude_usage_to_openai(u: &ClaudeUsage) -> Usage {
    let cache_write = u.cache_creation_input_tokens.unwrap_or(0);
    let cache_read = u.cache_read_input_tokens.unwrap_or(0);
    let mut usage = Usage::new(u.input_tokens + cache_write + cache_read, u.output_tokens);
    if cache_read > 0 {
        usage.prompt_tokens_details = Some(PromptTokensDetails {
            cached_tokens: Some(cache_read),
            ..Default::default()
        });
    }
    usage
}

/// Signatures of a reply's thinking blocks, by thinking ordinal.
pub fn thinking_signatures(resp: &ClaudeResponse) -> Vec<(usize, String)> {
    resp.content
        .iter()
        .filter_map(|block| match block {
            ClaudeContent::Thinking { signature, .. } => Some(signature.clone().unwrap_or_default()),
            _ => None,
        })
        .enumerate()
        .filter(|(_, sig)| !sig.is_empty())
        .collect()
}

/// Claude `message` to an OpenAI completion.
pub fn to_text_response(ctx: &RelayContext, resp: &ClaudeResponse, meta: &Meta) -> TextResponse {
    let mut text = String::new();
    let mut reasoning = Vec::new();
    let mut calls = Vec::new();
    for block in &resp.content {
        match block {
            ClaudeContent::Text { text: t, .. } => text.push_str(t),
            ClaudeContent::Thinking { thinking, .. } if !thinking.is_empty() => reasoning.push(thinking.as_str()),
            ClaudeContent::ToolUse { id, name, input } => {
                let args = if input.is_null() { "{}".to_string() } else { input.to_string() };
                calls.push(Tool::call(id.clone(), name.clone(), args));
            }
            _ => {}
        }
    }

    let mut message = Message::assistant(text);
    if !calls.is_empty() {
        message.tool_calls = Some(calls);
    }
    if !reasoning.is_empty() {
        ctx.reasoning_format.apply(&mut message, reasoning.join("\n\n"));
    }

    let finish = resp
        .stop_reason
        .as_deref()
        .map(|r| claude_stop_to_openai(r).to_string())
        .unwrap_or_else(|| "stop".to_string());
    let model = if resp.model.is_empty() { meta.actual_model_name.clone() } else { resp.model.clone() };
    let mut out = TextResponse::new(model, message, Some(finish), claude_usage_to_openai(&resp.usage));
    if !resp.id.is_empty() {
        out.id = resp.id.clone();
    }
    out
}

async fn store_signatures(ctx: &RelayContext, resp: &ClaudeResponse) {
    let Some(anchor) = ctx.thinking_anchor() else {
        return;
    };
    for (ordinal, signature) in thinking_signatures(resp) {
        let key = SignatureKey::new(
            ctx.token_key(),
            anchor.conversation_id.as_str(),
            anchor.message_index,
            ordinal,
        );
        ctx.signatures().store(&key, &signature).await;
    }
}

/// Finishes a decoded Claude reply: native callers get it as is, others an
/// OpenAI completion with reasoning in the selected field.
pub async fn relay_message(
    ctx: &mut RelayContext,
    resp: ClaudeResponse,
    meta: &Meta,
    out: &mut ResponseWriter<'_>,
) -> Result<Usage> {
    store_signatures(ctx, &resp).await;
    let mut usage = claude_usage_to_openai(&resp.usage);
    if usage.prompt_tokens == 0 {
        usage.prompt_tokens = meta.prompt_tokens;
        usage = usage.finalize();
    }

    if is_native(ctx, meta, out) {
        ctx.converted_response = Some(to_value(&resp)?);
        out.send_claude_response(&resp).await?;
        return Ok(usage);
    }

    let mut body = to_text_response(ctx, &resp, meta);
    body.usage = usage.clone();
    ctx.converted_response = Some(to_value(&body)?);
    out.send_completion(&body).await?;
    Ok(usage)
}

pub async fn handler(
    ctx: &mut RelayContext,
    resp: UpstreamResponse,
    meta: &Meta,
    out: &mut ResponseWriter<'_>,
) -> Result<Usage> {
    let body: ClaudeResponse = read_checked_json(ctx.cancellation(), resp, "anthropic").await?;
    relay_message(ctx, body, meta, out).await
}
