//! Anthropic 适配器：Messages API 的请求转换、流式翻译与思维签名缓存。
//!
//! # Anthropic
//!
//! | Piece | Role |
//! |-------|------|
//! | [`request::convert_request`] | Canonical request to a Messages body, replaying cached thinking signatures |
//! | [`stream::ClaudeStreamTranslator`] | Anthropic SSE events to OpenAI chunks |
//! | [`stream::ClaudeStreamRelay`] | Drives one event stream; shared with the Bedrock adaptor |
//! | [`response::relay_message`] | Whole `message` replies |
//!
//! Claude callers whose request was not lowered get the Anthropic wire
//! format back untouched; everyone else gets Chat Completions.

pub mod request;
pub mod response;
pub mod stream;

use super::common::{require_base, set_header, to_value};
use super::Adaptor;
use crate::cache::generate_conversation_id;
use crate::config::RelayConfig;
use crate::context::{RelayContext, ThinkingAnchor};
use crate::meta::{Meta, Mode};
use crate::pricing::{self, PricingMap};
use crate::stream::ResponseWriter;
use crate::transport::UpstreamResponse;
use crate::types::{ClaudeRequest, GeneralRequest, Usage};
use crate::{Error, Result};
use async_trait::async_trait;
use reqwest::header::HeaderMap;
use serde_json::Value;
use std::sync::Arc;

#[derive(Debug, Default)]
pub struct AnthropicAdaptor {
    meta: Meta,
}

impl AnthropicAdaptor {
    fn model<'a>(&'a self, requested: &'a str) -> &'a str {
        if self.meta.actual_model_name.is_empty() {
            requested
        } else {
            &self.meta.actual_model_name
        }
    }
}

/// Where signatures of the coming reply will be filed: the whole request
/// history identifies the conversation, and the reply lands right after it.
pub fn reply_anchor(ctx: &RelayContext, request: &GeneralRequest) -> ThinkingAnchor {
    ThinkingAnchor {
        conversation_id: ctx
            .conversation_id
            .clone()
            .unwrap_or_else(|| generate_conversation_id(&request.messages)),
        message_index: request.messages.len(),
    }
}

/// `x-api-key`, `anthropic-version` and a forwarded `anthropic-beta`.
pub fn set_anthropic_headers(headers: &mut HeaderMap, meta: &Meta) -> Result<()> {
    set_header(headers, "x-api-key", &meta.api_key)?;
    let version = match meta.client_header("anthropic-version") {
        Some(v) if !v.is_empty() => v.to_string(),
        _ => RelayConfig::global().anthropic_version.clone(),
    };
    set_header(headers, "anthropic-version", &version)?;
    if let Some(beta) = meta.client_header("anthropic-beta").filter(|b| !b.is_empty()) {
        set_header(headers, "anthropic-beta", beta)?;
    }
    Ok(())
}

#[async_trait]
impl Adaptor for AnthropicAdaptor {
    fn init(&mut self, meta: &Meta) {
        self.meta = meta.clone();
    }

    fn request_url(&self, meta: &Meta) -> Result<String> {
        Ok(format!("{}/v1/messages", require_base(meta)?))
    }

    fn setup_request_header(&self, headers: &mut HeaderMap, meta: &Meta) -> Result<()> {
        set_anthropic_headers(headers, meta)
    }

    async fn convert_request(
        &self,
        ctx: &mut RelayContext,
        mode: Mode,
        request: &GeneralRequest,
    ) -> Result<Value> {
        if !matches!(mode, Mode::ChatCompletions | Mode::ClaudeMessages) {
            return Err(Error::mode_unsupported(&request.model, self.channel_name(), mode));
        }
        let body = request::convert_request(ctx, request, self.model(&request.model)).await?;
        ctx.set_thinking_anchor(reply_anchor(ctx, request));
        to_value(&body)
    }

    /// Claude Messages bodies go out as sent, with only the model swapped.
    async fn convert_claude_request(&self, ctx: &mut RelayContext, request: &ClaudeRequest) -> Result<Value> {
        ctx.original_claude_request = Some(request.clone());
        let mut body = request.clone();
        body.model = self.model(&request.model).to_string();
        to_value(&body)
    }

    async fn do_response(
        &self,
        ctx: &mut RelayContext,
        resp: UpstreamResponse,
        meta: &Meta,
        out: &mut ResponseWriter<'_>,
    ) -> Result<Usage> {
        if meta.is_stream {
            stream::stream_handler(ctx, resp, meta, out).await
        } else {
            response::handler(ctx, resp, meta, out).await
        }
    }

    fn default_model_pricing(&self) -> Arc<PricingMap> {
        pricing::table("anthropic")
    }

    fn channel_name(&self) -> &'static str {
        "anthropic"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::ChannelType;
    use crate::types::{ClaudeContent, ClaudeMessage, Message};

    fn adaptor(meta: &Meta) -> AnthropicAdaptor {
        let mut a = AnthropicAdaptor::default();
        a.init(meta);
        a
    }

    #[test]
    fn test_url_and_headers() {
        let meta = Meta::new(ChannelType::Anthropic, "claude-3-5-sonnet-20241022")
            .with_api_key("sk-ant")
            .with_client_header("anthropic-beta", "prompt-caching-2024-07-31");
        let a = adaptor(&meta);
        assert_eq!(a.request_url(&meta).unwrap(), "https://api.anthropic.com/v1/messages");
        let mut headers = HeaderMap::new();
        a.setup_request_header(&mut headers, &meta).unwrap();
        assert_eq!(headers["x-api-key"], "sk-ant");
        assert_eq!(headers["anthropic-version"], "2023-06-01");
        assert_eq!(headers["anthropic-beta"], "prompt-caching-2024-07-31");
    }

    #[tokio::test]
    async fn test_convert_sets_reply_anchor() {
        let meta = Meta::new(ChannelType::Anthropic, "claude-3-5-sonnet-20241022");
        let req = GeneralRequest {
            messages: vec![Message::system("be brief"), Message::user("hi")],
            ..Default::default()
        };
        let mut ctx = RelayContext::default();
        let body = adaptor(&meta)
            .convert_request(&mut ctx, Mode::ChatCompletions, &req)
            .await
            .unwrap();
        assert_eq!(body["model"], "claude-3-5-sonnet-20241022");
        let anchor = ctx.thinking_anchor().unwrap();
        assert_eq!(anchor.message_index, 2);
        assert_eq!(anchor.conversation_id, generate_conversation_id(&req.messages));
    }

    #[tokio::test]
    async fn test_native_claude_body_passes_through() {
        let meta = Meta::new(ChannelType::Anthropic, "claude-sonnet-4-20250514");
        let req = ClaudeRequest {
            model: "sonnet".into(),
            max_tokens: 64,
            messages: vec![ClaudeMessage::new("user", vec![ClaudeContent::text("hi")])],
            ..Default::default()
        };
        let mut ctx = RelayContext::default();
        let body = adaptor(&meta).convert_claude_request(&mut ctx, &req).await.unwrap();
        assert_eq!(body["model"], "claude-sonnet-4-20250514");
        assert_eq!(body["max_tokens"], 64);
        assert!(!ctx.claude_messages_conversion);
        assert!(ctx.thinking_anchor().is_none());
        assert!(ctx.original_claude_request.is_some());
    }

    #[tokio::test]
    async fn test_rejects_embeddings() {
        let meta = Meta::new(ChannelType::Anthropic, "claude-3-haiku-20240307");
        let err = adaptor(&meta)
            .convert_request(&mut RelayContext::default(), Mode::Embeddings, &GeneralRequest::default())
            .await
            .unwrap_err();
        assert_eq!(err.status(), 400);
    }
}
