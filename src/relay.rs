//! 中继驱动：一次请求从适配器选择到计费的完整流程。
//!
//! [`relay`] runs the adaptor call sequence for one request and prices the
//! result:
//!
//! 1. [`get_adaptor`] by the channel's [`ApiType`](crate::adaptor::ApiType), then `init`
//! 2. prompt pre-count when the frontend did not supply one
//! 3. `convert_*_request` by request kind
//! 4. `do_request`, then `do_response` into the caller's [`ResponseWriter`]
//! 5. three-layer price resolution and [`compute_quota`]
//!
//! Errors raised before the first byte are returned untouched so the
//! frontend can render them (or fail over). Once output has started, the
//! error is written into the stream in the caller's protocol and also
//! returned. A cancelled caller is not an error: the usage received so far
//! is priced and returned.

use crate::adaptor::{get_adaptor, Adaptor};
use crate::context::RelayContext;
use crate::meta::{Meta, Mode};
use crate::pricing::{compute_quota, resolve, PriceResolution};
use crate::stream::ResponseWriter;
use crate::tokens::{count_claude_request_tokens, count_request_tokens, count_text_tokens};
use crate::types::{ClaudeRequest, GeneralRequest, ImageRequest, Usage, VideoRequest};
use crate::{Error, ErrorContext, Result};
use serde_json::Value;
use std::time::Instant;

/// Request body as the frontend parsed it.
#[derive(Debug, Clone)]
pub enum RelayRequest {
    /// Chat, embeddings, rerank and speech; `meta.mode` tells them apart.
    General(GeneralRequest),
    Claude(ClaudeRequest),
    Image(ImageRequest),
    Video(VideoRequest),
}

impl RelayRequest {
    pub fn model(&self) -> &str {
        match self {
            RelayRequest::General(r) => &r.model,
            RelayRequest::Claude(r) => &r.model,
            RelayRequest::Image(r) => &r.model,
            RelayRequest::Video(r) => &r.model,
        }
    }

    fn is_stream(&self) -> bool {
        match self {
            RelayRequest::General(r) => r.stream,
            RelayRequest::Claude(r) => r.is_stream(),
            RelayRequest::Image(_) | RelayRequest::Video(_) => false,
        }
    }

    fn prompt_tokens(&self) -> u64 {
        match self {
            RelayRequest::General(r) => count_request_tokens(r),
            RelayRequest::Claude(r) => count_claude_request_tokens(r),
            RelayRequest::Image(r) => count_text_tokens(&r.prompt),
            RelayRequest::Video(r) => count_text_tokens(&r.prompt),
        }
    }
}

/// What the billing sink needs after a request.
#[derive(Debug, Clone, PartialEq)]
pub struct RelayOutcome {
    pub usage: Usage,
    pub price: PriceResolution,
    pub quota: i64,
    /// Caller went away before the backend finished.
    pub cancelled: bool,
}

/// Fills the derived fields of `meta` from the request.
fn prepare_meta(mut meta: Meta, request: &RelayRequest) -> Meta {
    if meta.actual_model_name.is_empty() {
        meta.actual_model_name = request.model().to_string();
    }
    if meta.origin_model_name.is_empty() {
        meta.origin_model_name = request.model().to_string();
    }
    match request {
        RelayRequest::Claude(_) => meta.mode = Mode::ClaudeMessages,
        RelayRequest::Image(_) => meta.mode = Mode::ImagesGenerations,
        RelayRequest::Video(_) => meta.mode = Mode::VideoGenerations,
        RelayRequest::General(_) => {}
    }
    meta.is_stream = meta.is_stream || request.is_stream();
    if meta.prompt_tokens == 0 {
        meta.prompt_tokens = request.prompt_tokens();
    }
    meta
}

async fn convert(
    adaptor: &dyn Adaptor,
    ctx: &mut RelayContext,
    meta: &Meta,
    request: &RelayRequest,
) -> Result<Value> {
    match request {
        RelayRequest::General(r) => adaptor.convert_request(ctx, meta.mode, r).await,
        RelayRequest::Claude(r) => adaptor.convert_claude_request(ctx, r).await,
        RelayRequest::Image(r) => adaptor.convert_image_request(ctx, r).await,
        RelayRequest::Video(r) => adaptor.convert_video_request(ctx, r).await,
    }
}

/// Relays one request through the channel described by `meta`.
pub async fn relay(
    ctx: &mut RelayContext,
    meta: Meta,
    request: RelayRequest,
    out: &mut ResponseWriter<'_>,
) -> Result<RelayOutcome> {
    let started = Instant::now();
    let meta = prepare_meta(meta, &request);
    let mut adaptor = get_adaptor(meta.api_type).ok_or_else(|| {
        Error::invalid_request_with_context(
            "channel has no adaptor",
            ErrorContext::new().with_details(format!("api type {:?}", meta.api_type)),
        )
    })?;
    adaptor.init(&meta);

    let body = convert(adaptor.as_ref(), ctx, &meta, &request).await?;
    let resp = adaptor.do_request(ctx, &meta, body).await?;
    let upstream_status = resp.status;

    let usage = match adaptor.do_response(ctx, resp, &meta, out).await {
        Ok(usage) => usage.finalize(),
        Err(e) => {
            tracing::warn!(
                channel_id = ctx.channel_id,
                api_type = adaptor.channel_name(),
                model = %meta.actual_model_name,
                status = e.status(),
                error = %e,
                "relay failed"
            );
            if out.is_started() {
                out.send_error(&e).await?;
            }
            return Err(e);
        }
    };

    let price = resolve(&meta.actual_model_name, &meta.pricing, adaptor.as_ref());
    let quota = compute_quota(&usage, price.ratio, price.completion_ratio);
    let cancelled = ctx.is_cancelled();
    tracing::info!(
        channel_id = ctx.channel_id,
        api_type = adaptor.channel_name(),
        model = %meta.actual_model_name,
        stream = meta.is_stream,
        status = upstream_status,
        prompt_tokens = usage.prompt_tokens,
        completion_tokens = usage.completion_tokens,
        quota,
        cancelled,
        duration_ms = started.elapsed().as_millis() as u64,
        "relay finished"
    );
    Ok(RelayOutcome {
        usage,
        price,
        quota,
        cancelled,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::ChannelType;
    use crate::pricing::{PriceSource, MILLI_TOKENS_USD};
    use crate::types::Message;

    #[test]
    fn test_prepare_meta_fills_gaps() {
        let req = RelayRequest::Claude(ClaudeRequest {
            model: "claude-3-5-sonnet-20241022".into(),
            stream: Some(true),
            ..Default::default()
        });
        let meta = prepare_meta(Meta::new(ChannelType::Anthropic, ""), &req);
        assert_eq!(meta.mode, Mode::ClaudeMessages);
        assert!(meta.is_stream);
        assert_eq!(meta.actual_model_name, "claude-3-5-sonnet-20241022");
    }

    #[tokio::test]
    async fn test_relay_prices_openai_completion() {
        let mut server = mockito::Server::new_async().await;
        let upstream = server
            .mock("POST", "/v1/chat/completions")
            .match_header("authorization", "Bearer sk-test")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{"id":"c1","object":"chat.completion","created":1,"model":"gpt-4",
                    "choices":[{"index":0,"message":{"role":"assistant","content":"hi"},"finish_reason":"stop"}],
                    "usage":{"prompt_tokens":1000,"completion_tokens":500,"total_tokens":1500}}"#,
            )
            .create_async()
            .await;
        let meta = Meta::new(ChannelType::OpenAI, "gpt-4")
            .with_base_url(server.url())
            .with_api_key("sk-test");
        let req = RelayRequest::General(GeneralRequest {
            model: "gpt-4".into(),
            messages: vec![Message::user("hello")],
            ..Default::default()
        });
        let mut sink = Vec::new();
        let mut out = ResponseWriter::openai(&mut sink);
        let outcome = relay(&mut RelayContext::default(), meta, req, &mut out).await.unwrap();
        upstream.assert_async().await;
        assert_eq!(outcome.usage.total_tokens, 1500);
        assert_eq!(outcome.price.ratio_source, PriceSource::Adaptor);
        assert_eq!(outcome.price.ratio, 30.0 * MILLI_TOKENS_USD);
        assert_eq!(outcome.quota, 30_000);
        assert!(!outcome.cancelled);
    }

    #[tokio::test]
    async fn test_upstream_error_before_output_is_returned() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/v1/chat/completions")
            .with_status(429)
            .with_body(r#"{"error":{"message":"rate limited","type":"rate_limit_error"}}"#)
            .create_async()
            .await;
        let meta = Meta::new(ChannelType::OpenAI, "gpt-4o").with_base_url(server.url());
        let req = RelayRequest::General(GeneralRequest {
            model: "gpt-4o".into(),
            messages: vec![Message::user("hello")],
            ..Default::default()
        });
        let mut sink = Vec::new();
        let mut out = ResponseWriter::openai(&mut sink);
        let err = relay(&mut RelayContext::default(), meta, req, &mut out).await.unwrap_err();
        assert_eq!(err.status(), 429);
        assert!(!out.is_started());
    }
}
