//! 透传适配器：把请求原样转发到渠道的 base URL。
//!
//! The caller's path (`meta.request_url_path`) is appended to the channel
//! base and the request body is forwarded as parsed. The reply goes back
//! with its own status: event streams through the OpenAI stream relay,
//! anything else byte for byte. Usage is whatever the body reports.

use super::common::{require_base, set_bearer, set_header};
use super::openai::handler as openai_handler;
use super::Adaptor;
use crate::context::RelayContext;
use crate::meta::{Meta, Mode};
use crate::pricing::{self, PricingMap};
use crate::stream::writer::APPLICATION_JSON;
use crate::stream::ResponseWriter;
use crate::transport::{http, UpstreamResponse};
use crate::types::{GeneralRequest, Usage};
use crate::{Error, Result};
use async_trait::async_trait;
use reqwest::header::HeaderMap;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;

/// Client headers that are copied upstream.
const FORWARDED_HEADERS: &[&str] = &["openai-organization", "openai-beta", "anthropic-version", "anthropic-beta"];

#[derive(Debug, Default, Deserialize)]
struct UsageOnly {
    #[serde(default)]
    usage: Option<Usage>,
}

pub async fn handler(
    ctx: &mut RelayContext,
    resp: UpstreamResponse,
    meta: &Meta,
    out: &mut ResponseWriter<'_>,
) -> Result<Usage> {
    if resp.is_success() && resp.is_event_stream() {
        return openai_handler::stream_handler(ctx, resp, meta, out).await;
    }
    let status = resp.status;
    let content_type = match resp.content_type() {
        Some(ct) if ct.starts_with("application/json") => APPLICATION_JSON,
        Some(ct) if ct.starts_with("text/") => "text/plain",
        _ => "application/octet-stream",
    };
    let body = http::collect_body(ctx.cancellation(), resp).await?;
    let usage = serde_json::from_slice::<UsageOnly>(&body)
        .ok()
        .and_then(|u| u.usage)
        .map(Usage::finalize)
        .unwrap_or_default();
    if status >= 400 {
        tracing::debug!(status, url_path = %meta.request_url_path, "forwarding upstream error as is");
    }
    out.send_bytes(status, content_type, body).await?;
    Ok(usage)
}

#[derive(Debug, Default)]
pub struct ProxyAdaptor {
    meta: Meta,
}

#[async_trait]
impl Adaptor for ProxyAdaptor {
    fn init(&mut self, meta: &Meta) {
        self.meta = meta.clone();
    }

    fn request_url(&self, meta: &Meta) -> Result<String> {
        if meta.request_url_path.is_empty() {
            return Err(Error::invalid_request("proxy channels need the request path"));
        }
        let path = meta.request_url_path.trim_start_matches('/');
        Ok(format!("{}/{}", require_base(meta)?, path))
    }

    fn setup_request_header(&self, headers: &mut HeaderMap, meta: &Meta) -> Result<()> {
        for &name in FORWARDED_HEADERS {
            if let Some(value) = meta.client_header(name) {
                set_header(headers, name, value)?;
            }
        }
        set_bearer(headers, &meta.api_key)
    }

    async fn convert_request(
        &self,
        _ctx: &mut RelayContext,
        _mode: Mode,
        request: &GeneralRequest,
    ) -> Result<Value> {
        Ok(serde_json::to_value(request)?)
    }

    async fn do_response(
        &self,
        ctx: &mut RelayContext,
        resp: UpstreamResponse,
        meta: &Meta,
        out: &mut ResponseWriter<'_>,
    ) -> Result<Usage> {
        handler(ctx, resp, meta, out).await
    }

    fn default_model_pricing(&self) -> Arc<PricingMap> {
        pricing::table("proxy")
    }

    fn channel_name(&self) -> &'static str {
        "proxy"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::ChannelType;

    #[test]
    fn test_url_joins_path() {
        let meta = Meta::new(ChannelType::Proxy, "any")
            .with_base_url("https://gateway.example.com/")
            .with_request_path("/v1/moderations");
        assert_eq!(
            ProxyAdaptor::default().request_url(&meta).unwrap(),
            "https://gateway.example.com/v1/moderations"
        );
    }

    #[test]
    fn test_forwards_selected_headers() {
        let meta = Meta::new(ChannelType::Proxy, "any")
            .with_api_key("sk")
            .with_client_header("OpenAI-Beta", "assistants=v2")
            .with_client_header("cookie", "secret");
        let mut headers = HeaderMap::new();
        ProxyAdaptor::default().setup_request_header(&mut headers, &meta).unwrap();
        assert_eq!(headers["openai-beta"], "assistants=v2");
        assert!(headers.get("cookie").is_none());
        assert_eq!(headers["authorization"], "Bearer sk");
    }

    #[tokio::test]
    async fn test_error_status_is_passed_through() {
        let resp = UpstreamResponse::from_bytes(429, "application/json", r#"{"error":{"message":"slow down"}}"#);
        let meta = Meta::new(ChannelType::Proxy, "any");
        let mut sink = Vec::new();
        let mut out = ResponseWriter::openai(&mut sink);
        let usage = handler(&mut RelayContext::default(), resp, &meta, &mut out).await.unwrap();
        assert!(usage.is_empty());
        assert_eq!(out.status(), 429);
        drop(out);
        assert!(String::from_utf8(sink).unwrap().contains("slow down"));
    }

    #[tokio::test]
    async fn test_reported_usage_is_kept() {
        let resp = UpstreamResponse::from_bytes(
            200,
            "application/json",
            r#"{"object":"list","usage":{"prompt_tokens":4,"completion_tokens":0}}"#,
        );
        let meta = Meta::new(ChannelType::Proxy, "any");
        let mut sink = Vec::new();
        let mut out = ResponseWriter::openai(&mut sink);
        let usage = handler(&mut RelayContext::default(), resp, &meta, &mut out).await.unwrap();
        assert_eq!(usage.total_tokens, 4);
    }
}
