//! Cloudflare Workers AI 适配器。
//!
//! The account id comes from `config.user_id`. Chat and embeddings use the
//! OpenAI-compatible `/ai/v1` surface. Image models are called through
//! `/ai/run/{model}` and answer either with raw image bytes (Stable
//! Diffusion) or with `{"result": {"image": base64}}` (FLUX); both are
//! published through the object store.

use super::common::{read_checked_json, require_base, set_bearer};
use super::openai::{chat_body, embedding_body, handler};
use super::Adaptor;
use crate::context::RelayContext;
use crate::meta::{Meta, Mode};
use crate::pricing::{self, PricingMap};
use crate::storage::{default_store, publish_images};
use crate::stream::ResponseWriter;
use crate::transport::{http, UpstreamResponse};
use crate::types::response::unix_now;
use crate::types::{GeneralRequest, ImageRequest, ImageResponse, Usage};
use crate::{Error, ErrorContext, Result};
use async_trait::async_trait;
use base64::Engine;
use reqwest::header::HeaderMap;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

fn account(meta: &Meta) -> Result<&str> {
    meta.config
        .user_id
        .as_deref()
        .filter(|a| !a.is_empty())
        .ok_or_else(|| {
            Error::config_missing(
                "cloudflare channels need the account id in config.user_id",
                ErrorContext::new().with_field_path("config.user_id"),
            )
        })
}

#[derive(Debug, Deserialize)]
struct RunReply {
    #[serde(default)]
    result: Option<RunResult>,
    #[serde(default)]
    success: bool,
    #[serde(default)]
    errors: Vec<RunError>,
}

#[derive(Debug, Deserialize)]
struct RunResult {
    #[serde(default)]
    image: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RunError {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    message: String,
}

pub async fn image_handler(
    ctx: &mut RelayContext,
    resp: UpstreamResponse,
    meta: &Meta,
    out: &mut ResponseWriter<'_>,
) -> Result<Usage> {
    let is_image = resp.content_type().map_or(false, |ct| ct.starts_with("image/"));
    let image = if is_image && resp.is_success() {
        let mime = resp
            .content_type()
            .map(|ct| ct.split(';').next().unwrap_or(ct).trim().to_string())
            .unwrap_or_else(|| "image/png".to_string());
        let bytes = http::collect_body(ctx.cancellation(), resp).await?;
        (mime, base64::engine::general_purpose::STANDARD.encode(&bytes))
    } else {
        let reply: RunReply = read_checked_json(ctx.cancellation(), resp, "cloudflare.run").await?;
        match reply.result.and_then(|r| r.image).filter(|_| reply.success) {
            Some(b64) => ("image/jpeg".to_string(), b64),
            None => {
                let first = reply.errors.into_iter().next();
                return Err(Error::Upstream {
                    status: 502,
                    message: first
                        .as_ref()
                        .map(|e| e.message.clone())
                        .unwrap_or_else(|| format!("{} returned no image", meta.actual_model_name)),
                    provider_code: first.map(|e| e.code.to_string()),
                });
            }
        }
    };
    let store = default_store();
    let data = publish_images(store.as_deref(), ctx.cancellation(), vec![image]).await?;
    let usage = Usage::new(data.len() as u64, 0);
    out.send_json(200, &ImageResponse { created: unix_now(), data }).await?;
    Ok(usage)
}

#[derive(Debug, Default)]
pub struct CloudflareAdaptor {
    meta: Meta,
}

#[async_trait]
impl Adaptor for CloudflareAdaptor {
    fn init(&mut self, meta: &Meta) {
        self.meta = meta.clone();
    }

    fn request_url(&self, meta: &Meta) -> Result<String> {
        let root = format!("{}/client/v4/accounts/{}/ai", require_base(meta)?, account(meta)?);
        Ok(match meta.mode {
            Mode::Embeddings => format!("{}/v1/embeddings", root),
            Mode::ImagesGenerations => format!("{}/run/{}", root, meta.actual_model_name),
            _ => format!("{}/v1/chat/completions", root),
        })
    }

    fn setup_request_header(&self, headers: &mut HeaderMap, meta: &Meta) -> Result<()> {
        set_bearer(headers, &meta.api_key)
    }

    async fn convert_request(
        &self,
        _ctx: &mut RelayContext,
        mode: Mode,
        request: &GeneralRequest,
    ) -> Result<Value> {
        match mode {
            Mode::ChatCompletions | Mode::ClaudeMessages => chat_body(request, &self.meta.actual_model_name, false),
            Mode::Embeddings => embedding_body(request, &self.meta.actual_model_name),
            _ => Err(Error::mode_unsupported(&request.model, self.channel_name(), mode)),
        }
    }

    async fn convert_image_request(&self, _ctx: &mut RelayContext, request: &ImageRequest) -> Result<Value> {
        let mut body = json!({ "prompt": request.prompt });
        if let Some(negative) = request.negative_prompt.as_deref().filter(|n| !n.is_empty()) {
            body["negative_prompt"] = json!(negative);
        }
        if let Some((w, h)) = request.size.as_deref().and_then(|s| s.split_once('x')) {
            if let (Ok(w), Ok(h)) = (w.parse::<u32>(), h.parse::<u32>()) {
                body["width"] = json!(w);
                body["height"] = json!(h);
            }
        }
        Ok(body)
    }

    async fn do_response(
        &self,
        ctx: &mut RelayContext,
        resp: UpstreamResponse,
        meta: &Meta,
        out: &mut ResponseWriter<'_>,
    ) -> Result<Usage> {
        match meta.mode {
            Mode::Embeddings => handler::embedding_handler(ctx, resp, meta, out).await,
            Mode::ImagesGenerations => image_handler(ctx, resp, meta, out).await,
            _ if meta.is_stream => handler::stream_handler(ctx, resp, meta, out).await,
            _ => handler::handler(ctx, resp, meta, out).await,
        }
    }

    fn default_model_pricing(&self) -> Arc<PricingMap> {
        pricing::table("cloudflare")
    }

    fn channel_name(&self) -> &'static str {
        "cloudflare"
    }
}
