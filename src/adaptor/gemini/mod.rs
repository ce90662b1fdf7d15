//! Gemini 适配器：Google Generative Language API。
//!
//! # Gemini
//!
//! | Mode | Path |
//! |------|------|
//! | chat | `/{version}/models/{model}:generateContent` |
//! | chat, stream | `/{version}/models/{model}:streamGenerateContent?alt=sse` |
//! | embeddings | `/{version}/models/{model}:batchEmbedContents` |
//!
//! `version` is the channel's `api_version`, `v1beta` when unset. The key
//! goes in `x-goog-api-key`. Wire types and conversions live in [`model`]
//! so Vertex AI can reuse them.

pub mod model;

use super::common::{check_status, read_checked_json, require_base, set_header, to_value};
use super::Adaptor;
use crate::context::RelayContext;
use crate::meta::{Meta, Mode};
use crate::pricing::{self, PricingMap};
use crate::stream::{sse_data, LineReader, ReadOutcome, ResponseWriter};
use crate::transport::UpstreamResponse;
use crate::types::{EmbeddingResponse, GeneralRequest, Usage};
use crate::{Error, Result};
use async_trait::async_trait;
use reqwest::header::HeaderMap;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

pub const DEFAULT_API_VERSION: &str = "v1beta";

#[derive(Debug, Default)]
pub struct GeminiAdaptor {
    meta: Meta,
}

/// `:action` suffix for a mode.
pub fn action(mode: Mode, stream: bool) -> &'static str {
    match mode {
        Mode::Embeddings => "batchEmbedContents",
        _ if stream => "streamGenerateContent?alt=sse",
        _ => "generateContent",
    }
}

pub fn embedding_body(request: &GeneralRequest, model: &str) -> Result<Value> {
    let input = request
        .input
        .as_ref()
        .ok_or_else(|| Error::invalid_request("embedding request needs `input`"))?;
    let requests: Vec<Value> = input
        .to_vec()
        .into_iter()
        .map(|text| {
            let mut r = json!({
                "model": format!("models/{}", model),
                "content": {"parts": [{"text": text}]},
            });
            if let Some(d) = request.dimensions {
                r["outputDimensionality"] = json!(d);
            }
            r
        })
        .collect();
    Ok(json!({ "requests": requests }))
}

#[derive(Debug, Deserialize)]
struct EmbeddingReply {
    #[serde(default)]
    embeddings: Vec<EmbeddingValues>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingValues {
    #[serde(default)]
    values: Vec<f64>,
}

/// Relays a whole `generateContent` reply.
pub async fn handler(
    ctx: &mut RelayContext,
    resp: UpstreamResponse,
    meta: &Meta,
    out: &mut ResponseWriter<'_>,
) -> Result<Usage> {
    let body: model::ChatResponse = read_checked_json(ctx.cancellation(), resp, "gemini").await?;
    let mut text = model::to_text_response(&body, &meta.actual_model_name, ctx.reasoning_format);
    if text.choices.is_empty() {
        return Err(Error::Upstream {
            status: 502,
            message: "gemini returned no candidates".to_string(),
            provider_code: None,
        });
    }
    text.usage = crate::adaptor::openai::handler::finish_usage(
        Some(text.usage.clone()),
        meta,
        &text.assembled_text(),
    );
    ctx.converted_response = Some(to_value(&text)?);
    out.send_completion(&text).await?;
    Ok(text.usage)
}

/// Relays `streamGenerateContent?alt=sse` as Chat Completions chunks.
pub async fn stream_handler(
    ctx: &mut RelayContext,
    resp: UpstreamResponse,
    meta: &Meta,
    out: &mut ResponseWriter<'_>,
) -> Result<Usage> {
    let resp = check_status(ctx.cancellation(), resp).await?;
    out.begin_stream();
    let mut translator = model::StreamTranslator::new(meta.actual_model_name.clone(), ctx.reasoning_format);
    let mut reader = LineReader::from_response(resp);

    loop {
        let line = match reader.next_line(ctx.cancellation()).await {
            Ok(ReadOutcome::Line(line)) => line,
            Ok(ReadOutcome::Eof) => break,
            Ok(ReadOutcome::Cancelled) => return Ok(translator.usage(meta.prompt_tokens)),
            Err(e) => {
                tracing::warn!(error = %e, "gemini stream read failed");
                out.send_error(&e).await?;
                return Ok(translator.usage(meta.prompt_tokens));
            }
        };
        let Some(data) = sse_data(&line).filter(|d| !d.is_empty()) else {
            continue;
        };
        let event: model::ChatResponse = match serde_json::from_str(data) {
            Ok(e) => e,
            Err(e) => {
                tracing::debug!(error = %e, line = %data, "skipping undecodable gemini event");
                continue;
            }
        };
        for chunk in translator.on_event(&event) {
            out.send_chunk(&chunk).await?;
        }
    }

    let (chunks, usage) = translator.finish(meta.prompt_tokens);
    for chunk in &chunks {
        out.send_chunk(chunk).await?;
    }
    out.send_done().await?;
    Ok(usage)
}

pub async fn embedding_handler(
    ctx: &mut RelayContext,
    resp: UpstreamResponse,
    meta: &Meta,
    out: &mut ResponseWriter<'_>,
) -> Result<Usage> {
    let body: EmbeddingReply = read_checked_json(ctx.cancellation(), resp, "gemini").await?;
    let usage = Usage::new(meta.prompt_tokens, 0);
    let vectors = body.embeddings.into_iter().map(|e| e.values).collect();
    let reply = EmbeddingResponse::new(meta.actual_model_name.clone(), vectors, usage.clone());
    out.send_json(200, &reply).await?;
    Ok(usage)
}

#[async_trait]
impl Adaptor for GeminiAdaptor {
    fn init(&mut self, meta: &Meta) {
        self.meta = meta.clone();
    }

    fn request_url(&self, meta: &Meta) -> Result<String> {
        let version = meta
            .config
            .api_version
            .as_deref()
            .filter(|v| !v.is_empty())
            .unwrap_or(DEFAULT_API_VERSION);
        Ok(format!(
            "{}/{}/models/{}:{}",
            require_base(meta)?,
            version,
            meta.actual_model_name,
            action(meta.mode, meta.is_stream)
        ))
    }

    fn setup_request_header(&self, headers: &mut HeaderMap, meta: &Meta) -> Result<()> {
        set_header(headers, "x-goog-api-key", &meta.api_key)
    }

    async fn convert_request(
        &self,
        ctx: &mut RelayContext,
        mode: Mode,
        request: &GeneralRequest,
    ) -> Result<Value> {
        match mode {
            Mode::ChatCompletions | Mode::ClaudeMessages => to_value(&model::convert_request(ctx, request).await?),
            Mode::Embeddings => {
                let model = if self.meta.actual_model_name.is_empty() {
                    request.model.as_str()
                } else {
                    self.meta.actual_model_name.as_str()
                };
                embedding_body(request, model)
            }
            _ => Err(Error::mode_unsupported(&request.model, self.channel_name(), mode)),
        }
    }

    async fn do_response(
        &self,
        ctx: &mut RelayContext,
        resp: UpstreamResponse,
        meta: &Meta,
        out: &mut ResponseWriter<'_>,
    ) -> Result<Usage> {
        match meta.mode {
            Mode::Embeddings => embedding_handler(ctx, resp, meta, out).await,
            _ if meta.is_stream => stream_handler(ctx, resp, meta, out).await,
            _ => handler(ctx, resp, meta, out).await,
        }
    }

    fn default_model_pricing(&self) -> Arc<PricingMap> {
        pricing::table("gemini")
    }

    fn channel_name(&self) -> &'static str {
        "gemini"
    }
}
