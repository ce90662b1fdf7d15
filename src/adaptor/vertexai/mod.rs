//! Vertex AI 适配器：在同一个 Google Cloud 项目下服务 Gemini、Claude、Imagen 与 Veo。
//!
//! # Vertex AI
//!
//! The model name picks the publisher and the wire format:
//!
//! | Family | Model prefix | Action | Body |
//! |--------|--------------|--------|------|
//! | Gemini | anything else | `generateContent` / `streamGenerateContent?alt=sse` | [`gemini::model`](super::gemini::model) |
//! | Claude | `claude` | `rawPredict` / `streamRawPredict` | Anthropic Messages with `anthropic_version` |
//! | Embedding | `text-embedding`, `text-multilingual-embedding`, `gemini-embedding` | `predict` | `instances[].content` |
//! | Imagen | `imagen` | `predict` | see [`imagen`] |
//! | Veo | `veo` | `predictLongRunning` | see [`veo`] |
//!
//! URLs are `{base}/v1/projects/{project}/locations/{region}/publishers/{publisher}/models/{model}:{action}`.
//! `project_id` is required in the channel config; `region` defaults to
//! `us-central1`. The API key is an OAuth access token sent as a bearer.

pub mod imagen;
pub mod veo;

use super::anthropic::response::relay_message;
use super::anthropic::{self, reply_anchor};
use super::common::{read_checked_json, set_bearer, to_value};
use super::gemini;
use super::Adaptor;
use crate::context::RelayContext;
use crate::meta::{Meta, Mode};
use crate::pricing::{self, PricingMap};
use crate::stream::ResponseWriter;
use crate::transport::UpstreamResponse;
use crate::types::{ClaudeRequest, ClaudeResponse, EmbeddingResponse, GeneralRequest, ImageRequest, Usage, VideoRequest};
use crate::{Error, ErrorContext, Result};
use async_trait::async_trait;
use reqwest::header::HeaderMap;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

pub const VERTEX_ANTHROPIC_VERSION: &str = "vertex-2023-10-16";
pub const DEFAULT_REGION: &str = "us-central1";

/// Publisher family of a Vertex model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelFamily {
    Gemini,
    Claude,
    Embedding,
    Imagen,
    Veo,
}

impl ModelFamily {
    pub fn of(model: &str) -> Self {
        if model.starts_with("claude") {
            ModelFamily::Claude
        } else if model.starts_with("imagen") {
            ModelFamily::Imagen
        } else if model.starts_with("veo") {
            ModelFamily::Veo
        } else if ["text-embedding", "text-multilingual-embedding", "gemini-embedding"]
            .iter()
            .any(|p| model.starts_with(p))
        {
            ModelFamily::Embedding
        } else {
            ModelFamily::Gemini
        }
    }

    pub fn publisher(&self) -> &'static str {
        match self {
            ModelFamily::Claude => "anthropic",
            _ => "google",
        }
    }
}

fn region(meta: &Meta) -> &str {
    meta.config
        .region
        .as_deref()
        .filter(|r| !r.is_empty())
        .unwrap_or(DEFAULT_REGION)
}

fn project_id(meta: &Meta) -> Result<&str> {
    meta.config
        .project_id
        .as_deref()
        .filter(|p| !p.is_empty())
        .ok_or_else(|| {
            Error::config_missing(
                "vertex ai channel needs a project id",
                ErrorContext::new().with_field_path("config.project_id"),
            )
        })
}

/// `https://{region}-aiplatform.googleapis.com`, or the global endpoint.
fn base(meta: &Meta) -> String {
    if !meta.base().is_empty() {
        return meta.base().to_string();
    }
    match region(meta) {
        "global" => "https://aiplatform.googleapis.com".to_string(),
        r => format!("https://{}-aiplatform.googleapis.com", r),
    }
}

/// URL of `model:{action}` under the channel's project and region.
pub fn model_url(meta: &Meta, model: &str, action: &str) -> Result<String> {
    let family = ModelFamily::of(model);
    Ok(format!(
        "{}/v1/projects/{}/locations/{}/publishers/{}/models/{}:{}",
        base(meta),
        project_id(meta)?,
        region(meta),
        family.publisher(),
        model,
        action
    ))
}

fn action(family: ModelFamily, stream: bool) -> &'static str {
    match family {
        ModelFamily::Claude if stream => "streamRawPredict",
        ModelFamily::Claude => "rawPredict",
        ModelFamily::Gemini if stream => "streamGenerateContent?alt=sse",
        ModelFamily::Gemini => "generateContent",
        ModelFamily::Embedding | ModelFamily::Imagen => "predict",
        ModelFamily::Veo => "predictLongRunning",
    }
}

/// Anthropic body to the Vertex `rawPredict` body.
pub fn claude_body(body: &ClaudeRequest) -> Result<Value> {
    let mut value = to_value(body)?;
    if let Some(obj) = value.as_object_mut() {
        obj.remove("model");
        obj.insert("anthropic_version".to_string(), Value::from(VERTEX_ANTHROPIC_VERSION));
    }
    Ok(value)
}

pub fn embedding_body(request: &GeneralRequest) -> Result<Value> {
    let input = request
        .input
        .as_ref()
        .ok_or_else(|| Error::invalid_request("embedding request needs `input`"))?;
    let instances: Vec<Value> = input.to_vec().into_iter().map(|t| json!({ "content": t })).collect();
    let mut body = json!({ "instances": instances });
    if let Some(d) = request.dimensions {
        body["parameters"] = json!({ "outputDimensionality": d });
    }
    Ok(body)
}

#[derive(Debug, Deserialize)]
struct EmbeddingReply {
    #[serde(default)]
    predictions: Vec<EmbeddingPrediction>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingPrediction {
    embeddings: PredictionEmbeddings,
}

#[derive(Debug, Deserialize)]
struct PredictionEmbeddings {
    #[serde(default)]
    values: Vec<f64>,
    #[serde(default)]
    statistics: Option<EmbeddingStatistics>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingStatistics {
    #[serde(default)]
    token_count: f64,
}

async fn embedding_handler(
    ctx: &mut RelayContext,
    resp: UpstreamResponse,
    meta: &Meta,
    out: &mut ResponseWriter<'_>,
) -> Result<Usage> {
    let body: EmbeddingReply = read_checked_json(ctx.cancellation(), resp, "vertexai").await?;
    let counted: f64 = body
        .predictions
        .iter()
        .filter_map(|p| p.embeddings.statistics.as_ref())
        .map(|s| s.token_count)
        .sum();
    let prompt = if counted > 0.0 { counted as u64 } else { meta.prompt_tokens };
    let usage = Usage::new(prompt, 0);
    let vectors = body.predictions.into_iter().map(|p| p.embeddings.values).collect();
    out.send_json(200, &EmbeddingResponse::new(meta.actual_model_name.clone(), vectors, usage.clone()))
        .await?;
    Ok(usage)
}

#[derive(Debug, Default)]
pub struct VertexAiAdaptor {
    meta: Meta,
}

impl VertexAiAdaptor {
    fn model<'a>(&'a self, requested: &'a str) -> &'a str {
        if self.meta.actual_model_name.is_empty() {
            requested
        } else {
            &self.meta.actual_model_name
        }
    }
}

#[async_trait]
impl Adaptor for VertexAiAdaptor {
    fn init(&mut self, meta: &Meta) {
        self.meta = meta.clone();
    }

    fn request_url(&self, meta: &Meta) -> Result<String> {
        let family = ModelFamily::of(&meta.actual_model_name);
        model_url(meta, &meta.actual_model_name, action(family, meta.is_stream))
    }

    fn setup_request_header(&self, headers: &mut HeaderMap, meta: &Meta) -> Result<()> {
        set_bearer(headers, &meta.api_key)
    }

    async fn convert_request(
        &self,
        ctx: &mut RelayContext,
        mode: Mode,
        request: &GeneralRequest,
    ) -> Result<Value> {
        let model = self.model(&request.model);
        match (mode, ModelFamily::of(model)) {
            (Mode::ChatCompletions | Mode::ClaudeMessages, ModelFamily::Claude) => {
                let body = anthropic::request::convert_request(ctx, request, model).await?;
                ctx.set_thinking_anchor(reply_anchor(ctx, request));
                claude_body(&body)
            }
            (Mode::ChatCompletions | Mode::ClaudeMessages, ModelFamily::Gemini) => {
                to_value(&gemini::model::convert_request(ctx, request).await?)
            }
            (Mode::Embeddings, ModelFamily::Embedding) => embedding_body(request),
            _ => Err(Error::mode_unsupported(model, self.channel_name(), mode)),
        }
    }

    async fn convert_claude_request(&self, ctx: &mut RelayContext, request: &ClaudeRequest) -> Result<Value> {
        let model = self.model(&request.model).to_string();
        if ModelFamily::of(&model) != ModelFamily::Claude {
            let lowered = crate::convert::claude_to_openai_request(request);
            ctx.claude_messages_conversion = true;
            ctx.original_claude_request = Some(request.clone());
            return self.convert_request(ctx, Mode::ChatCompletions, &lowered).await;
        }
        ctx.original_claude_request = Some(request.clone());
        claude_body(request)
    }

    async fn convert_image_request(&self, _ctx: &mut RelayContext, request: &ImageRequest) -> Result<Value> {
        let model = self.model(&request.model);
        if ModelFamily::of(model) != ModelFamily::Imagen {
            return Err(Error::mode_unsupported(model, self.channel_name(), Mode::ImagesGenerations));
        }
        Ok(imagen::request_body(request))
    }

    async fn convert_video_request(&self, ctx: &mut RelayContext, request: &VideoRequest) -> Result<Value> {
        let model = self.model(&request.model);
        if ModelFamily::of(model) != ModelFamily::Veo {
            return Err(Error::mode_unsupported(model, self.channel_name(), Mode::VideoGenerations));
        }
        ctx.video_seconds = Some(request.duration());
        Ok(veo::request_body(request))
    }

    async fn do_response(
        &self,
        ctx: &mut RelayContext,
        resp: UpstreamResponse,
        meta: &Meta,
        out: &mut ResponseWriter<'_>,
    ) -> Result<Usage> {
        match (meta.mode, ModelFamily::of(&meta.actual_model_name)) {
            (Mode::ImagesGenerations, _) => imagen::handler(ctx, resp, meta, out).await,
            (Mode::VideoGenerations, _) => veo::handler(ctx, resp, meta, out).await,
            (Mode::Embeddings, _) => embedding_handler(ctx, resp, meta, out).await,
            (_, ModelFamily::Claude) if meta.is_stream => anthropic::stream::stream_handler(ctx, resp, meta, out).await,
            (_, ModelFamily::Claude) => {
                let body: ClaudeResponse = read_checked_json(ctx.cancellation(), resp, "vertexai").await?;
                relay_message(ctx, body, meta, out).await
            }
            _ if meta.is_stream => gemini::stream_handler(ctx, resp, meta, out).await,
            _ => gemini::handler(ctx, resp, meta, out).await,
        }
    }

    fn default_model_pricing(&self) -> Arc<PricingMap> {
        pricing::table("vertexai")
    }

    fn channel_name(&self) -> &'static str {
        "vertexai"
    }
}
