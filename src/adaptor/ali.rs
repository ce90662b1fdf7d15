//! 阿里云 DashScope 适配器：通义千问文本/多模态生成、文本向量与通义万相文生图。
//!
//! # DashScope
//!
//! | Mode | Path |
//! |------|------|
//! | chat | `/api/v1/services/aigc/text-generation/generation` |
//! | chat, `*-vl-*` models | `/api/v1/services/aigc/multimodal-generation/generation` |
//! | embeddings | `/api/v1/services/embeddings/text-embedding/text-embedding` |
//! | images (Wanx) | `/api/v1/services/aigc/text2image/image-synthesis`, then `/api/v1/tasks/{id}` |
//!
//! Bodies are `{model, input: {...}, parameters: {...}}`. Streams are SSE
//! with `X-DashScope-SSE: enable` and `incremental_output`, so every event
//! is a delta. A `-internet` model suffix turns on `enable_search`. Image
//! synthesis is asynchronous: the first reply carries a task id that is
//! polled until it succeeds or fails.

use super::common::{check_status, read_checked_json, require_base, set_bearer, set_header, to_value};
use super::openai::handler::finish_usage;
use super::Adaptor;
use crate::context::RelayContext;
use crate::meta::{Meta, Mode};
use crate::pricing::{self, PricingMap};
use crate::stream::{sse_data, ChunkBuilder, LineReader, ReadOutcome, ResponseWriter};
use crate::transport::{http, UpstreamResponse};
use crate::types::response::unix_now;
use crate::types::{
    ContentPart, EmbeddingResponse, GeneralRequest, ImageData, ImageRequest, ImageResponse, Message,
    TextResponse, TextResponseChoice, Tool, Usage,
};
use crate::{Error, Result};
use async_trait::async_trait;
use reqwest::header::HeaderMap;
use reqwest::Method;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};

pub const INTERNET_SUFFIX: &str = "-internet";
/// DashScope rejects `top_p >= 1`.
const MAX_TOP_P: f64 = 0.9999;
const TASK_POLL_INTERVAL: Duration = Duration::from_secs(2);
const TASK_MAX_WAIT: Duration = Duration::from_secs(5 * 60);

fn is_multimodal(model: &str) -> bool {
    model.contains("-vl") || model.contains("-audio") || model.starts_with("qvq")
}

#[derive(Debug, Serialize)]
pub struct ChatRequest {
    pub model: String,
    pub input: ChatInput,
    pub parameters: Parameters,
}

#[derive(Debug, Serialize)]
pub struct ChatInput {
    pub messages: Vec<Value>,
}

#[derive(Debug, Default, Serialize)]
pub struct Parameters {
    pub result_format: &'static str,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub incremental_output: bool,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub enable_search: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<Tool>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enable_thinking: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thinking_budget: Option<u32>,
}

/// Multimodal content: `[{"text": ...}, {"image": url}]`.
fn multimodal_content(msg: &Message) -> Value {
    let parts: Vec<Value> = msg
        .parse_content()
        .into_iter()
        .filter_map(|p| match p {
            ContentPart::Text { text } => Some(json!({ "text": text })),
            ContentPart::ImageUrl { image_url } => Some(json!({ "image": image_url.url })),
            ContentPart::InputAudio { input_audio } => {
                Some(json!({ "audio": format!("data:audio/{};base64,{}", input_audio.format, input_audio.data) }))
            }
            ContentPart::Thinking { .. } => None,
        })
        .collect();
    Value::Array(parts)
}

fn convert_message(msg: &Message, multimodal: bool) -> Value {
    let content = if multimodal {
        multimodal_content(msg)
    } else {
        Value::String(msg.string_content())
    };
    let mut out = json!({ "role": msg.role.as_str(), "content": content });
    if let Some(calls) = msg.tool_calls.as_ref().filter(|c| !c.is_empty()) {
        out["tool_calls"] = json!(calls);
    }
    if let Some(id) = &msg.tool_call_id {
        out["tool_call_id"] = json!(id);
    }
    if let Some(name) = &msg.name {
        out["name"] = json!(name);
    }
    out
}

pub fn convert_request(request: &GeneralRequest, model: &str) -> ChatRequest {
    let (model, enable_search) = match model.strip_suffix(INTERNET_SUFFIX) {
        Some(base) => (base, true),
        None => (model, false),
    };
    let multimodal = is_multimodal(model);
    let thinking = request.thinking.as_ref().filter(|_| request.thinking_enabled());
    ChatRequest {
        model: model.to_string(),
        input: ChatInput {
            messages: request.messages.iter().map(|m| convert_message(m, multimodal)).collect(),
        },
        parameters: Parameters {
            result_format: "message",
            incremental_output: request.stream,
            enable_search,
            temperature: request.temperature,
            top_p: request.top_p.map(|p| p.min(MAX_TOP_P)),
            top_k: request.top_k,
            max_tokens: request.effective_max_tokens(),
            seed: request.seed,
            stop: request.stop.as_ref().map(|s| s.to_vec()),
            tools: request.tools.clone().filter(|t| !t.is_empty()),
            enable_thinking: thinking.map(|_| true),
            thinking_budget: thinking.and_then(|t| t.budget_tokens),
        },
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct ChatResponse {
    #[serde(default)]
    pub output: Output,
    #[serde(default)]
    pub usage: AliUsage,
    #[serde(default)]
    pub request_id: String,
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct Output {
    #[serde(default)]
    pub choices: Vec<Choice>,
}

#[derive(Debug, Default, Deserialize)]
pub struct Choice {
    #[serde(default)]
    pub message: AliMessage,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct AliMessage {
    #[serde(default)]
    pub content: Value,
    #[serde(default)]
    pub reasoning_content: Option<String>,
    #[serde(default)]
    pub tool_calls: Option<Vec<Tool>>,
}

impl AliMessage {
    /// Text of a string or `[{"text": ...}]` content.
    fn text(&self) -> String {
        match &self.content {
            Value::String(s) => s.clone(),
            Value::Array(parts) => parts
                .iter()
                .filter_map(|p| p.get("text").and_then(Value::as_str))
                .collect(),
            _ => String::new(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct AliUsage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub total_tokens: u64,
}

impl AliUsage {
    fn to_usage(&self) -> Option<Usage> {
        match (self.input_tokens, self.output_tokens, self.total_tokens) {
            (0, 0, 0) => None,
            // embeddings report only a total
            (0, 0, total) => Some(Usage::new(total, 0)),
            (input, output, _) => Some(Usage::new(input, output)),
        }
    }
}

/// DashScope reports some failures as a 200 with a top-level `code`.
fn check_code(resp: &ChatResponse) -> Result<()> {
    match resp.code.as_deref().filter(|c| !c.is_empty()) {
        Some(code) => Err(Error::Upstream {
            status: 502,
            message: resp.message.clone().unwrap_or_else(|| code.to_string()),
            provider_code: Some(code.to_string()),
        }),
        None => Ok(()),
    }
}

/// `null`, `"null"` and an empty reason mean "not finished yet".
fn finish_reason(reason: Option<&str>) -> Option<String> {
    reason
        .filter(|r| !r.is_empty() && *r != "null")
        .map(|r| r.to_string())
}

pub fn to_text_response(resp: &ChatResponse, meta: &Meta, ctx: &RelayContext) -> TextResponse {
    let mut out = TextResponse::new(meta.actual_model_name.clone(), Message::assistant(""), None, Usage::default());
    out.choices = resp
        .output
        .choices
        .iter()
        .enumerate()
        .map(|(i, c)| {
            let mut msg = Message::assistant(c.message.text());
            if let Some(r) = c.message.reasoning_content.clone().filter(|r| !r.is_empty()) {
                ctx.reasoning_format.apply(&mut msg, r);
            }
            msg.tool_calls = c.message.tool_calls.clone().filter(|t| !t.is_empty());
            TextResponseChoice {
                index: i as u32,
                message: msg,
                finish_reason: finish_reason(c.finish_reason.as_deref()).or(Some("stop".to_string())),
            }
        })
        .collect();
    if !resp.request_id.is_empty() {
        out.id = resp.request_id.clone();
    }
    out
}

pub async fn handler(
    ctx: &mut RelayContext,
    resp: UpstreamResponse,
    meta: &Meta,
    out: &mut ResponseWriter<'_>,
) -> Result<Usage> {
    let body: ChatResponse = read_checked_json(ctx.cancellation(), resp, "ali").await?;
    check_code(&body)?;
    let mut text = to_text_response(&body, meta, ctx);
    text.usage = finish_usage(body.usage.to_usage(), meta, &text.assembled_text());
    ctx.converted_response = Some(to_value(&text)?);
    out.send_completion(&text).await?;
    Ok(text.usage)
}

pub async fn stream_handler(
    ctx: &mut RelayContext,
    resp: UpstreamResponse,
    meta: &Meta,
    out: &mut ResponseWriter<'_>,
) -> Result<Usage> {
    let resp = check_status(ctx.cancellation(), resp).await?;
    out.begin_stream();
    let mut builder = ChunkBuilder::new(meta.actual_model_name.clone(), ctx.reasoning_format);
    let mut reader = LineReader::from_response(resp);
    let mut produced = String::new();
    let mut reported: Option<Usage> = None;
    let mut finish: Option<String> = None;
    let mut started = false;

    loop {
        let line = match reader.next_line(ctx.cancellation()).await {
            Ok(ReadOutcome::Line(line)) => line,
            Ok(ReadOutcome::Eof) => break,
            Ok(ReadOutcome::Cancelled) => return Ok(finish_usage(reported, meta, &produced)),
            Err(e) => {
                tracing::warn!(error = %e, "dashscope stream read failed");
                out.send_error(&e).await?;
                return Ok(finish_usage(reported, meta, &produced));
            }
        };
        let Some(data) = sse_data(&line).filter(|d| !d.is_empty()) else {
            continue;
        };
        let event: ChatResponse = match serde_json::from_str(data) {
            Ok(e) => e,
            Err(e) => {
                tracing::debug!(error = %e, line = %data, "skipping undecodable dashscope event");
                continue;
            }
        };
        if let Err(e) = check_code(&event) {
            out.send_error(&e).await?;
            return Ok(finish_usage(reported, meta, &produced));
        }
        if !started {
            builder.set_id(event.request_id.clone());
            out.send_chunk(&builder.role()).await?;
            started = true;
        }
        if let Some(u) = event.usage.to_usage() {
            reported = Some(u);
        }
        for choice in &event.output.choices {
            if let Some(r) = choice.message.reasoning_content.as_deref().filter(|r| !r.is_empty()) {
                produced.push_str(r);
                out.send_chunk(&builder.reasoning(r)).await?;
            }
            let text = choice.message.text();
            if !text.is_empty() {
                produced.push_str(&text);
                out.send_chunk(&builder.text(text)).await?;
            }
            if let Some(calls) = choice.message.tool_calls.clone().filter(|c| !c.is_empty()) {
                for c in &calls {
                    produced.push_str(&c.function.name);
                    produced.push_str(c.arguments());
                }
                out.send_chunk(&builder.tool_calls(calls)).await?;
            }
            if let Some(reason) = finish_reason(choice.finish_reason.as_deref()) {
                finish = Some(reason);
            }
        }
    }

    let usage = finish_usage(reported, meta, &produced);
    out.send_chunk(&builder.finish(finish.unwrap_or_else(|| "stop".to_string()))).await?;
    out.send_chunk(&builder.usage(usage.clone())).await?;
    out.send_done().await?;
    Ok(usage)
}

pub fn embedding_body(request: &GeneralRequest, model: &str) -> Result<Value> {
    let input = request
        .input
        .as_ref()
        .ok_or_else(|| Error::invalid_request("embedding request needs `input`"))?;
    let mut parameters = json!({ "text_type": "query" });
    if let Some(d) = request.dimensions {
        parameters["dimension"] = json!(d);
    }
    Ok(json!({
        "model": model,
        "input": { "texts": input.to_vec() },
        "parameters": parameters,
    }))
}

#[derive(Debug, Deserialize)]
struct EmbeddingReply {
    #[serde(default)]
    output: EmbeddingOutput,
    #[serde(default)]
    usage: AliUsage,
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct EmbeddingOutput {
    #[serde(default)]
    embeddings: Vec<AliEmbedding>,
}

#[derive(Debug, Deserialize)]
struct AliEmbedding {
    #[serde(default)]
    text_index: usize,
    #[serde(default)]
    embedding: Vec<f64>,
}

pub async fn embedding_handler(
    ctx: &mut RelayContext,
    resp: UpstreamResponse,
    meta: &Meta,
    out: &mut ResponseWriter<'_>,
) -> Result<Usage> {
    let mut body: EmbeddingReply = read_checked_json(ctx.cancellation(), resp, "ali").await?;
    if let Some(code) = body.code.as_deref().filter(|c| !c.is_empty()) {
        return Err(Error::Upstream {
            status: 502,
            message: body.message.unwrap_or_else(|| code.to_string()),
            provider_code: Some(code.to_string()),
        });
    }
    body.output.embeddings.sort_by_key(|e| e.text_index);
    let usage = body.usage.to_usage().unwrap_or_else(|| Usage::new(meta.prompt_tokens, 0));
    let vectors = body.output.embeddings.into_iter().map(|e| e.embedding).collect();
    out.send_json(200, &EmbeddingResponse::new(meta.actual_model_name.clone(), vectors, usage.clone()))
        .await?;
    Ok(usage)
}

pub fn image_body(request: &ImageRequest, model: &str) -> Value {
    let mut input = json!({ "prompt": request.prompt });
    if let Some(negative) = request.negative_prompt.as_deref().filter(|n| !n.is_empty()) {
        input["negative_prompt"] = json!(negative);
    }
    let mut parameters = json!({ "n": request.count() });
    if let Some(size) = request.size.as_deref() {
        parameters["size"] = json!(size.replace('x', "*"));
    }
    if let Some(style) = request.style.as_deref() {
        parameters["style"] = json!(format!("<{}>", style.trim_matches(&['<', '>'][..])));
    }
    json!({ "model": model, "input": input, "parameters": parameters })
}

#[derive(Debug, Default, Deserialize)]
pub struct TaskReply {
    #[serde(default)]
    pub output: TaskOutput,
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct TaskOutput {
    #[serde(default)]
    pub task_id: String,
    #[serde(default)]
    pub task_status: String,
    #[serde(default)]
    pub results: Vec<TaskResult>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub code: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct TaskResult {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub b64_image: Option<String>,
    #[serde(default)]
    pub code: Option<String>,
}

fn task_error(output: &TaskOutput) -> Error {
    Error::Upstream {
        status: 502,
        message: output
            .message
            .clone()
            .unwrap_or_else(|| format!("image task ended as {}", output.task_status)),
        provider_code: output.code.clone(),
    }
}

/// Polls `/api/v1/tasks/{id}` until the task leaves the queue. `None` when cancelled.
async fn wait_for_task(ctx: &RelayContext, meta: &Meta, task_id: &str) -> Result<Option<TaskOutput>> {
    let url = format!("{}/api/v1/tasks/{}", require_base(meta)?, task_id);
    let started = Instant::now();
    loop {
        let mut headers = HeaderMap::new();
        set_bearer(&mut headers, &meta.api_key)?;
        let resp = match http::send(ctx.cancellation(), Method::GET, &url, headers, None).await {
            Ok(r) => r,
            Err(_) if ctx.is_cancelled() => return Ok(None),
            Err(e) => return Err(e),
        };
        let reply: TaskReply = read_checked_json(ctx.cancellation(), resp, "ali.task").await?;
        match reply.output.task_status.as_str() {
            "SUCCEEDED" => return Ok(Some(reply.output)),
            "FAILED" | "CANCELED" | "UNKNOWN" => return Err(task_error(&reply.output)),
            _ => {}
        }
        if started.elapsed() >= TASK_MAX_WAIT {
            return Err(Error::Upstream {
                status: 504,
                message: format!("image task {} did not finish in time", task_id),
                provider_code: None,
            });
        }
        tokio::select! {
            _ = ctx.cancellation().cancelled() => return Ok(None),
            _ = tokio::time::sleep(TASK_POLL_INTERVAL) => {}
        }
    }
}

pub async fn image_handler(
    ctx: &mut RelayContext,
    resp: UpstreamResponse,
    meta: &Meta,
    out: &mut ResponseWriter<'_>,
) -> Result<Usage> {
    let submitted: TaskReply = read_checked_json(ctx.cancellation(), resp, "ali.image").await?;
    if let Some(code) = submitted.code.as_deref().filter(|c| !c.is_empty()) {
        return Err(Error::Upstream {
            status: 502,
            message: submitted.message.clone().unwrap_or_else(|| code.to_string()),
            provider_code: Some(code.to_string()),
        });
    }
    let task_id = submitted.output.task_id.clone();
    tracing::debug!(task_id = %task_id, "wanx task submitted");
    let Some(output) = wait_for_task(ctx, meta, &task_id).await? else {
        return Ok(Usage::default());
    };
    let data: Vec<ImageData> = output
        .results
        .into_iter()
        .filter(|r| r.code.is_none())
        .map(|r| ImageData {
            url: r.url,
            b64_json: r.b64_image,
            ..Default::default()
        })
        .collect();
    let usage = Usage::new(data.len() as u64, 0);
    out.send_json(200, &ImageResponse { created: unix_now(), data }).await?;
    Ok(usage)
}

#[derive(Debug, Default)]
pub struct AliAdaptor {
    meta: Meta,
}

impl AliAdaptor {
    fn model<'a>(&'a self, requested: &'a str) -> &'a str {
        if self.meta.actual_model_name.is_empty() {
            requested
        } else {
            &self.meta.actual_model_name
        }
    }
}

#[async_trait]
impl Adaptor for AliAdaptor {
    fn init(&mut self, meta: &Meta) {
        self.meta = meta.clone();
    }

    fn request_url(&self, meta: &Meta) -> Result<String> {
        let path = match meta.mode {
            Mode::Embeddings => "/api/v1/services/embeddings/text-embedding/text-embedding",
            Mode::ImagesGenerations => "/api/v1/services/aigc/text2image/image-synthesis",
            _ if is_multimodal(&meta.actual_model_name) => "/api/v1/services/aigc/multimodal-generation/generation",
            _ => "/api/v1/services/aigc/text-generation/generation",
        };
        Ok(format!("{}{}", require_base(meta)?, path))
    }

    fn setup_request_header(&self, headers: &mut HeaderMap, meta: &Meta) -> Result<()> {
        set_bearer(headers, &meta.api_key)?;
        if meta.is_stream {
            set_header(headers, "x-dashscope-sse", "enable")?;
        }
        if meta.mode == Mode::ImagesGenerations {
            set_header(headers, "x-dashscope-async", "enable")?;
        }
        if let Some(plugin) = meta.config.plugin.as_deref().filter(|p| !p.is_empty()) {
            set_header(headers, "x-dashscope-plugin", plugin)?;
        }
        Ok(())
    }

    async fn convert_request(
        &self,
        _ctx: &mut RelayContext,
        mode: Mode,
        request: &GeneralRequest,
    ) -> Result<Value> {
        let model = self.model(&request.model);
        match mode {
            Mode::ChatCompletions | Mode::ClaudeMessages => to_value(&convert_request(request, model)),
            Mode::Embeddings => embedding_body(request, model),
            _ => Err(Error::mode_unsupported(model, self.channel_name(), mode)),
        }
    }

    async fn convert_image_request(&self, _ctx: &mut RelayContext, request: &ImageRequest) -> Result<Value> {
        Ok(image_body(request, self.model(&request.model)))
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
            Mode::ImagesGenerations => image_handler(ctx, resp, meta, out).await,
            _ if meta.is_stream => stream_handler(ctx, resp, meta, out).await,
            _ => handler(ctx, resp, meta, out).await,
        }
    }

    fn default_model_pricing(&self) -> Arc<PricingMap> {
        pricing::table("ali")
    }

    fn channel_name(&self) -> &'static str {
        "ali"
    }
}
