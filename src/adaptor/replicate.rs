//! Replicate 适配器：语言模型与图像模型的预测任务。
//!
//! Every call creates a prediction at `/v1/models/{owner}/{name}/predictions`
//! with `Prefer: wait`, so short jobs come back finished. Unfinished ones
//! are polled at `urls.get` until they succeed, fail or are cancelled.
//! Streams read the prediction's `urls.stream` SSE feed (`output`, `error`
//! and `done` events).
//!
//! Language models get the chat flattened into `prompt` and
//! `system_prompt`; their output is a list of string fragments. Image
//! models return one URL or a list of URLs.

use super::common::{check_status, read_checked_json, require_base, set_bearer, set_header};
use super::openai::handler::finish_usage;
use super::Adaptor;
use crate::context::RelayContext;
use crate::meta::{Meta, Mode};
use crate::pricing::{self, PricingMap};
use crate::stream::{sse_data, sse_event, ChunkBuilder, LineReader, ReadOutcome, ResponseWriter};
use crate::transport::{http, UpstreamResponse};
use crate::types::response::unix_now;
use crate::types::{GeneralRequest, ImageData, ImageRequest, ImageResponse, Message, Role, TextResponse, Usage};
use crate::{Error, Result};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, ACCEPT};
use reqwest::Method;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};

const POLL_INTERVAL: Duration = Duration::from_secs(1);
const MAX_WAIT: Duration = Duration::from_secs(10 * 60);

pub fn chat_input(request: &GeneralRequest) -> Value {
    let mut system: Vec<String> = Vec::new();
    let mut prompt = String::new();
    for msg in &request.messages {
        let text = msg.string_content();
        match msg.role {
            Role::System => system.push(text),
            Role::Assistant => prompt.push_str(&format!("assistant: {}\n", text)),
            Role::User | Role::Tool => prompt.push_str(&format!("user: {}\n", text)),
        }
    }
    // a single user turn goes in unadorned
    if request.messages.iter().filter(|m| m.role != Role::System).count() == 1 {
        prompt = request.last_user_text();
    }
    let mut input = json!({ "prompt": prompt.trim_end() });
    if !system.is_empty() {
        input["system_prompt"] = json!(system.join("\n"));
    }
    if let Some(max) = request.effective_max_tokens() {
        input["max_tokens"] = json!(max);
    }
    if let Some(t) = request.temperature {
        input["temperature"] = json!(t);
    }
    if let Some(p) = request.top_p {
        input["top_p"] = json!(p);
    }
    if let Some(k) = request.top_k {
        input["top_k"] = json!(k);
    }
    if let Some(stop) = &request.stop {
        input["stop_sequences"] = json!(stop.to_vec().join(","));
    }
    input
}

pub fn image_input(request: &ImageRequest) -> Value {
    let mut input = json!({ "prompt": request.prompt, "num_outputs": request.count() });
    if let Some(ratio) = request.aspect_ratio() {
        input["aspect_ratio"] = json!(ratio);
    }
    if let Some(negative) = request.negative_prompt.as_deref().filter(|n| !n.is_empty()) {
        input["negative_prompt"] = json!(negative);
    }
    input
}

#[derive(Debug, Default, Deserialize)]
pub struct Prediction {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub output: Value,
    #[serde(default)]
    pub error: Option<Value>,
    #[serde(default)]
    pub urls: PredictionUrls,
    #[serde(default)]
    pub metrics: PredictionMetrics,
}

#[derive(Debug, Default, Deserialize)]
pub struct PredictionUrls {
    #[serde(default)]
    pub get: Option<String>,
    #[serde(default)]
    pub stream: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct PredictionMetrics {
    #[serde(default)]
    pub input_token_count: Option<u64>,
    #[serde(default)]
    pub output_token_count: Option<u64>,
}

impl Prediction {
    fn is_terminal(&self) -> bool {
        matches!(self.status.as_str(), "succeeded" | "failed" | "canceled")
    }

    fn failure(&self) -> Option<Error> {
        (self.status != "succeeded").then(|| Error::Upstream {
            status: 502,
            message: match &self.error {
                Some(Value::String(s)) => s.clone(),
                Some(other) => other.to_string(),
                None => format!("prediction {} ended as {}", self.id, self.status),
            },
            provider_code: Some(self.status.clone()),
        })
    }

    fn usage(&self) -> Option<Usage> {
        match (self.metrics.input_token_count, self.metrics.output_token_count) {
            (None, None) => None,
            (i, o) => Some(Usage::new(i.unwrap_or(0), o.unwrap_or(0))),
        }
    }

    /// Output as text: fragments joined, or a bare string.
    fn text(&self) -> String {
        match &self.output {
            Value::Array(parts) => parts.iter().filter_map(Value::as_str).collect(),
            Value::String(s) => s.clone(),
            _ => String::new(),
        }
    }

    fn urls(&self) -> Vec<String> {
        match &self.output {
            Value::Array(parts) => parts.iter().filter_map(Value::as_str).map(String::from).collect(),
            Value::String(s) => vec![s.clone()],
            _ => Vec::new(),
        }
    }
}

fn auth_headers(meta: &Meta) -> Result<HeaderMap> {
    let mut headers = HeaderMap::new();
    set_bearer(&mut headers, &meta.api_key)?;
    Ok(headers)
}

/// Polls until the prediction is terminal. `None` when cancelled.
pub async fn wait_for(ctx: &RelayContext, meta: &Meta, mut prediction: Prediction) -> Result<Option<Prediction>> {
    let started = Instant::now();
    while !prediction.is_terminal() {
        if started.elapsed() >= MAX_WAIT {
            return Err(Error::Upstream {
                status: 504,
                message: format!("prediction {} did not finish in time", prediction.id),
                provider_code: None,
            });
        }
        tokio::select! {
            _ = ctx.cancellation().cancelled() => return Ok(None),
            _ = tokio::time::sleep(POLL_INTERVAL) => {}
        }
        let url = match prediction.urls.get.clone() {
            Some(u) => u,
            None => format!("{}/v1/predictions/{}", require_base(meta)?, prediction.id),
        };
        let resp = match http::send(ctx.cancellation(), Method::GET, &url, auth_headers(meta)?, None).await {
            Ok(r) => r,
            Err(_) if ctx.is_cancelled() => return Ok(None),
            Err(e) => return Err(e),
        };
        prediction = read_checked_json(ctx.cancellation(), resp, "replicate.poll").await?;
    }
    Ok(Some(prediction))
}

pub async fn handler(
    ctx: &mut RelayContext,
    resp: UpstreamResponse,
    meta: &Meta,
    out: &mut ResponseWriter<'_>,
) -> Result<Usage> {
    let created: Prediction = read_checked_json(ctx.cancellation(), resp, "replicate").await?;
    let Some(done) = wait_for(ctx, meta, created).await? else {
        return Ok(Usage::default());
    };
    if let Some(err) = done.failure() {
        return Err(err);
    }
    let mut text = TextResponse::new(
        meta.actual_model_name.clone(),
        Message::assistant(done.text()),
        Some("stop".to_string()),
        Usage::default(),
    );
    text.id = done.id.clone();
    text.usage = finish_usage(done.usage(), meta, &text.assembled_text());
    ctx.converted_response = Some(serde_json::to_value(&text)?);
    out.send_completion(&text).await?;
    Ok(text.usage)
}

pub async fn stream_handler(
    ctx: &mut RelayContext,
    resp: UpstreamResponse,
    meta: &Meta,
    out: &mut ResponseWriter<'_>,
) -> Result<Usage> {
    let created: Prediction = read_checked_json(ctx.cancellation(), resp, "replicate").await?;
    let Some(stream_url) = created.urls.stream.clone() else {
        return Err(Error::Upstream {
            status: 400,
            message: format!("{} does not support streaming", meta.actual_model_name),
            provider_code: None,
        });
    };
    let mut headers = auth_headers(meta)?;
    set_header(&mut headers, "cache-control", "no-store")?;
    headers.insert(ACCEPT, reqwest::header::HeaderValue::from_static("text/event-stream"));
    let feed = http::send(ctx.cancellation(), Method::GET, &stream_url, headers, None).await?;
    let feed = check_status(ctx.cancellation(), feed).await?;

    out.begin_stream();
    let mut builder = ChunkBuilder::new(meta.actual_model_name.clone(), ctx.reasoning_format);
    builder.set_id(created.id.clone());
    out.send_chunk(&builder.role()).await?;
    let mut reader = LineReader::from_response(feed);
    let mut produced = String::new();
    let mut event = String::new();
    loop {
        let line = match reader.next_line(ctx.cancellation()).await {
            Ok(ReadOutcome::Line(line)) => line,
            Ok(ReadOutcome::Eof) => break,
            Ok(ReadOutcome::Cancelled) => return Ok(finish_usage(None, meta, &produced)),
            Err(e) => {
                out.send_error(&e).await?;
                return Ok(finish_usage(None, meta, &produced));
            }
        };
        if let Some(name) = sse_event(&line) {
            event = name.to_string();
            continue;
        }
        // SSE keeps leading spaces of the payload; only the field separator goes
        let Some(data) = line.strip_prefix("data:").map(|d| d.strip_prefix(' ').unwrap_or(d)) else {
            continue;
        };
        match event.as_str() {
            "output" if !data.is_empty() => {
                produced.push_str(data);
                out.send_chunk(&builder.text(data)).await?;
            }
            "error" => {
                let err = Error::Upstream {
                    status: 502,
                    message: sse_data(&line).unwrap_or_default().to_string(),
                    provider_code: None,
                };
                out.send_error(&err).await?;
                return Ok(finish_usage(None, meta, &produced));
            }
            "done" => break,
            _ => {}
        }
    }
    let usage = finish_usage(None, meta, &produced);
    out.send_chunk(&builder.finish("stop")).await?;
    out.send_chunk(&builder.usage(usage.clone())).await?;
    out.send_done().await?;
    Ok(usage)
}

pub async fn image_handler(
    ctx: &mut RelayContext,
    resp: UpstreamResponse,
    meta: &Meta,
    out: &mut ResponseWriter<'_>,
) -> Result<Usage> {
    let created: Prediction = read_checked_json(ctx.cancellation(), resp, "replicate.image").await?;
    let Some(done) = wait_for(ctx, meta, created).await? else {
        return Ok(Usage::default());
    };
    if let Some(err) = done.failure() {
        return Err(err);
    }
    let data: Vec<ImageData> = done
        .urls()
        .into_iter()
        .map(|url| ImageData {
            url: Some(url),
            ..Default::default()
        })
        .collect();
    let usage = Usage::new(data.len() as u64, 0);
    out.send_json(200, &ImageResponse { created: unix_now(), data }).await?;
    Ok(usage)
}

#[derive(Debug, Default)]
pub struct ReplicateAdaptor {
    meta: Meta,
}

#[async_trait]
impl Adaptor for ReplicateAdaptor {
    fn init(&mut self, meta: &Meta) {
        self.meta = meta.clone();
    }

    fn request_url(&self, meta: &Meta) -> Result<String> {
        Ok(format!("{}/v1/models/{}/predictions", require_base(meta)?, meta.actual_model_name))
    }

    fn setup_request_header(&self, headers: &mut HeaderMap, meta: &Meta) -> Result<()> {
        set_bearer(headers, &meta.api_key)?;
        set_header(headers, "prefer", "wait")
    }

    async fn convert_request(
        &self,
        _ctx: &mut RelayContext,
        mode: Mode,
        request: &GeneralRequest,
    ) -> Result<Value> {
        match mode {
            Mode::ChatCompletions | Mode::ClaudeMessages => {
                Ok(json!({ "input": chat_input(request), "stream": request.stream }))
            }
            _ => Err(Error::mode_unsupported(&request.model, self.channel_name(), mode)),
        }
    }

    async fn convert_image_request(&self, _ctx: &mut RelayContext, request: &ImageRequest) -> Result<Value> {
        Ok(json!({ "input": image_input(request) }))
    }

    async fn do_response(
        &self,
        ctx: &mut RelayContext,
        resp: UpstreamResponse,
        meta: &Meta,
        out: &mut ResponseWriter<'_>,
    ) -> Result<Usage> {
        match meta.mode {
            Mode::ImagesGenerations => image_handler(ctx, resp, meta, out).await,
            _ if meta.is_stream => stream_handler(ctx, resp, meta, out).await,
            _ => handler(ctx, resp, meta, out).await,
        }
    }

    fn default_model_pricing(&self) -> Arc<PricingMap> {
        pricing::table("replicate")
    }

    fn channel_name(&self) -> &'static str {
        "replicate"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::ChannelType;

    #[test]
    fn test_chat_input() {
        let req = GeneralRequest {
            messages: vec![Message::system("sys"), Message::user("hello")],
            max_tokens: Some(64),
            ..Default::default()
        };
        let input = chat_input(&req);
        assert_eq!(input["prompt"], "hello");
        assert_eq!(input["system_prompt"], "sys");
        assert_eq!(input["max_tokens"], 64);
    }

    #[tokio::test]
    async fn test_finished_prediction() {
        let resp = UpstreamResponse::from_bytes(
            201,
            "application/json",
            r#"{"id":"p1","status":"succeeded","output":["Hel","lo"],"metrics":{"input_token_count":3,"output_token_count":2}}"#,
        );
        let meta = Meta::new(ChannelType::Replicate, "meta/meta-llama-3-8b-instruct");
        let mut ctx = RelayContext::default();
        let mut sink = Vec::new();
        let mut out = ResponseWriter::openai(&mut sink);
        let usage = handler(&mut ctx, resp, &meta, &mut out).await.unwrap();
        assert_eq!(usage.total_tokens, 5);
        assert_eq!(ctx.converted_response.unwrap()["choices"][0]["message"]["content"], "Hello");
    }

    #[tokio::test]
    async fn test_image_prediction_is_polled() {
        let mut server = mockito::Server::new_async().await;
        let poll = server
            .mock("GET", "/v1/predictions/p2")
            .with_status(200)
            .with_body(r#"{"id":"p2","status":"succeeded","output":["https://replicate.delivery/a.webp"]}"#)
            .create_async()
            .await;
        let meta = Meta::new(ChannelType::Replicate, "black-forest-labs/flux-schnell")
            .with_base_url(server.url())
            .with_mode(Mode::ImagesGenerations);
        let created = format!(
            r#"{{"id":"p2","status":"processing","urls":{{"get":"{}/v1/predictions/p2"}}}}"#,
            server.url()
        );
        let resp = UpstreamResponse::from_bytes(201, "application/json", created);
        let mut sink = Vec::new();
        let mut out = ResponseWriter::openai(&mut sink);
        let usage = image_handler(&mut RelayContext::default(), resp, &meta, &mut out).await.unwrap();
        assert_eq!(usage.prompt_tokens, 1);
        poll.assert_async().await;
    }

    #[tokio::test]
    async fn test_failed_prediction() {
        let resp = UpstreamResponse::from_bytes(
            201,
            "application/json",
            r#"{"id":"p3","status":"failed","error":"NSFW content detected"}"#,
        );
        let meta = Meta::new(ChannelType::Replicate, "black-forest-labs/flux-dev");
        let mut sink = Vec::new();
        let mut out = ResponseWriter::openai(&mut sink);
        match image_handler(&mut RelayContext::default(), resp, &meta, &mut out).await.unwrap_err() {
            Error::Upstream { message, .. } => assert_eq!(message, "NSFW content detected"),
            other => panic!("unexpected {:?}", other),
        }
    }
}
