//! Ollama 适配器：本地模型的原生 `/api/chat`（NDJSON 流）与 `/api/embed`。
//!
//! # Ollama
//!
//! | Mode | Path | Reply |
//! |------|------|-------|
//! | chat | `/api/chat` | one JSON object, or one per line when streaming |
//! | embeddings | `/api/embed` | `{"embeddings": [[...]]}` |
//!
//! Images must be base64 without a data-URL prefix; remote URLs are fetched
//! first. Sampling options move under `options`.

use super::common::{check_status, read_checked_json, require_base, set_bearer, to_value};
use super::openai::handler::finish_usage;
use super::Adaptor;
use crate::context::RelayContext;
use crate::meta::{Meta, Mode};
use crate::pricing::{self, PricingMap};
use crate::stream::{ChunkBuilder, LineReader, ReadOutcome, ResponseWriter};
use crate::transport::{http, UpstreamResponse};
use crate::types::{
    parse_data_url, ContentPart, EmbeddingResponse, GeneralRequest, Message, MessageContent, Role, TextResponse,
    Tool, Usage,
};
use crate::{Error, Result};
use async_trait::async_trait;
use reqwest::header::HeaderMap;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;

#[derive(Debug, Default, Serialize)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub options: Option<Options>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<Tool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub format: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub think: Option<bool>,
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<OllamaToolCall>,
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct OllamaToolCall {
    pub function: OllamaFunction,
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct OllamaFunction {
    pub name: String,
    #[serde(default)]
    pub arguments: Value,
}

#[derive(Debug, Default, Serialize)]
pub struct Options {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub num_predict: Option<u32>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub stop: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frequency_penalty: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub presence_penalty: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ChatResponse {
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub message: ChatMessage,
    #[serde(default)]
    pub done: bool,
    #[serde(default)]
    pub done_reason: Option<String>,
    #[serde(default)]
    pub prompt_eval_count: u64,
    #[serde(default)]
    pub eval_count: u64,
    #[serde(default)]
    pub error: Option<String>,
}

impl ChatResponse {
    fn usage(&self) -> Option<Usage> {
        (self.prompt_eval_count > 0 || self.eval_count > 0)
            .then(|| Usage::new(self.prompt_eval_count, self.eval_count))
    }

    fn finish_reason(&self) -> String {
        if !self.message.tool_calls.is_empty() {
            return "tool_calls".to_string();
        }
        match self.done_reason.as_deref() {
            Some("length") => "length".to_string(),
            _ => "stop".to_string(),
        }
    }
}

fn to_tools(calls: &[OllamaToolCall]) -> Vec<Tool> {
    calls
        .iter()
        .enumerate()
        .map(|(i, c)| {
            let mut t = Tool::call(format!("call_{}", uuid::Uuid::new_v4().simple()), &c.function.name, c.function.arguments.to_string());
            t.index = Some(i);
            t
        })
        .collect()
}

async fn convert_message(ctx: &RelayContext, msg: &Message) -> Result<ChatMessage> {
    let mut out = ChatMessage {
        role: msg.role.as_str().to_string(),
        ..Default::default()
    };
    for part in msg.parse_content() {
        match part {
            ContentPart::Text { text } => out.content.push_str(&text),
            ContentPart::ImageUrl { image_url } => match parse_data_url(&image_url.url) {
                Some((_, data)) => out.images.push(data),
                None => {
                    let (_, data) = http::fetch_image_base64(ctx.cancellation(), &image_url.url).await?;
                    out.images.push(data);
                }
            },
            _ => {}
        }
    }
    if msg.role == Role::Assistant {
        out.tool_calls = msg
            .tool_calls
            .iter()
            .flatten()
            .map(|t| OllamaToolCall {
                function: OllamaFunction {
                    name: t.function.name.clone(),
                    arguments: serde_json::from_str(t.arguments()).unwrap_or_else(|_| json!({})),
                },
            })
            .collect();
    }
    Ok(out)
}

pub async fn convert_request(ctx: &RelayContext, request: &GeneralRequest, model: &str) -> Result<ChatRequest> {
    let mut messages = Vec::with_capacity(request.messages.len());
    for msg in &request.messages {
        messages.push(convert_message(ctx, msg).await?);
    }
    let format = request.response_format.as_ref().and_then(|f| match f.kind.as_str() {
        "json_object" => Some(json!("json")),
        "json_schema" => f.json_schema.as_ref().and_then(|s| s.get("schema").cloned()),
        _ => None,
    });
    Ok(ChatRequest {
        model: model.to_string(),
        messages,
        stream: request.stream,
        options: Some(Options {
            temperature: request.temperature,
            top_p: request.top_p,
            top_k: request.top_k,
            seed: request.seed,
            num_predict: request.effective_max_tokens(),
            stop: request.stop.as_ref().map(|s| s.to_vec()).unwrap_or_default(),
            frequency_penalty: request.frequency_penalty,
            presence_penalty: request.presence_penalty,
        }),
        tools: request.tools.clone().unwrap_or_default(),
        format,
        think: request.thinking_enabled().then_some(true),
    })
}

fn to_text_response(resp: &ChatResponse, meta: &Meta, ctx: &RelayContext) -> TextResponse {
    let mut msg = Message::assistant(resp.message.content.clone());
    if let Some(thinking) = resp.message.thinking.clone().filter(|t| !t.is_empty()) {
        ctx.reasoning_format.apply(&mut msg, thinking);
    }
    if !resp.message.tool_calls.is_empty() {
        let mut tools = to_tools(&resp.message.tool_calls);
        tools.iter_mut().for_each(|t| t.index = None);
        msg.tool_calls = Some(tools);
    }
    let model = if resp.model.is_empty() { &meta.actual_model_name } else { &resp.model };
    TextResponse::new(model.clone(), msg, Some(resp.finish_reason()), resp.usage().unwrap_or_default())
}

pub async fn handler(
    ctx: &mut RelayContext,
    resp: UpstreamResponse,
    meta: &Meta,
    out: &mut ResponseWriter<'_>,
) -> Result<Usage> {
    let body: ChatResponse = read_checked_json(ctx.cancellation(), resp, "ollama").await?;
    if let Some(err) = body.error.as_deref() {
        return Err(Error::Upstream {
            status: 502,
            message: err.to_string(),
            provider_code: None,
        });
    }
    let mut text = to_text_response(&body, meta, ctx);
    text.usage = finish_usage(body.usage(), meta, &text.assembled_text());
    ctx.converted_response = Some(to_value(&text)?);
    out.send_completion(&text).await?;
    Ok(text.usage)
}

/// Relays an NDJSON stream as Chat Completions chunks.
pub async fn stream_handler(
    ctx: &mut RelayContext,
    resp: UpstreamResponse,
    meta: &Meta,
    out: &mut ResponseWriter<'_>,
) -> Result<Usage> {
    let resp = check_status(ctx.cancellation(), resp).await?;
    out.begin_stream();
    let builder = ChunkBuilder::new(meta.actual_model_name.clone(), ctx.reasoning_format);
    let mut reader = LineReader::from_response(resp);
    let mut produced = String::new();
    let mut reported: Option<Usage> = None;
    let mut finish: Option<String> = None;
    out.send_chunk(&builder.role()).await?;

    loop {
        let line = match reader.next_line(ctx.cancellation()).await {
            Ok(ReadOutcome::Line(line)) => line,
            Ok(ReadOutcome::Eof) => break,
            Ok(ReadOutcome::Cancelled) => return Ok(finish_usage(reported, meta, &produced)),
            Err(e) => {
                tracing::warn!(error = %e, "ollama stream read failed");
                out.send_error(&e).await?;
                return Ok(finish_usage(reported, meta, &produced));
            }
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let event: ChatResponse = match serde_json::from_str(line) {
            Ok(e) => e,
            Err(e) => {
                tracing::debug!(error = %e, line, "skipping undecodable ollama line");
                continue;
            }
        };
        if let Some(err) = event.error.as_deref() {
            let err = Error::Upstream {
                status: 502,
                message: err.to_string(),
                provider_code: None,
            };
            out.send_error(&err).await?;
            return Ok(finish_usage(reported, meta, &produced));
        }
        if let Some(thinking) = event.message.thinking.as_deref().filter(|t| !t.is_empty()) {
            produced.push_str(thinking);
            out.send_chunk(&builder.reasoning(thinking)).await?;
        }
        if !event.message.content.is_empty() {
            produced.push_str(&event.message.content);
            out.send_chunk(&builder.text(event.message.content.clone())).await?;
        }
        if !event.message.tool_calls.is_empty() {
            let tools = to_tools(&event.message.tool_calls);
            for t in &tools {
                produced.push_str(&t.function.name);
                produced.push_str(t.arguments());
            }
            out.send_chunk(&builder.tool_calls(tools)).await?;
        }
        if event.done {
            reported = event.usage();
            finish = Some(event.finish_reason());
            break;
        }
    }

    let usage = finish_usage(reported, meta, &produced);
    out.send_chunk(&builder.finish(finish.unwrap_or_else(|| "stop".to_string()))).await?;
    out.send_chunk(&builder.usage(usage.clone())).await?;
    out.send_done().await?;
    Ok(usage)
}

#[derive(Debug, Deserialize)]
struct EmbedReply {
    #[serde(default)]
    embeddings: Vec<Vec<f64>>,
    #[serde(default)]
    prompt_eval_count: u64,
}

pub async fn embedding_handler(
    ctx: &mut RelayContext,
    resp: UpstreamResponse,
    meta: &Meta,
    out: &mut ResponseWriter<'_>,
) -> Result<Usage> {
    let body: EmbedReply = read_checked_json(ctx.cancellation(), resp, "ollama").await?;
    let prompt = if body.prompt_eval_count > 0 { body.prompt_eval_count } else { meta.prompt_tokens };
    let usage = Usage::new(prompt, 0);
    out.send_json(200, &EmbeddingResponse::new(meta.actual_model_name.clone(), body.embeddings, usage.clone()))
        .await?;
    Ok(usage)
}

#[derive(Debug, Default)]
pub struct OllamaAdaptor {
    meta: Meta,
}

#[async_trait]
impl Adaptor for OllamaAdaptor {
    fn init(&mut self, meta: &Meta) {
        self.meta = meta.clone();
    }

    fn request_url(&self, meta: &Meta) -> Result<String> {
        let path = match meta.mode {
            Mode::Embeddings => "/api/embed",
            _ => "/api/chat",
        };
        Ok(format!("{}{}", require_base(meta)?, path))
    }

    fn setup_request_header(&self, headers: &mut HeaderMap, meta: &Meta) -> Result<()> {
        if meta.api_key.is_empty() {
            return Ok(());
        }
        set_bearer(headers, &meta.api_key)
    }

    async fn convert_request(
        &self,
        ctx: &mut RelayContext,
        mode: Mode,
        request: &GeneralRequest,
    ) -> Result<Value> {
        let model = if self.meta.actual_model_name.is_empty() {
            request.model.as_str()
        } else {
            self.meta.actual_model_name.as_str()
        };
        match mode {
            Mode::ChatCompletions | Mode::ClaudeMessages => to_value(&convert_request(ctx, request, model).await?),
            Mode::Embeddings => {
                let input = request
                    .input
                    .as_ref()
                    .ok_or_else(|| Error::invalid_request("embedding request needs `input`"))?;
                Ok(json!({ "model": model, "input": input.to_vec() }))
            }
            _ => Err(Error::mode_unsupported(model, self.channel_name(), mode)),
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
        pricing::table("ollama")
    }

    fn channel_name(&self) -> &'static str {
        "ollama"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::ChannelType;
    use crate::types::ImageUrl;
    use bytes::Bytes;

    #[tokio::test]
    async fn test_convert_moves_options_and_images() {
        let req = GeneralRequest {
            messages: vec![Message {
                role: Role::User,
                content: Some(MessageContent::Parts(vec![
                    ContentPart::Text { text: "what is this".into() },
                    ContentPart::ImageUrl {
                        image_url: ImageUrl {
                            url: "data:image/png;base64,iVBOR".into(),
                            detail: None,
                        },
                    },
                ])),
                ..Default::default()
            }],
            temperature: Some(0.3),
            max_tokens: Some(64),
            ..Default::default()
        };
        let body = to_value(&convert_request(&RelayContext::default(), &req, "llava").await.unwrap()).unwrap();
        assert_eq!(body["messages"][0]["images"][0], "iVBOR");
        assert_eq!(body["options"]["num_predict"], 64);
        assert_eq!(body["options"]["temperature"], 0.3);
    }

    #[tokio::test]
    async fn test_ndjson_stream() {
        let lines = concat!(
            "{\"model\":\"llama3\",\"message\":{\"role\":\"assistant\",\"content\":\"Hel\"},\"done\":false}\n",
            "{\"model\":\"llama3\",\"message\":{\"role\":\"assistant\",\"content\":\"lo\"},\"done\":false}\n",
            "{\"model\":\"llama3\",\"message\":{\"role\":\"assistant\",\"content\":\"\"},\"done\":true,\"done_reason\":\"stop\",\"prompt_eval_count\":9,\"eval_count\":2}\n",
        );
        let resp = UpstreamResponse::from_chunks(200, "application/x-ndjson", vec![Bytes::from_static(lines.as_bytes())]);
        let meta = Meta::new(ChannelType::Ollama, "llama3").with_stream(true);
        let mut sink = Vec::new();
        let mut out = ResponseWriter::openai(&mut sink);
        let usage = stream_handler(&mut RelayContext::default(), resp, &meta, &mut out).await.unwrap();
        assert_eq!((usage.prompt_tokens, usage.completion_tokens, usage.total_tokens), (9, 2, 11));
        drop(out);
        let text = String::from_utf8(sink).unwrap();
        assert!(text.contains("\"content\":\"Hel\""));
        assert!(text.contains("\"finish_reason\":\"stop\""));
        assert!(text.trim_end().ends_with("data: [DONE]"));
    }

    #[test]
    fn test_urls() {
        let meta = Meta::new(ChannelType::Ollama, "nomic-embed-text").with_mode(Mode::Embeddings);
        assert_eq!(
            OllamaAdaptor::default().request_url(&meta).unwrap(),
            "http://localhost:11434/api/embed"
        );
    }
}
