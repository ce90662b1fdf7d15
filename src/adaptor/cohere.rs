//! Cohere 适配器：对话、向量与重排序。
//!
//! | Mode | Path | Notes |
//! |------|------|-------|
//! | chat | `/v1/chat` | last user turn is `message`, earlier turns `chat_history`, system turns `preamble` |
//! | embeddings | `/v1/embed` | `input_type: search_document` |
//! | rerank | `/v1/rerank` | billed per search unit |
//!
//! Streams are newline-delimited JSON events (`stream-start`,
//! `text-generation`, `tool-calls-generation`, `stream-end`). A model name
//! ending in `-internet` enables the `web-search` connector.

use super::common::{check_status, read_checked_json, require_base, set_bearer, to_value};
use super::openai::handler::finish_usage;
use super::Adaptor;
use crate::context::RelayContext;
use crate::meta::{Meta, Mode};
use crate::pricing::{self, PricingMap};
use crate::stream::{ChunkBuilder, LineReader, ReadOutcome, ResponseWriter};
use crate::transport::UpstreamResponse;
use crate::types::{
    EmbeddingResponse, GeneralRequest, Message, RerankResponse, RerankResult, Role, TextResponse, Tool, Usage,
};
use crate::{Error, Result};
use async_trait::async_trait;
use reqwest::header::HeaderMap;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;

const INTERNET_SUFFIX: &str = "-internet";

#[derive(Debug, Serialize)]
pub struct ChatRequest {
    pub message: String,
    pub model: String,
    pub stream: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub chat_history: Vec<HistoryTurn>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preamble: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub connectors: Vec<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub k: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_sequences: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frequency_penalty: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub presence_penalty: Option<f64>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<Value>,
}

#[derive(Debug, Serialize)]
pub struct HistoryTurn {
    pub role: &'static str,
    pub message: String,
}

/// Cohere v1 tools take `parameter_definitions` instead of a JSON schema.
fn convert_tool(tool: &Tool) -> Value {
    let schema = tool.function.parameters.clone().unwrap_or_else(|| json!({}));
    let required: Vec<&str> = schema
        .get("required")
        .and_then(Value::as_array)
        .map(|r| r.iter().filter_map(Value::as_str).collect())
        .unwrap_or_default();
    let mut definitions = serde_json::Map::new();
    if let Some(props) = schema.get("properties").and_then(Value::as_object) {
        for (name, prop) in props {
            definitions.insert(
                name.clone(),
                json!({
                    "type": prop.get("type").and_then(Value::as_str).unwrap_or("str"),
                    "description": prop.get("description").and_then(Value::as_str).unwrap_or(""),
                    "required": required.contains(&name.as_str()),
                }),
            );
        }
    }
    json!({
        "name": tool.function.name,
        "description": tool.function.description.clone().unwrap_or_default(),
        "parameter_definitions": definitions,
    })
}

pub fn convert_request(request: &GeneralRequest, model: &str) -> ChatRequest {
    let (model, web_search) = match model.strip_suffix(INTERNET_SUFFIX) {
        Some(base) => (base, true),
        None => (model, false),
    };
    let mut preamble: Vec<String> = Vec::new();
    let mut history: Vec<HistoryTurn> = Vec::new();
    let last_user = request.messages.iter().rposition(|m| m.role == Role::User);
    let mut message = String::new();
    for (i, msg) in request.messages.iter().enumerate() {
        let text = msg.string_content();
        match msg.role {
            Role::System => preamble.push(text),
            Role::User if Some(i) == last_user => message = text,
            Role::User | Role::Tool => history.push(HistoryTurn { role: "USER", message: text }),
            Role::Assistant => history.push(HistoryTurn { role: "CHATBOT", message: text }),
        }
    }
    ChatRequest {
        message,
        model: model.to_string(),
        stream: request.stream,
        chat_history: history,
        preamble: (!preamble.is_empty()).then(|| preamble.join("\n")),
        connectors: if web_search { vec![json!({ "id": "web-search" })] } else { Vec::new() },
        temperature: request.temperature,
        p: request.top_p,
        k: request.top_k,
        max_tokens: request.effective_max_tokens(),
        seed: request.seed,
        stop_sequences: request.stop.as_ref().map(|s| s.to_vec()),
        frequency_penalty: request.frequency_penalty,
        presence_penalty: request.presence_penalty,
        tools: request.tools.iter().flatten().map(convert_tool).collect(),
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct ChatResponse {
    #[serde(default)]
    pub response_id: String,
    #[serde(default)]
    pub generation_id: String,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub finish_reason: Option<String>,
    #[serde(default)]
    pub tool_calls: Vec<CohereToolCall>,
    #[serde(default)]
    pub meta: CohereMeta,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CohereToolCall {
    pub name: String,
    #[serde(default)]
    pub parameters: Value,
}

#[derive(Debug, Default, Deserialize)]
pub struct CohereMeta {
    #[serde(default)]
    pub billed_units: BilledUnits,
    #[serde(default)]
    pub tokens: Option<BilledUnits>,
}

#[derive(Debug, Default, Deserialize)]
pub struct BilledUnits {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub search_units: u64,
}

impl CohereMeta {
    fn usage(&self) -> Option<Usage> {
        let units = self.tokens.as_ref().unwrap_or(&self.billed_units);
        (units.input_tokens + units.output_tokens > 0).then(|| Usage::new(units.input_tokens, units.output_tokens))
    }
}

fn finish_reason(reason: Option<&str>) -> String {
    match reason {
        Some("MAX_TOKENS") => "length",
        Some("ERROR_TOXIC") => "content_filter",
        Some("ERROR") | Some("ERROR_LIMIT") => "error",
        _ => "stop",
    }
    .to_string()
}

fn to_tools(calls: &[CohereToolCall], id: &str) -> Vec<Tool> {
    calls
        .iter()
        .enumerate()
        .map(|(i, c)| {
            let mut t = Tool::call(format!("call_{}_{}", id, i), c.name.clone(), c.parameters.to_string());
            t.index = Some(i);
            t
        })
        .collect()
}

pub async fn handler(
    ctx: &mut RelayContext,
    resp: UpstreamResponse,
    meta: &Meta,
    out: &mut ResponseWriter<'_>,
) -> Result<Usage> {
    let body: ChatResponse = read_checked_json(ctx.cancellation(), resp, "cohere").await?;
    let mut message = Message::assistant(body.text.clone());
    let mut finish = finish_reason(body.finish_reason.as_deref());
    if !body.tool_calls.is_empty() {
        message.tool_calls = Some(to_tools(&body.tool_calls, &body.generation_id));
        finish = "tool_calls".to_string();
    }
    let mut text = TextResponse::new(meta.actual_model_name.clone(), message, Some(finish), Usage::default());
    if !body.response_id.is_empty() {
        text.id = body.response_id.clone();
    }
    text.usage = finish_usage(body.meta.usage(), meta, &text.assembled_text());
    ctx.converted_response = Some(to_value(&text)?);
    out.send_completion(&text).await?;
    Ok(text.usage)
}

#[derive(Debug, Deserialize)]
struct StreamEvent {
    event_type: String,
    #[serde(default)]
    generation_id: Option<String>,
    #[serde(default)]
    text: String,
    #[serde(default)]
    tool_calls: Vec<CohereToolCall>,
    #[serde(default)]
    finish_reason: Option<String>,
    #[serde(default)]
    response: Option<ChatResponse>,
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
    let mut finish = "stop".to_string();
    let mut generation = String::new();
    out.send_chunk(&builder.role()).await?;

    loop {
        let line = match reader.next_line(ctx.cancellation()).await {
            Ok(ReadOutcome::Line(line)) => line,
            Ok(ReadOutcome::Eof) => break,
            Ok(ReadOutcome::Cancelled) => return Ok(finish_usage(reported, meta, &produced)),
            Err(e) => {
                tracing::warn!(error = %e, "cohere stream read failed");
                out.send_error(&e).await?;
                return Ok(finish_usage(reported, meta, &produced));
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        let event: StreamEvent = match serde_json::from_str(&line) {
            Ok(e) => e,
            Err(e) => {
                tracing::debug!(error = %e, "skipping undecodable cohere event");
                continue;
            }
        };
        match event.event_type.as_str() {
            "stream-start" => {
                if let Some(id) = event.generation_id {
                    builder.set_id(id.clone());
                    generation = id;
                }
            }
            "text-generation" if !event.text.is_empty() => {
                produced.push_str(&event.text);
                out.send_chunk(&builder.text(event.text)).await?;
            }
            "tool-calls-generation" if !event.tool_calls.is_empty() => {
                let tools = to_tools(&event.tool_calls, &generation);
                for t in &tools {
                    produced.push_str(t.arguments());
                }
                finish = "tool_calls".to_string();
                out.send_chunk(&builder.tool_calls(tools)).await?;
            }
            "stream-end" => {
                if finish != "tool_calls" {
                    finish = finish_reason(event.finish_reason.as_deref());
                }
                reported = event.response.as_ref().and_then(|r| r.meta.usage());
                break;
            }
            _ => {}
        }
    }

    let usage = finish_usage(reported, meta, &produced);
    out.send_chunk(&builder.finish(finish)).await?;
    out.send_chunk(&builder.usage(usage.clone())).await?;
    out.send_done().await?;
    Ok(usage)
}

#[derive(Debug, Deserialize)]
struct EmbedReply {
    #[serde(default)]
    embeddings: Vec<Vec<f64>>,
    #[serde(default)]
    meta: CohereMeta,
}

pub async fn embedding_handler(
    ctx: &mut RelayContext,
    resp: UpstreamResponse,
    meta: &Meta,
    out: &mut ResponseWriter<'_>,
) -> Result<Usage> {
    let body: EmbedReply = read_checked_json(ctx.cancellation(), resp, "cohere.embed").await?;
    let usage = body.meta.usage().unwrap_or_else(|| Usage::new(meta.prompt_tokens, 0));
    out.send_json(200, &EmbeddingResponse::new(meta.actual_model_name.clone(), body.embeddings, usage.clone()))
        .await?;
    Ok(usage)
}

#[derive(Debug, Deserialize)]
struct RerankReply {
    #[serde(default)]
    id: String,
    #[serde(default)]
    results: Vec<RerankResult>,
    #[serde(default)]
    meta: CohereMeta,
}

/// One search unit is billed as one prompt token.
pub async fn rerank_handler(
    ctx: &mut RelayContext,
    resp: UpstreamResponse,
    meta: &Meta,
    out: &mut ResponseWriter<'_>,
) -> Result<Usage> {
    let body: RerankReply = read_checked_json(ctx.cancellation(), resp, "cohere.rerank").await?;
    let units = body.meta.billed_units.search_units;
    let usage = if units > 0 {
        Usage::new(units, 0)
    } else {
        Usage::new(meta.prompt_tokens, 0)
    };
    let reply = RerankResponse {
        id: body.id,
        model: meta.actual_model_name.clone(),
        results: body.results,
        usage: usage.clone(),
    };
    out.send_json(200, &reply).await?;
    Ok(usage)
}

#[derive(Debug, Default)]
pub struct CohereAdaptor {
    meta: Meta,
}

#[async_trait]
impl Adaptor for CohereAdaptor {
    fn init(&mut self, meta: &Meta) {
        self.meta = meta.clone();
    }

    fn request_url(&self, meta: &Meta) -> Result<String> {
        let path = match meta.mode {
            Mode::Embeddings => "/v1/embed",
            Mode::Rerank => "/v1/rerank",
            _ => "/v1/chat",
        };
        Ok(format!("{}{}", require_base(meta)?, path))
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
        let model = &self.meta.actual_model_name;
        match mode {
            Mode::ChatCompletions | Mode::ClaudeMessages => to_value(&convert_request(request, model)),
            Mode::Embeddings => {
                let input = request
                    .input
                    .as_ref()
                    .ok_or_else(|| Error::invalid_request("embedding request needs `input`"))?;
                Ok(json!({
                    "model": model,
                    "texts": input.to_vec(),
                    "input_type": "search_document",
                }))
            }
            Mode::Rerank => {
                let query = request
                    .query
                    .as_deref()
                    .ok_or_else(|| Error::invalid_request("rerank request needs `query`"))?;
                let documents = request
                    .documents
                    .as_ref()
                    .filter(|d| !d.is_empty())
                    .ok_or_else(|| Error::invalid_request("rerank request needs `documents`"))?;
                let mut body = json!({ "model": model, "query": query, "documents": documents });
                if let Some(n) = request.top_n {
                    body["top_n"] = json!(n);
                }
                Ok(body)
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
            Mode::Rerank => rerank_handler(ctx, resp, meta, out).await,
            _ if meta.is_stream => stream_handler(ctx, resp, meta, out).await,
            _ => handler(ctx, resp, meta, out).await,
        }
    }

    fn default_model_pricing(&self) -> Arc<PricingMap> {
        pricing::table("cohere")
    }

    fn channel_name(&self) -> &'static str {
        "cohere"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::ChannelType;
    use bytes::Bytes;

    #[test]
    fn test_history_split() {
        let req = GeneralRequest {
            messages: vec![
                Message::system("be kind"),
                Message::user("first"),
                Message::assistant("reply"),
                Message::user("second"),
            ],
            ..Default::default()
        };
        let body = to_value(&convert_request(&req, "command-r-internet")).unwrap();
        assert_eq!(body["model"], "command-r");
        assert_eq!(body["message"], "second");
        assert_eq!(body["preamble"], "be kind");
        assert_eq!(body["chat_history"][1]["role"], "CHATBOT");
        assert_eq!(body["connectors"][0]["id"], "web-search");
    }

    #[test]
    fn test_tool_parameter_definitions() {
        let tool: Tool = serde_json::from_value(json!({
            "type": "function",
            "function": {
                "name": "weather",
                "parameters": {"type": "object", "properties": {"city": {"type": "string"}}, "required": ["city"]}
            }
        }))
        .unwrap();
        let v = convert_tool(&tool);
        assert_eq!(v["parameter_definitions"]["city"]["required"], true);
    }

    #[tokio::test]
    async fn test_ndjson_stream() {
        let lines = concat!(
            "{\"is_finished\":false,\"event_type\":\"stream-start\",\"generation_id\":\"g1\"}\n",
            "{\"is_finished\":false,\"event_type\":\"text-generation\",\"text\":\"Hi\"}\n",
            "{\"is_finished\":true,\"event_type\":\"stream-end\",\"finish_reason\":\"MAX_TOKENS\",\"response\":{\"text\":\"Hi\",\"meta\":{\"billed_units\":{\"input_tokens\":4,\"output_tokens\":1}}}}\n",
        );
        let resp = UpstreamResponse::from_chunks(200, "application/stream+json", vec![Bytes::from(lines)]);
        let meta = Meta::new(ChannelType::Cohere, "command-r").with_stream(true);
        let mut sink = Vec::new();
        let mut out = ResponseWriter::openai(&mut sink);
        let usage = stream_handler(&mut RelayContext::default(), resp, &meta, &mut out).await.unwrap();
        assert_eq!((usage.prompt_tokens, usage.completion_tokens), (4, 1));
        drop(out);
        let text = String::from_utf8(sink).unwrap();
        assert!(text.contains("\"finish_reason\":\"length\""));
    }

    #[tokio::test]
    async fn test_rerank_bills_search_units() {
        let resp = UpstreamResponse::from_bytes(
            200,
            "application/json",
            r#"{"id":"r1","results":[{"index":1,"relevance_score":0.9},{"index":0,"relevance_score":0.1}],"meta":{"billed_units":{"search_units":1}}}"#,
        );
        let meta = Meta::new(ChannelType::Cohere, "rerank-v3.5").with_mode(Mode::Rerank);
        let mut sink = Vec::new();
        let mut out = ResponseWriter::openai(&mut sink);
        let usage = rerank_handler(&mut RelayContext::default(), resp, &meta, &mut out).await.unwrap();
        assert_eq!(usage.prompt_tokens, 1);
        drop(out);
        let body: Value = serde_json::from_slice(&sink).unwrap();
        assert_eq!(body["results"][0]["index"], 1);
        assert_eq!(body["model"], "rerank-v3.5");
    }
}
