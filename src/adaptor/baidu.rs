//! 百度千帆（文心一言）适配器。
//!
//! The API key is `client_id|client_secret`. It is exchanged for an OAuth
//! access token at `/oauth/2.0/token`; tokens are cached per key until a
//! minute before they expire. A key without `|` is used as the access token
//! itself.
//!
//! | Mode | Path |
//! |------|------|
//! | chat | `/rpc/2.0/ai_custom/v1/wenxinworkshop/chat/{endpoint}` |
//! | embeddings | `/rpc/2.0/ai_custom/v1/wenxinworkshop/embeddings/{endpoint}` |
//!
//! Qianfan has no `system` role; system messages move to the `system` field.
//! Failures come back as 200 with `error_code`/`error_msg`.

use super::common::{key_part, read_checked_json, require_base, setup_common_headers, check_status, to_value};
use super::openai::handler::finish_usage;
use super::Adaptor;
use crate::context::RelayContext;
use crate::meta::{Meta, Mode};
use crate::pricing::{self, PricingMap};
use crate::stream::{sse_data, ChunkBuilder, LineReader, ReadOutcome, ResponseWriter};
use crate::transport::{http, UpstreamResponse};
use crate::types::{
    EmbeddingResponse, GeneralRequest, Message, Role, TextResponse, Tool, Usage,
};
use crate::{Error, ErrorContext, Result};
use async_trait::async_trait;
use lru::LruCache;
use once_cell::sync::Lazy;
use reqwest::header::HeaderMap;
use reqwest::Method;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

const TOKEN_CACHE_SIZE: usize = 256;
/// Tokens are refreshed this long before Baidu says they expire.
const TOKEN_REFRESH_MARGIN: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
struct CachedToken {
    token: String,
    expires_at: Instant,
}

static TOKENS: Lazy<Mutex<LruCache<String, CachedToken>>> = Lazy::new(|| {
    Mutex::new(LruCache::new(
        NonZeroUsize::new(TOKEN_CACHE_SIZE).unwrap_or(NonZeroUsize::MIN),
    ))
});

#[derive(Debug, Deserialize)]
struct TokenReply {
    #[serde(default)]
    access_token: String,
    #[serde(default)]
    expires_in: u64,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    error_description: Option<String>,
}

fn cached_token(key: &str) -> Option<String> {
    let mut cache = TOKENS.lock().unwrap_or_else(PoisonError::into_inner);
    match cache.get(key) {
        Some(t) if t.expires_at > Instant::now() => Some(t.token.clone()),
        Some(_) => {
            cache.pop(key);
            None
        }
        None => None,
    }
}

/// Access token for the channel's key, from cache or a fresh exchange.
pub async fn access_token(ctx: &RelayContext, meta: &Meta) -> Result<String> {
    if !meta.api_key.contains('|') {
        return Ok(meta.api_key.clone());
    }
    if let Some(token) = cached_token(&meta.api_key) {
        return Ok(token);
    }
    let client_id = key_part(meta, 0, "client id")?;
    let client_secret = key_part(meta, 1, "client secret")?;
    let mut url = url::Url::parse(&format!("{}/oauth/2.0/token", require_base(meta)?)).map_err(|e| {
        Error::config_missing(e.to_string(), ErrorContext::new().with_field_path("base_url"))
    })?;
    url.query_pairs_mut()
        .append_pair("grant_type", "client_credentials")
        .append_pair("client_id", client_id)
        .append_pair("client_secret", client_secret);

    let resp = http::send(ctx.cancellation(), Method::POST, url.as_str(), HeaderMap::new(), None).await?;
    let reply: TokenReply = read_checked_json(ctx.cancellation(), resp, "baidu.oauth").await?;
    if reply.access_token.is_empty() {
        return Err(Error::Upstream {
            status: 401,
            message: reply
                .error_description
                .unwrap_or_else(|| "baidu returned no access token".to_string()),
            provider_code: reply.error,
        });
    }
    let ttl = Duration::from_secs(reply.expires_in).saturating_sub(TOKEN_REFRESH_MARGIN);
    tracing::debug!(expires_in = reply.expires_in, "baidu access token refreshed");
    TOKENS.lock().unwrap_or_else(PoisonError::into_inner).put(
        meta.api_key.clone(),
        CachedToken {
            token: reply.access_token.clone(),
            expires_at: Instant::now() + ttl,
        },
    );
    Ok(reply.access_token)
}

/// Qianfan endpoint name of a model. Unknown models are used verbatim,
/// lower-cased, which matches custom deployments.
pub fn endpoint(model: &str) -> String {
    let known = match model {
        "ERNIE-4.0-8K" => "completions_pro",
        "ERNIE-4.0-Turbo-8K" => "ernie-4.0-turbo-8k",
        "ERNIE-3.5-8K" => "completions",
        "ERNIE-3.5-128K" => "ernie-3.5-128k",
        "ERNIE-Speed-8K" => "ernie_speed",
        "ERNIE-Speed-128K" => "ernie-speed-128k",
        "ERNIE-Lite-8K" => "ernie-lite-8k",
        "ERNIE-Tiny-8K" => "ernie-tiny-8k",
        "ERNIE-Character-8K" => "ernie-char-8k",
        "ERNIE-Functions-8K" => "ernie-func-8k",
        "Embedding-V1" => "embedding-v1",
        "bge-large-zh" => "bge_large_zh",
        "bge-large-en" => "bge_large_en",
        "tao-8k" => "tao_8k",
        _ => return model.to_ascii_lowercase(),
    };
    known.to_string()
}

#[derive(Debug, Serialize)]
pub struct ChatRequest {
    pub messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    /// Qianfan's frequency penalty, 1.0 to 2.0.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub penalty_score: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_output_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub functions: Option<Vec<Value>>,
    pub stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ChatMessage {
    pub role: &'static str,
    pub content: String,
}

pub fn convert_request(request: &GeneralRequest) -> ChatRequest {
    let mut system: Vec<String> = Vec::new();
    let mut messages = Vec::with_capacity(request.messages.len());
    for msg in &request.messages {
        match msg.role {
            Role::System => system.push(msg.string_content()),
            // Qianfan takes tool output as a user turn
            Role::Tool => messages.push(ChatMessage { role: "user", content: msg.string_content() }),
            _ => messages.push(ChatMessage {
                role: msg.role.as_str(),
                content: msg.string_content(),
            }),
        }
    }
    let functions = request.tools.as_ref().filter(|t| !t.is_empty()).map(|tools| {
        tools
            .iter()
            .map(|t| {
                json!({
                    "name": t.function.name,
                    "description": t.function.description.clone().unwrap_or_default(),
                    "parameters": t.function.parameters.clone().unwrap_or_else(|| json!({})),
                })
            })
            .collect()
    });
    ChatRequest {
        messages,
        system: (!system.is_empty()).then(|| system.join("\n")),
        temperature: request.temperature.map(|t| t.clamp(0.0001, 1.0)),
        top_p: request.top_p,
        penalty_score: request.frequency_penalty.map(|p| (p + 1.0).clamp(1.0, 2.0)),
        max_output_tokens: request.effective_max_tokens(),
        stop: request.stop.as_ref().map(|s| s.to_vec()),
        functions,
        stream: request.stream,
        user_id: request.user.clone(),
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct ChatResponse {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub result: String,
    #[serde(default)]
    pub is_end: bool,
    #[serde(default)]
    pub finish_reason: Option<String>,
    #[serde(default)]
    pub function_call: Option<FunctionCall>,
    #[serde(default)]
    pub usage: Option<Usage>,
    #[serde(default)]
    pub error_code: i64,
    #[serde(default)]
    pub error_msg: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    #[serde(default)]
    pub arguments: String,
}

impl ChatResponse {
    fn tool_calls(&self) -> Option<Vec<Tool>> {
        self.function_call
            .as_ref()
            .map(|f| vec![Tool::call(format!("call_{}", self.id), f.name.clone(), f.arguments.clone())])
    }

    fn finish(&self) -> String {
        if self.function_call.is_some() {
            return "tool_calls".to_string();
        }
        match self.finish_reason.as_deref() {
            Some("length") => "length".to_string(),
            Some("content_filter") => "content_filter".to_string(),
            _ => "stop".to_string(),
        }
    }
}

fn stream_error(body: &ChatResponse) -> Error {
    Error::Upstream {
        status: 502,
        message: body.error_msg.clone(),
        provider_code: Some(body.error_code.to_string()),
    }
}

pub async fn handler(
    ctx: &mut RelayContext,
    resp: UpstreamResponse,
    meta: &Meta,
    out: &mut ResponseWriter<'_>,
) -> Result<Usage> {
    let body: ChatResponse = read_checked_json(ctx.cancellation(), resp, "baidu").await?;
    let mut message = Message::assistant(body.result.clone());
    message.tool_calls = body.tool_calls();
    let mut text = TextResponse::new(meta.actual_model_name.clone(), message, Some(body.finish()), Usage::default());
    if !body.id.is_empty() {
        text.id = body.id.clone();
    }
    text.usage = finish_usage(body.usage, meta, &text.assembled_text());
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
    let mut finish = "stop".to_string();
    let mut started = false;

    loop {
        let line = match reader.next_line(ctx.cancellation()).await {
            Ok(ReadOutcome::Line(line)) => line,
            Ok(ReadOutcome::Eof) => break,
            Ok(ReadOutcome::Cancelled) => return Ok(finish_usage(reported, meta, &produced)),
            Err(e) => {
                tracing::warn!(error = %e, "qianfan stream read failed");
                out.send_error(&e).await?;
                return Ok(finish_usage(reported, meta, &produced));
            }
        };
        // errors arrive as a bare JSON line instead of an SSE event
        let data = match sse_data(&line) {
            Some(d) => d,
            None if line.starts_with('{') => line.as_str(),
            None => continue,
        };
        let event: ChatResponse = match serde_json::from_str(data) {
            Ok(e) => e,
            Err(e) => {
                tracing::debug!(error = %e, "skipping undecodable qianfan event");
                continue;
            }
        };
        if event.error_code != 0 {
            out.send_error(&stream_error(&event)).await?;
            return Ok(finish_usage(reported, meta, &produced));
        }
        if !started {
            builder.set_id(event.id.clone());
            out.send_chunk(&builder.role()).await?;
            started = true;
        }
        if event.usage.is_some() {
            reported = event.usage.clone();
        }
        if !event.result.is_empty() {
            produced.push_str(&event.result);
            out.send_chunk(&builder.text(event.result.clone())).await?;
        }
        if let Some(calls) = event.tool_calls() {
            for c in &calls {
                produced.push_str(c.arguments());
            }
            out.send_chunk(&builder.tool_calls(calls)).await?;
        }
        if event.is_end {
            finish = event.finish();
            break;
        }
    }

    let usage = finish_usage(reported, meta, &produced);
    out.send_chunk(&builder.finish(finish)).await?;
    out.send_chunk(&builder.usage(usage.clone())).await?;
    out.send_done().await?;
    Ok(usage)
}

#[derive(Debug, Deserialize)]
struct EmbeddingReply {
    #[serde(default)]
    data: Vec<EmbeddingItem>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingItem {
    #[serde(default)]
    index: usize,
    #[serde(default)]
    embedding: Vec<f64>,
}

pub async fn embedding_handler(
    ctx: &mut RelayContext,
    resp: UpstreamResponse,
    meta: &Meta,
    out: &mut ResponseWriter<'_>,
) -> Result<Usage> {
    let mut body: EmbeddingReply = read_checked_json(ctx.cancellation(), resp, "baidu.embeddings").await?;
    body.data.sort_by_key(|d| d.index);
    let usage = body
        .usage
        .map(Usage::finalize)
        .unwrap_or_else(|| Usage::new(meta.prompt_tokens, 0));
    let vectors = body.data.into_iter().map(|d| d.embedding).collect();
    out.send_json(200, &EmbeddingResponse::new(meta.actual_model_name.clone(), vectors, usage.clone()))
        .await?;
    Ok(usage)
}

#[derive(Debug, Default)]
pub struct BaiduAdaptor {
    meta: Meta,
}

#[async_trait]
impl Adaptor for BaiduAdaptor {
    fn init(&mut self, meta: &Meta) {
        self.meta = meta.clone();
    }

    fn request_url(&self, meta: &Meta) -> Result<String> {
        let kind = match meta.mode {
            Mode::Embeddings => "embeddings",
            _ => "chat",
        };
        Ok(format!(
            "{}/rpc/2.0/ai_custom/v1/wenxinworkshop/{}/{}",
            require_base(meta)?,
            kind,
            endpoint(&meta.actual_model_name)
        ))
    }

    fn setup_request_header(&self, _headers: &mut HeaderMap, _meta: &Meta) -> Result<()> {
        Ok(())
    }

    async fn convert_request(
        &self,
        _ctx: &mut RelayContext,
        mode: Mode,
        request: &GeneralRequest,
    ) -> Result<Value> {
        match mode {
            Mode::ChatCompletions | Mode::ClaudeMessages => to_value(&convert_request(request)),
            Mode::Embeddings => {
                let input = request
                    .input
                    .as_ref()
                    .ok_or_else(|| Error::invalid_request("embedding request needs `input`"))?;
                Ok(json!({ "input": input.to_vec() }))
            }
            _ => Err(Error::mode_unsupported(&request.model, self.channel_name(), mode)),
        }
    }

    /// The access token goes into the query string.
    async fn do_request(&self, ctx: &RelayContext, meta: &Meta, body: Value) -> Result<UpstreamResponse> {
        let token = access_token(ctx, meta).await?;
        let mut url = url::Url::parse(&self.request_url(meta)?).map_err(|e| {
            Error::config_missing(e.to_string(), ErrorContext::new().with_field_path("base_url"))
        })?;
        url.query_pairs_mut().append_pair("access_token", &token);
        let mut headers = HeaderMap::new();
        setup_common_headers(&mut headers, meta);
        tracing::debug!(model = %meta.actual_model_name, stream = meta.is_stream, "forwarding request to qianfan");
        http::post_json(ctx.cancellation(), url.as_str(), headers, &body).await
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
        pricing::table("baidu")
    }

    fn channel_name(&self) -> &'static str {
        "baidu"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::ChannelType;
    use bytes::Bytes;

    #[test]
    fn test_system_moves_out_of_messages() {
        let req = GeneralRequest {
            messages: vec![Message::system("be brief"), Message::user("hi")],
            temperature: Some(0.0),
            ..Default::default()
        };
        let body = to_value(&convert_request(&req)).unwrap();
        assert_eq!(body["system"], "be brief");
        assert_eq!(body["messages"].as_array().unwrap().len(), 1);
        assert_eq!(body["temperature"], 0.0001);
    }

    #[test]
    fn test_endpoints() {
        assert_eq!(endpoint("ERNIE-4.0-8K"), "completions_pro");
        assert_eq!(endpoint("my-Custom"), "my-custom");
        let meta = Meta::new(ChannelType::Baidu, "Embedding-V1").with_mode(Mode::Embeddings);
        assert!(BaiduAdaptor::default()
            .request_url(&meta)
            .unwrap()
            .ends_with("/wenxinworkshop/embeddings/embedding-v1"));
    }

    #[tokio::test]
    async fn test_token_exchange_is_cached() {
        let mut server = mockito::Server::new_async().await;
        let oauth = server
            .mock("POST", "/oauth/2.0/token")
            .match_query(mockito::Matcher::AllOf(vec![
                mockito::Matcher::UrlEncoded("client_id".into(), "cached-id".into()),
                mockito::Matcher::UrlEncoded("client_secret".into(), "secret".into()),
            ]))
            .with_status(200)
            .with_body(r#"{"access_token":"24.abc","expires_in":2592000}"#)
            .expect(1)
            .create_async()
            .await;
        let meta = Meta::new(ChannelType::Baidu, "ERNIE-3.5-8K")
            .with_base_url(server.url())
            .with_api_key("cached-id|secret");
        let ctx = RelayContext::default();
        assert_eq!(access_token(&ctx, &meta).await.unwrap(), "24.abc");
        assert_eq!(access_token(&ctx, &meta).await.unwrap(), "24.abc");
        oauth.assert_async().await;
    }

    #[tokio::test]
    async fn test_error_code_in_ok_body() {
        let resp = UpstreamResponse::from_bytes(
            200,
            "application/json",
            r#"{"error_code":110,"error_msg":"Access token invalid or no longer valid"}"#,
        );
        let meta = Meta::new(ChannelType::Baidu, "ERNIE-3.5-8K");
        let mut sink = Vec::new();
        let mut out = ResponseWriter::openai(&mut sink);
        let err = handler(&mut RelayContext::default(), resp, &meta, &mut out).await.unwrap_err();
        assert_eq!(err.status(), 502);
    }

    #[tokio::test]
    async fn test_stream() {
        let sse = concat!(
            "data: {\"id\":\"as-1\",\"result\":\"你好\",\"is_end\":false}\n\n",
            "data: {\"id\":\"as-1\",\"result\":\"！\",\"is_end\":true,\"usage\":{\"prompt_tokens\":3,\"completion_tokens\":2,\"total_tokens\":5}}\n\n",
        );
        let resp = UpstreamResponse::from_chunks(200, "text/event-stream", vec![Bytes::from(sse)]);
        let meta = Meta::new(ChannelType::Baidu, "ERNIE-3.5-8K").with_stream(true);
        let mut sink = Vec::new();
        let mut out = ResponseWriter::openai(&mut sink);
        let usage = stream_handler(&mut RelayContext::default(), resp, &meta, &mut out).await.unwrap();
        assert_eq!(usage.total_tokens, 5);
        drop(out);
        let text = String::from_utf8(sink).unwrap();
        assert!(text.contains("你好"));
        assert!(text.trim_end().ends_with("data: [DONE]"));
    }
}
