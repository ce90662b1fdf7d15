//! 讯飞星火适配器（WebSocket）。
//!
//! Spark is reached over `wss://spark-api.xf-yun.com/{version}/chat` with
//! the credentials folded into a signed query string. The key is
//! `app_id|api_secret|api_key`. The request is one JSON frame; replies are
//! frames with `header.status` 0/1 (more to come) or 2 (last), which the
//! transport hands over as body lines.
//!
//! | Model | Version path | Domain |
//! |-------|--------------|--------|
//! | Spark-Lite | `v1.1` | `lite` |
//! | Spark-Pro | `v3.1` | `generalv3` |
//! | Spark-Pro-128K | `chat/pro-128k` | `pro-128k` |
//! | Spark-Max | `v3.5` | `generalv3.5` |
//! | Spark-Max-32K | `chat/max-32k` | `max-32k` |
//! | Spark-4.0-Ultra | `v4.0` | `4.0Ultra` |
//!
//! `config.api_version` overrides the version path for unlisted models.

use super::common::{key_part, require_base};
use super::openai::handler::finish_usage;
use super::Adaptor;
use crate::context::RelayContext;
use crate::meta::{Meta, Mode};
use crate::pricing::{self, PricingMap};
use crate::stream::{ChunkBuilder, LineReader, ReadOutcome, ResponseWriter};
use crate::transport::signing::hmac_sha256;
use crate::transport::{websocket, UpstreamResponse};
use crate::types::{GeneralRequest, Message, Role, TextResponse, Tool, Usage};
use crate::{Error, ErrorContext, Result};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, Utc};
use reqwest::header::HeaderMap;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

/// `(path after the host, domain)` for a model.
pub fn route(model: &str, api_version: Option<&str>) -> (String, String) {
    let (path, domain) = match model {
        "Spark-Lite" => ("v1.1/chat", "lite"),
        "Spark-Pro" => ("v3.1/chat", "generalv3"),
        "Spark-Pro-128K" => ("chat/pro-128k", "pro-128k"),
        "Spark-Max" => ("v3.5/chat", "generalv3.5"),
        "Spark-Max-32K" => ("chat/max-32k", "max-32k"),
        "Spark-4.0-Ultra" => ("v4.0/chat", "4.0Ultra"),
        _ => {
            let version = api_version.filter(|v| !v.is_empty()).unwrap_or("v1.1");
            let domain = match version {
                "v1.1" => "lite",
                "v2.1" => "generalv2",
                "v3.1" => "generalv3",
                "v3.5" => "generalv3.5",
                "v4.0" => "4.0Ultra",
                other => other,
            };
            return (format!("{}/chat", version), domain.to_string());
        }
    };
    (path.to_string(), domain.to_string())
}

/// `wss://host/path?authorization=..&date=..&host=..` signed with HMAC-SHA256
/// over `host`, `date` and the request line.
pub fn signed_url(base: &str, path: &str, api_key: &str, api_secret: &str, now: DateTime<Utc>) -> Result<String> {
    let mut url = url::Url::parse(&format!("{}/{}", base, path)).map_err(|e| {
        Error::config_missing(e.to_string(), ErrorContext::new().with_field_path("base_url"))
    })?;
    let host = url.host_str().unwrap_or_default().to_string();
    let date = now.format("%a, %d %b %Y %H:%M:%S GMT").to_string();
    let origin = format!("host: {}\ndate: {}\nGET {} HTTP/1.1", host, date, url.path());
    let signature = STANDARD.encode(hmac_sha256(api_secret.as_bytes(), origin.as_bytes())?);
    let authorization = STANDARD.encode(format!(
        r#"api_key="{}", algorithm="hmac-sha256", headers="host date request-line", signature="{}""#,
        api_key, signature
    ));
    url.query_pairs_mut()
        .append_pair("authorization", &authorization)
        .append_pair("date", &date)
        .append_pair("host", &host);
    Ok(url.to_string())
}

pub fn request_frame(request: &GeneralRequest, app_id: &str, domain: &str) -> Value {
    let text: Vec<Value> = request
        .messages
        .iter()
        .map(|m| {
            let role = match m.role {
                Role::Tool => "user",
                other => other.as_str(),
            };
            json!({ "role": role, "content": m.string_content() })
        })
        .collect();
    let mut chat = json!({ "domain": domain, "auditing": "default" });
    if let Some(t) = request.temperature {
        chat["temperature"] = json!(t);
    }
    if let Some(k) = request.top_k {
        chat["top_k"] = json!(k);
    }
    if let Some(max) = request.effective_max_tokens() {
        chat["max_tokens"] = json!(max);
    }
    let mut payload = json!({ "message": { "text": text } });
    if let Some(tools) = request.tools.as_ref().filter(|t| !t.is_empty()) {
        let functions: Vec<Value> = tools
            .iter()
            .map(|t| {
                json!({
                    "name": t.function.name,
                    "description": t.function.description.clone().unwrap_or_default(),
                    "parameters": t.function.parameters.clone().unwrap_or_else(|| json!({})),
                })
            })
            .collect();
        payload["functions"] = json!({ "text": functions });
    }
    json!({
        "header": { "app_id": app_id, "uid": request.user.clone().unwrap_or_default() },
        "parameter": { "chat": chat },
        "payload": payload,
    })
}

#[derive(Debug, Default, Deserialize)]
pub struct Frame {
    #[serde(default)]
    pub header: FrameHeader,
    #[serde(default)]
    pub payload: FramePayload,
}

#[derive(Debug, Default, Deserialize)]
pub struct FrameHeader {
    #[serde(default)]
    pub code: i64,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub sid: String,
    #[serde(default)]
    pub status: i64,
}

#[derive(Debug, Default, Deserialize)]
pub struct FramePayload {
    #[serde(default)]
    pub choices: FrameChoices,
    #[serde(default)]
    pub usage: Option<FrameUsage>,
}

#[derive(Debug, Default, Deserialize)]
pub struct FrameChoices {
    #[serde(default)]
    pub status: i64,
    #[serde(default)]
    pub text: Vec<FrameText>,
}

#[derive(Debug, Default, Deserialize)]
pub struct FrameText {
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub function_call: Option<FrameFunctionCall>,
}

#[derive(Debug, Default, Deserialize)]
pub struct FrameFunctionCall {
    pub name: String,
    #[serde(default)]
    pub arguments: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct FrameUsage {
    #[serde(default)]
    pub text: Usage,
}

impl Frame {
    fn error(&self) -> Option<Error> {
        (self.header.code != 0).then(|| Error::Upstream {
            status: 502,
            message: self.header.message.clone(),
            provider_code: Some(self.header.code.to_string()),
        })
    }

    fn is_last(&self) -> bool {
        self.header.status == 2 || self.payload.choices.status == 2
    }
}

/// Reads every frame until the last one; `Ok(None)` when cancelled.
async fn next_frame(ctx: &RelayContext, reader: &mut LineReader) -> Result<Option<Frame>> {
    loop {
        match reader.next_line(ctx.cancellation()).await? {
            ReadOutcome::Line(line) if line.trim().is_empty() => continue,
            ReadOutcome::Line(line) => {
                return serde_json::from_str(&line).map(Some).map_err(|e| {
                    Error::unmarshal_with_context(e.to_string(), ErrorContext::new().with_source("xunfei"))
                })
            }
            ReadOutcome::Eof | ReadOutcome::Cancelled => return Ok(None),
        }
    }
}

fn frame_tools(frame: &Frame, sid: &str) -> Vec<Tool> {
    frame
        .payload
        .choices
        .text
        .iter()
        .filter_map(|t| t.function_call.as_ref())
        .enumerate()
        .map(|(i, f)| {
            let mut tool = Tool::call(format!("call_{}_{}", sid, i), f.name.clone(), f.arguments.clone());
            tool.index = Some(i);
            tool
        })
        .collect()
}

pub async fn handler(
    ctx: &mut RelayContext,
    resp: UpstreamResponse,
    meta: &Meta,
    out: &mut ResponseWriter<'_>,
) -> Result<Usage> {
    let mut reader = LineReader::from_response(resp);
    let mut content = String::new();
    let mut tools: Vec<Tool> = Vec::new();
    let mut reported: Option<Usage> = None;
    let mut sid = String::new();
    while let Some(frame) = next_frame(ctx, &mut reader).await? {
        if let Some(err) = frame.error() {
            return Err(err);
        }
        sid.clone_from(&frame.header.sid);
        for t in &frame.payload.choices.text {
            content.push_str(&t.content);
        }
        tools.extend(frame_tools(&frame, &sid));
        if let Some(u) = &frame.payload.usage {
            reported = Some(u.text.clone());
        }
        if frame.is_last() {
            break;
        }
    }
    if ctx.is_cancelled() {
        return Ok(finish_usage(reported, meta, &content));
    }
    let mut message = Message::assistant(content);
    let finish = if tools.is_empty() { "stop" } else { "tool_calls" };
    message.tool_calls = (!tools.is_empty()).then_some(tools);
    let mut text = TextResponse::new(meta.actual_model_name.clone(), message, Some(finish.to_string()), Usage::default());
    if !sid.is_empty() {
        text.id = sid;
    }
    text.usage = finish_usage(reported, meta, &text.assembled_text());
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
    let mut reader = LineReader::from_response(resp);
    let mut builder = ChunkBuilder::new(meta.actual_model_name.clone(), ctx.reasoning_format);
    let mut produced = String::new();
    let mut reported: Option<Usage> = None;
    let mut saw_tools = false;
    let mut started = false;

    loop {
        let frame = match next_frame(ctx, &mut reader).await {
            Ok(Some(f)) => f,
            Ok(None) if ctx.is_cancelled() => return Ok(finish_usage(reported, meta, &produced)),
            Ok(None) => break,
            Err(e) if !started => return Err(e),
            Err(e) => {
                tracing::warn!(error = %e, "spark stream read failed");
                out.send_error(&e).await?;
                return Ok(finish_usage(reported, meta, &produced));
            }
        };
        if let Some(err) = frame.error() {
            if !started {
                return Err(err);
            }
            out.send_error(&err).await?;
            return Ok(finish_usage(reported, meta, &produced));
        }
        if !started {
            out.begin_stream();
            builder.set_id(frame.header.sid.clone());
            out.send_chunk(&builder.role()).await?;
            started = true;
        }
        for t in &frame.payload.choices.text {
            if !t.content.is_empty() {
                produced.push_str(&t.content);
                out.send_chunk(&builder.text(t.content.clone())).await?;
            }
        }
        let tools = frame_tools(&frame, &frame.header.sid);
        if !tools.is_empty() {
            saw_tools = true;
            for t in &tools {
                produced.push_str(t.arguments());
            }
            out.send_chunk(&builder.tool_calls(tools)).await?;
        }
        if let Some(u) = &frame.payload.usage {
            reported = Some(u.text.clone());
        }
        if frame.is_last() {
            break;
        }
    }

    if !started {
        out.begin_stream();
    }
    let usage = finish_usage(reported, meta, &produced);
    let finish = if saw_tools { "tool_calls" } else { "stop" };
    out.send_chunk(&builder.finish(finish)).await?;
    out.send_chunk(&builder.usage(usage.clone())).await?;
    out.send_done().await?;
    Ok(usage)
}

#[derive(Debug, Default)]
pub struct XunfeiAdaptor {
    meta: Meta,
}

#[async_trait]
impl Adaptor for XunfeiAdaptor {
    fn init(&mut self, meta: &Meta) {
        self.meta = meta.clone();
    }

    /// Signed for the current time; call it right before connecting.
    fn request_url(&self, meta: &Meta) -> Result<String> {
        let (path, _) = route(&meta.actual_model_name, meta.config.api_version.as_deref());
        signed_url(
            require_base(meta)?,
            &path,
            key_part(meta, 2, "api key")?,
            key_part(meta, 1, "api secret")?,
            Utc::now(),
        )
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
        if !matches!(mode, Mode::ChatCompletions | Mode::ClaudeMessages) {
            return Err(Error::mode_unsupported(&request.model, self.channel_name(), mode));
        }
        let (_, domain) = route(&self.meta.actual_model_name, self.meta.config.api_version.as_deref());
        Ok(request_frame(request, key_part(&self.meta, 0, "app id")?, &domain))
    }

    async fn do_request(&self, ctx: &RelayContext, meta: &Meta, body: Value) -> Result<UpstreamResponse> {
        let url = self.request_url(meta)?;
        tracing::debug!(model = %meta.actual_model_name, stream = meta.is_stream, "opening spark websocket");
        websocket::exchange(ctx.cancellation(), &url, body.to_string()).await
    }

    async fn do_response(
        &self,
        ctx: &mut RelayContext,
        resp: UpstreamResponse,
        meta: &Meta,
        out: &mut ResponseWriter<'_>,
    ) -> Result<Usage> {
        if meta.is_stream {
            stream_handler(ctx, resp, meta, out).await
        } else {
            handler(ctx, resp, meta, out).await
        }
    }

    fn default_model_pricing(&self) -> Arc<PricingMap> {
        pricing::table("xunfei")
    }

    fn channel_name(&self) -> &'static str {
        "xunfei"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::ChannelType;
    use chrono::TimeZone;

    const FRAMES: &str = concat!(
        r#"{"header":{"code":0,"message":"Success","sid":"cht0001","status":0},"payload":{"choices":{"status":0,"seq":0,"text":[{"content":"你好","role":"assistant","index":0}]}}}"#,
        "\n",
        r#"{"header":{"code":0,"message":"Success","sid":"cht0001","status":2},"payload":{"choices":{"status":2,"seq":1,"text":[{"content":"！","role":"assistant","index":0}]},"usage":{"text":{"question_tokens":2,"prompt_tokens":2,"completion_tokens":3,"total_tokens":5}}}}"#,
        "\n",
    );

    #[test]
    fn test_routes() {
        assert_eq!(route("Spark-Max", None), ("v3.5/chat".to_string(), "generalv3.5".to_string()));
        assert_eq!(route("custom", Some("v3.1")), ("v3.1/chat".to_string(), "generalv3".to_string()));
    }

    #[test]
    fn test_signed_url() {
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap();
        let url = signed_url("wss://spark-api.xf-yun.com", "v3.5/chat", "key", "secret", now).unwrap();
        let parsed = url::Url::parse(&url).unwrap();
        assert_eq!(parsed.path(), "/v3.5/chat");
        let pairs: std::collections::HashMap<_, _> = parsed.query_pairs().into_owned().collect();
        assert_eq!(pairs["host"], "spark-api.xf-yun.com");
        assert_eq!(pairs["date"], "Wed, 01 May 2024 10:00:00 GMT");
        let auth = String::from_utf8(STANDARD.decode(&pairs["authorization"]).unwrap()).unwrap();
        assert!(auth.starts_with(r#"api_key="key", algorithm="hmac-sha256""#));
    }

    #[test]
    fn test_request_frame() {
        let req = GeneralRequest {
            messages: vec![Message::system("s"), Message::user("hi")],
            max_tokens: Some(256),
            ..Default::default()
        };
        let frame = request_frame(&req, "app1", "generalv3.5");
        assert_eq!(frame["header"]["app_id"], "app1");
        assert_eq!(frame["parameter"]["chat"]["domain"], "generalv3.5");
        assert_eq!(frame["parameter"]["chat"]["max_tokens"], 256);
        assert_eq!(frame["payload"]["message"]["text"][1]["content"], "hi");
    }

    #[tokio::test]
    async fn test_frames_to_completion() {
        let resp = UpstreamResponse::from_bytes(200, websocket::LINES_CONTENT_TYPE, FRAMES);
        let meta = Meta::new(ChannelType::Xunfei, "Spark-Max");
        let mut sink = Vec::new();
        let mut out = ResponseWriter::openai(&mut sink);
        let mut ctx = RelayContext::default();
        let usage = handler(&mut ctx, resp, &meta, &mut out).await.unwrap();
        assert_eq!(usage.total_tokens, 5);
        let body = ctx.converted_response.unwrap();
        assert_eq!(body["choices"][0]["message"]["content"], "你好！");
        assert_eq!(body["id"], "cht0001");
    }

    #[tokio::test]
    async fn test_frames_to_stream() {
        let resp = UpstreamResponse::from_bytes(200, websocket::LINES_CONTENT_TYPE, FRAMES);
        let meta = Meta::new(ChannelType::Xunfei, "Spark-Max").with_stream(true);
        let mut sink = Vec::new();
        let mut out = ResponseWriter::openai(&mut sink);
        let usage = stream_handler(&mut RelayContext::default(), resp, &meta, &mut out).await.unwrap();
        assert_eq!(usage.completion_tokens, 3);
        drop(out);
        let text = String::from_utf8(sink).unwrap();
        assert!(text.contains("你好"));
        assert_eq!(text.matches("[DONE]").count(), 1);
    }

    #[tokio::test]
    async fn test_error_frame_before_output() {
        let resp = UpstreamResponse::from_bytes(
            200,
            websocket::LINES_CONTENT_TYPE,
            "{\"header\":{\"code\":10013,\"message\":\"input content audit failed\",\"sid\":\"x\",\"status\":2}}\n",
        );
        let meta = Meta::new(ChannelType::Xunfei, "Spark-Lite").with_stream(true);
        let mut sink = Vec::new();
        let mut out = ResponseWriter::openai(&mut sink);
        let err = stream_handler(&mut RelayContext::default(), resp, &meta, &mut out).await.unwrap_err();
        assert_eq!(err.status(), 502);
    }
}
