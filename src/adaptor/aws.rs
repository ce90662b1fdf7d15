//! AWS Bedrock 上的 Claude：SigV4 签名与 eventstream 帧解码。
//!
//! # Bedrock Claude
//!
//! Bodies are Anthropic Messages bodies without `model`/`stream` and with
//! `anthropic_version: bedrock-2023-05-31`. The model travels in the path:
//!
//! | Stream | Path |
//! |--------|------|
//! | no | `/model/{id}/invoke` |
//! | yes | `/model/{id}/invoke-with-response-stream` |
//!
//! Credentials come from the channel config (`ak`, `sk`, `region`) or an
//! `ak|sk|region` API key. Streamed replies arrive as
//! `application/vnd.amazon.eventstream` frames whose `chunk` payload is
//! `{"bytes": "<base64 Anthropic event>"}`; those events go through the same
//! [`ClaudeStreamRelay`] the Anthropic adaptor uses.

use super::anthropic::response::relay_message;
use super::anthropic::stream::ClaudeStreamRelay;
use super::anthropic::{reply_anchor, request};
use super::common::{read_checked_json, setup_common_headers, to_value};
use super::Adaptor;
use crate::adaptor::common::check_status;
use crate::config::RelayConfig;
use crate::context::RelayContext;
use crate::meta::{Meta, Mode};
use crate::pricing::{self, PricingMap};
use crate::stream::ResponseWriter;
use crate::transport::eventstream::{EventStreamCodec, Frame};
use crate::transport::signing::SigV4;
use crate::transport::{http, UpstreamResponse};
use crate::types::{ClaudeRequest, ClaudeResponse, GeneralRequest, Usage};
use crate::{Error, ErrorContext, Result};
use async_trait::async_trait;
use base64::Engine;
use bytes::BytesMut;
use futures::StreamExt;
use reqwest::header::HeaderMap;
use reqwest::Method;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use tokio_util::codec::Decoder;

pub const BEDROCK_ANTHROPIC_VERSION: &str = "bedrock-2023-05-31";
const DEFAULT_REGION: &str = "us-east-1";

/// Public Claude names to Bedrock model ids.
const MODEL_IDS: &[(&str, &str)] = &[
    ("claude-instant-1.2", "anthropic.claude-instant-v1"),
    ("claude-2.0", "anthropic.claude-v2"),
    ("claude-2.1", "anthropic.claude-v2:1"),
    ("claude-3-haiku-20240307", "anthropic.claude-3-haiku-20240307-v1:0"),
    ("claude-3-sonnet-20240229", "anthropic.claude-3-sonnet-20240229-v1:0"),
    ("claude-3-opus-20240229", "anthropic.claude-3-opus-20240229-v1:0"),
    ("claude-3-5-haiku-20241022", "anthropic.claude-3-5-haiku-20241022-v1:0"),
    ("claude-3-5-sonnet-20240620", "anthropic.claude-3-5-sonnet-20240620-v1:0"),
    ("claude-3-5-sonnet-20241022", "anthropic.claude-3-5-sonnet-20241022-v2:0"),
    ("claude-3-7-sonnet-20250219", "anthropic.claude-3-7-sonnet-20250219-v1:0"),
    ("claude-sonnet-4-20250514", "anthropic.claude-sonnet-4-20250514-v1:0"),
    ("claude-opus-4-20250514", "anthropic.claude-opus-4-20250514-v1:0"),
];

/// Bedrock model id for `model`; ids and inference profiles pass through.
pub fn model_id(model: &str) -> Option<&str> {
    if model.starts_with("anthropic.") || model.contains(".anthropic.") {
        return Some(model);
    }
    MODEL_IDS.iter().find(|(name, _)| *name == model).map(|(_, id)| *id)
}

#[derive(Debug, Clone, PartialEq)]
struct Credentials {
    access_key: String,
    secret_key: String,
    region: String,
}

fn credentials(meta: &Meta) -> Result<Credentials> {
    let parts = meta.key_parts();
    let pick = |configured: &Option<String>, index: usize| {
        configured
            .clone()
            .filter(|v| !v.is_empty())
            .or_else(|| parts.get(index).filter(|v| !v.is_empty()).map(|v| v.to_string()))
    };
    let missing = |what: &str| {
        Error::config_missing(
            format!("aws channel is missing its {}", what),
            ErrorContext::new().with_field_path("config"),
        )
    };
    Ok(Credentials {
        access_key: pick(&meta.config.ak, 0).ok_or_else(|| missing("access key"))?,
        secret_key: pick(&meta.config.sk, 1).ok_or_else(|| missing("secret key"))?,
        region: pick(&meta.config.region, 2).unwrap_or_else(|| DEFAULT_REGION.to_string()),
    })
}

/// Anthropic body to the Bedrock invoke body.
pub fn bedrock_body(body: &ClaudeRequest) -> Result<Value> {
    let mut value = to_value(body)?;
    if let Some(obj) = value.as_object_mut() {
        obj.remove("model");
        obj.remove("stream");
        obj.insert("anthropic_version".to_string(), Value::from(BEDROCK_ANTHROPIC_VERSION));
    }
    Ok(value)
}

#[derive(Debug, Deserialize)]
struct ChunkPayload {
    bytes: String,
}

#[derive(Debug, Deserialize)]
struct ExceptionPayload {
    #[serde(default, alias = "Message")]
    message: String,
}

/// Anthropic event JSON carried by a `chunk` frame.
pub fn decode_chunk(frame: &Frame) -> Result<String> {
    let payload: ChunkPayload = serde_json::from_slice(&frame.payload)?;
    let raw = base64::engine::general_purpose::STANDARD
        .decode(payload.bytes.as_bytes())
        .map_err(|e| Error::unmarshal_with_context(e.to_string(), ErrorContext::new().with_source("aws.chunk")))?;
    Ok(String::from_utf8_lossy(&raw).into_owned())
}

/// Upstream error for an `exception` frame.
pub fn exception_error(frame: &Frame) -> Error {
    let kind = frame.header(":exception-type").unwrap_or("internalServerException");
    let message = serde_json::from_slice::<ExceptionPayload>(&frame.payload)
        .map(|p| p.message)
        .unwrap_or_else(|_| String::from_utf8_lossy(&frame.payload).into_owned());
    let status = match kind {
        "throttlingException" => 429,
        "validationException" => 400,
        "modelTimeoutException" => 408,
        "serviceUnavailableException" => 503,
        _ => 500,
    };
    Error::Upstream {
        status,
        message: format!("{}: {}", kind, message),
        provider_code: Some(kind.to_string()),
    }
}

#[derive(Debug, Default)]
pub struct AwsClaudeAdaptor {
    meta: Meta,
}

impl AwsClaudeAdaptor {
    fn model<'a>(&'a self, requested: &'a str) -> &'a str {
        if self.meta.actual_model_name.is_empty() {
            requested
        } else {
            &self.meta.actual_model_name
        }
    }
}

#[async_trait]
impl Adaptor for AwsClaudeAdaptor {
    fn init(&mut self, meta: &Meta) {
        self.meta = meta.clone();
    }

    fn request_url(&self, meta: &Meta) -> Result<String> {
        let creds = credentials(meta)?;
        let model = request::resolve_model_alias(&meta.actual_model_name);
        let id = model_id(model).ok_or_else(|| Error::model_unsupported(model, self.channel_name()))?;
        let action = if meta.is_stream { "invoke-with-response-stream" } else { "invoke" };
        let base = if meta.base().is_empty() {
            format!("https://bedrock-runtime.{}.amazonaws.com", creds.region)
        } else {
            meta.base().to_string()
        };
        Ok(format!("{}/model/{}/{}", base, id, action))
    }

    fn setup_request_header(&self, headers: &mut HeaderMap, meta: &Meta) -> Result<()> {
        if meta.is_stream {
            headers.insert(
                reqwest::header::ACCEPT,
                reqwest::header::HeaderValue::from_static("application/vnd.amazon.eventstream"),
            );
        }
        Ok(())
    }

    async fn convert_request(
        &self,
        ctx: &mut RelayContext,
        mode: Mode,
        request: &GeneralRequest,
    ) -> Result<Value> {
        if !matches!(mode, Mode::ChatCompletions | Mode::ClaudeMessages) {
            return Err(Error::mode_unsupported(&request.model, self.channel_name(), mode));
        }
        let body = request::convert_request(ctx, request, self.model(&request.model)).await?;
        ctx.set_thinking_anchor(reply_anchor(ctx, request));
        bedrock_body(&body)
    }

    async fn convert_claude_request(&self, ctx: &mut RelayContext, request: &ClaudeRequest) -> Result<Value> {
        ctx.original_claude_request = Some(request.clone());
        bedrock_body(request)
    }

    /// Signs the exact bytes that go on the wire, so the body is serialized here.
    async fn do_request(&self, ctx: &RelayContext, meta: &Meta, body: Value) -> Result<UpstreamResponse> {
        let creds = credentials(meta)?;
        let url = self.request_url(meta)?;
        let parsed = url::Url::parse(&url).map_err(|e| {
            Error::invalid_request_with_context(e.to_string(), ErrorContext::new().with_source("aws.url"))
        })?;
        let payload = serde_json::to_vec(&body)?;
        let mut headers = HeaderMap::new();
        setup_common_headers(&mut headers, meta);
        self.setup_request_header(&mut headers, meta)?;
        let signer = SigV4::new(creds.access_key, creds.secret_key, creds.region, "bedrock");
        signer.sign("POST", &parsed, &mut headers, &payload, chrono::Utc::now())?;
        tracing::debug!(model = %meta.actual_model_name, stream = meta.is_stream, "forwarding request to bedrock");
        http::send(ctx.cancellation(), Method::POST, &url, headers, Some(payload)).await
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
            let body: ClaudeResponse = read_checked_json(ctx.cancellation(), resp, "aws").await?;
            relay_message(ctx, body, meta, out).await
        }
    }

    fn default_model_pricing(&self) -> Arc<PricingMap> {
        pricing::table("aws")
    }

    fn channel_name(&self) -> &'static str {
        "aws"
    }
}

/// Reads eventstream frames and feeds their Anthropic events to the relay.
pub async fn stream_handler(
    ctx: &mut RelayContext,
    resp: UpstreamResponse,
    meta: &Meta,
    out: &mut ResponseWriter<'_>,
) -> Result<Usage> {
    let resp = check_status(ctx.cancellation(), resp).await?;
    out.begin_stream();
    let mut relay = ClaudeStreamRelay::new(ctx, meta, out);
    let mut codec = EventStreamCodec::new(RelayConfig::global().max_line_bytes);
    let mut buf = BytesMut::new();
    let mut body = resp.body;

    loop {
        loop {
            let frame = match codec.decode(&mut buf) {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(e) => {
                    relay.fail(out, &e).await?;
                    return Ok(relay.usage());
                }
            };
            match frame.message_type() {
                "exception" | "error" => {
                    relay.fail(out, &exception_error(&frame)).await?;
                    return Ok(relay.usage());
                }
                _ if frame.header(":event-type") == Some("chunk") => match decode_chunk(&frame) {
                    Ok(event) => relay.on_data(ctx, out, None, &event).await?,
                    Err(e) => tracing::debug!(error = %e, "skipping undecodable bedrock chunk"),
                },
                _ => {}
            }
            if relay.is_stopped() {
                return Ok(relay.usage());
            }
        }

        let next = tokio::select! {
            _ = ctx.cancellation().cancelled() => {
                tracing::debug!(model = %meta.actual_model_name, "caller went away, stopping stream");
                return Ok(relay.usage());
            }
            n = body.next() => n,
        };
        match next {
            Some(Ok(chunk)) => buf.extend_from_slice(&chunk),
            Some(Err(e)) => {
                relay.fail(out, &e).await?;
                return Ok(relay.usage());
            }
            None => break,
        }
    }
    relay.finish(out).await
}
