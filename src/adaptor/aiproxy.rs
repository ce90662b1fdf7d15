//! AIProxy 知识库适配器。
//!
//! A chat turn becomes a question to a knowledge-base library:
//! `POST /api/library/ask` with `{model, query, libraryId, stream}` and the
//! key in `Api-Key`. The library id comes from `config.library_id`. The
//! answer's reference documents are appended to the reply as a numbered
//! list. Usage is never reported and is estimated.

use super::common::{check_status, read_checked_json, require_base, set_header};
use super::openai::handler::finish_usage;
use super::Adaptor;
use crate::context::RelayContext;
use crate::meta::{Meta, Mode};
use crate::pricing::{self, PricingMap};
use crate::stream::{sse_data, ChunkBuilder, LineReader, ReadOutcome, ResponseWriter, DONE_SIGNAL};
use crate::transport::UpstreamResponse;
use crate::types::{GeneralRequest, Message, TextResponse, Usage};
use crate::{Error, ErrorContext, Result};
use async_trait::async_trait;
use reqwest::header::HeaderMap;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LibraryDocument {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub url: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AskReply {
    #[serde(default = "default_true")]
    success: bool,
    #[serde(default)]
    answer: String,
    #[serde(default)]
    documents: Vec<LibraryDocument>,
    #[serde(default)]
    err_code: Option<i64>,
    #[serde(default)]
    message: Option<String>,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Default, Deserialize)]
struct AskChunk {
    #[serde(default)]
    content: String,
    #[serde(default)]
    documents: Vec<LibraryDocument>,
}

/// Reference list appended after the answer; empty without documents.
pub fn references(documents: &[LibraryDocument]) -> String {
    if documents.is_empty() {
        return String::new();
    }
    let mut out = String::from("\n\nReferences:\n");
    for (i, doc) in documents.iter().enumerate() {
        out.push_str(&format!("{}. [{}]({})\n", i + 1, doc.title, doc.url));
    }
    out
}

fn library_id(meta: &Meta) -> Result<&str> {
    meta.config
        .library_id
        .as_deref()
        .filter(|id| !id.is_empty())
        .ok_or_else(|| {
            Error::config_missing(
                "aiproxy library channels need config.library_id",
                ErrorContext::new().with_field_path("config.library_id"),
            )
        })
}

pub async fn handler(
    ctx: &mut RelayContext,
    resp: UpstreamResponse,
    meta: &Meta,
    out: &mut ResponseWriter<'_>,
) -> Result<Usage> {
    let reply: AskReply = read_checked_json(ctx.cancellation(), resp, "aiproxy").await?;
    if !reply.success {
        return Err(Error::Upstream {
            status: 502,
            message: reply.message.unwrap_or_else(|| "library ask failed".to_string()),
            provider_code: reply.err_code.map(|c| c.to_string()),
        });
    }
    let content = format!("{}{}", reply.answer, references(&reply.documents));
    let usage = finish_usage(None, meta, &content);
    let text = TextResponse::new(
        meta.actual_model_name.clone(),
        Message::assistant(content),
        Some("stop".to_string()),
        usage.clone(),
    );
    ctx.converted_response = Some(serde_json::to_value(&text)?);
    out.send_completion(&text).await?;
    Ok(usage)
}

pub async fn stream_handler(
    ctx: &mut RelayContext,
    resp: UpstreamResponse,
    meta: &Meta,
    out: &mut ResponseWriter<'_>,
) -> Result<Usage> {
    let resp = check_status(ctx.cancellation(), resp).await?;
    out.begin_stream();
    let builder = ChunkBuilder::new(meta.actual_model_name.clone(), ctx.reasoning_format);
    out.send_chunk(&builder.role()).await?;
    let mut reader = LineReader::from_response(resp);
    let mut produced = String::new();
    let mut documents: Vec<LibraryDocument> = Vec::new();
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
        let Some(data) = sse_data(&line).filter(|d| !d.is_empty()) else {
            continue;
        };
        if data == DONE_SIGNAL {
            break;
        }
        let chunk: AskChunk = match serde_json::from_str(data) {
            Ok(c) => c,
            Err(e) => {
                tracing::debug!(error = %e, "skipping undecodable library chunk");
                continue;
            }
        };
        if !chunk.documents.is_empty() {
            documents = chunk.documents;
        }
        if !chunk.content.is_empty() {
            produced.push_str(&chunk.content);
            out.send_chunk(&builder.text(chunk.content)).await?;
        }
    }
    let tail = references(&documents);
    if !tail.is_empty() {
        produced.push_str(&tail);
        out.send_chunk(&builder.text(tail)).await?;
    }
    let usage = finish_usage(None, meta, &produced);
    out.send_chunk(&builder.finish("stop")).await?;
    out.send_chunk(&builder.usage(usage.clone())).await?;
    out.send_done().await?;
    Ok(usage)
}

#[derive(Debug, Default)]
pub struct AiProxyLibraryAdaptor {
    meta: Meta,
}

#[async_trait]
impl Adaptor for AiProxyLibraryAdaptor {
    fn init(&mut self, meta: &Meta) {
        self.meta = meta.clone();
    }

    fn request_url(&self, meta: &Meta) -> Result<String> {
        Ok(format!("{}/api/library/ask", require_base(meta)?))
    }

    fn setup_request_header(&self, headers: &mut HeaderMap, meta: &Meta) -> Result<()> {
        set_header(headers, "api-key", &meta.api_key)
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
        Ok(json!({
            "model": self.meta.actual_model_name,
            "query": request.last_user_text(),
            "libraryId": library_id(&self.meta)?,
            "stream": request.stream,
        }))
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
        pricing::table("aiproxy")
    }

    fn channel_name(&self) -> &'static str {
        "aiproxy-library"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::{ChannelConfig, ChannelType};

    fn meta() -> Meta {
        Meta::new(ChannelType::AIProxyLibrary, "gpt-3.5-turbo").with_config(ChannelConfig {
            library_id: Some("lib-1".into()),
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn test_ask_body() {
        let mut a = AiProxyLibraryAdaptor::default();
        a.init(&meta());
        let req = GeneralRequest {
            messages: vec![Message::user("what is a relay?")],
            stream: true,
            ..Default::default()
        };
        let body = a
            .convert_request(&mut RelayContext::default(), Mode::ChatCompletions, &req)
            .await
            .unwrap();
        assert_eq!(body["libraryId"], "lib-1");
        assert_eq!(body["query"], "what is a relay?");
        assert_eq!(body["stream"], true);
    }

    #[tokio::test]
    async fn test_missing_library_id() {
        let mut a = AiProxyLibraryAdaptor::default();
        a.init(&Meta::new(ChannelType::AIProxyLibrary, "gpt-4"));
        let req = GeneralRequest {
            messages: vec![Message::user("q")],
            ..Default::default()
        };
        let err = a
            .convert_request(&mut RelayContext::default(), Mode::ChatCompletions, &req)
            .await
            .unwrap_err();
        assert_eq!(err.status(), 500);
    }

    #[tokio::test]
    async fn test_answer_with_documents() {
        let resp = UpstreamResponse::from_bytes(
            200,
            "application/json",
            r#"{"success":true,"answer":"A gateway.","documents":[{"title":"Intro","url":"https://d/1"}]}"#,
        );
        let mut ctx = RelayContext::default();
        let mut sink = Vec::new();
        let mut out = ResponseWriter::openai(&mut sink);
        handler(&mut ctx, resp, &meta(), &mut out).await.unwrap();
        let content = ctx.converted_response.unwrap()["choices"][0]["message"]["content"].clone();
        assert_eq!(content, "A gateway.\n\nReferences:\n1. [Intro](https://d/1)\n");
    }

    #[tokio::test]
    async fn test_failed_ask() {
        let resp = UpstreamResponse::from_bytes(
            200,
            "application/json",
            r#"{"success":false,"errCode":4001,"message":"library not found"}"#,
        );
        let mut sink = Vec::new();
        let mut out = ResponseWriter::openai(&mut sink);
        let err = handler(&mut RelayContext::default(), resp, &meta(), &mut out).await.unwrap_err();
        assert_eq!(err.status(), 502);
    }
}
