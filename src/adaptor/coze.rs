//! Coze 机器人适配器（v3 chat）。
//!
//! A bot is addressed as model `bot-{bot_id}`. The user id comes from
//! `config.user_id`, then the request's `user`. Coze's non-stream reply has
//! to be polled, so the upstream call always streams and non-stream
//! callers get the events folded into one completion.
//!
//! | Event | Handling |
//! |-------|----------|
//! | `conversation.message.delta` (`type: answer`) | text delta |
//! | `conversation.chat.completed` | usage |
//! | `conversation.chat.failed`, `error` | upstream error |
//! | `done` | end |

use super::common::{check_status, require_base, set_bearer};
use super::openai::handler::finish_usage;
use super::Adaptor;
use crate::context::RelayContext;
use crate::meta::{Meta, Mode};
use crate::pricing::{self, PricingMap};
use crate::stream::{sse_data, sse_event, ChunkBuilder, LineReader, ReadOutcome, ResponseWriter, DONE_SIGNAL};
use crate::transport::UpstreamResponse;
use crate::types::{GeneralRequest, Message, Role, TextResponse, Usage};
use crate::{Error, Result};
use async_trait::async_trait;
use reqwest::header::HeaderMap;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

pub const BOT_PREFIX: &str = "bot-";
const DEFAULT_USER: &str = "ai-relay";

pub fn convert_request(request: &GeneralRequest, model: &str, user: Option<&str>) -> Value {
    let bot_id = model.strip_prefix(BOT_PREFIX).unwrap_or(model);
    let messages: Vec<Value> = request
        .messages
        .iter()
        .filter(|m| m.role != Role::System)
        .map(|m| {
            let role = if m.role == Role::Assistant { "assistant" } else { "user" };
            json!({ "role": role, "content": m.string_content(), "content_type": "text" })
        })
        .collect();
    let user = user
        .or(request.user.as_deref())
        .filter(|u| !u.is_empty())
        .unwrap_or(DEFAULT_USER);
    json!({
        "bot_id": bot_id,
        "user_id": user,
        "stream": true,
        "auto_save_history": false,
        "additional_messages": messages,
    })
}

#[derive(Debug, Default, Deserialize)]
struct MessageEvent {
    #[serde(default)]
    id: String,
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    content: String,
    #[serde(default)]
    reasoning_content: String,
}

#[derive(Debug, Default, Deserialize)]
struct ChatEvent {
    #[serde(default)]
    usage: Option<CozeUsage>,
    #[serde(default)]
    last_error: Option<CozeError>,
}

#[derive(Debug, Default, Deserialize)]
struct CozeUsage {
    #[serde(default)]
    input_count: u64,
    #[serde(default)]
    output_count: u64,
}

#[derive(Debug, Default, Deserialize)]
struct CozeError {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    msg: String,
}

impl CozeError {
    fn into_error(self) -> Error {
        Error::Upstream {
            status: 502,
            message: self.msg,
            provider_code: Some(self.code.to_string()),
        }
    }
}

/// One parsed step of the event stream.
enum Step {
    Answer { id: String, text: String, reasoning: String },
    Usage(Usage),
    Failed(Error),
    Done,
    Skip,
}

fn parse_step(event: &str, data: &str) -> Step {
    match event {
        "conversation.message.delta" => match serde_json::from_str::<MessageEvent>(data) {
            Ok(m) if m.kind == "answer" => Step::Answer {
                id: m.id,
                text: m.content,
                reasoning: m.reasoning_content,
            },
            _ => Step::Skip,
        },
        "conversation.chat.completed" => serde_json::from_str::<ChatEvent>(data)
            .ok()
            .and_then(|c| c.usage)
            .map(|u| Step::Usage(Usage::new(u.input_count, u.output_count)))
            .unwrap_or(Step::Skip),
        "conversation.chat.failed" => {
            let err = serde_json::from_str::<ChatEvent>(data)
                .ok()
                .and_then(|c| c.last_error)
                .unwrap_or_default();
            Step::Failed(err.into_error())
        }
        "error" => Step::Failed(serde_json::from_str::<CozeError>(data).unwrap_or_default().into_error()),
        "done" => Step::Done,
        _ if data == DONE_SIGNAL => Step::Done,
        _ => Step::Skip,
    }
}

/// Reads steps until `done`, EOF or cancellation; `None` marks the end.
struct EventReader {
    lines: LineReader,
    event: String,
}

impl EventReader {
    fn new(resp: UpstreamResponse) -> Self {
        Self {
            lines: LineReader::from_response(resp),
            event: String::new(),
        }
    }

    async fn next(&mut self, ctx: &RelayContext) -> Result<Option<Step>> {
        loop {
            let line = match self.lines.next_line(ctx.cancellation()).await? {
                ReadOutcome::Line(line) => line,
                ReadOutcome::Eof | ReadOutcome::Cancelled => return Ok(None),
            };
            if let Some(name) = sse_event(&line) {
                self.event = name.to_string();
                continue;
            }
            if let Some(data) = sse_data(&line) {
                return Ok(Some(parse_step(&self.event, data)));
            }
        }
    }
}

pub async fn handler(
    ctx: &mut RelayContext,
    resp: UpstreamResponse,
    meta: &Meta,
    out: &mut ResponseWriter<'_>,
) -> Result<Usage> {
    let resp = check_status(ctx.cancellation(), resp).await?;
    let mut events = EventReader::new(resp);
    let mut content = String::new();
    let mut reasoning = String::new();
    let mut id = String::new();
    let mut reported = None;
    while let Some(step) = events.next(ctx).await? {
        match step {
            Step::Answer { id: mid, text, reasoning: r } => {
                id = mid;
                content.push_str(&text);
                reasoning.push_str(&r);
            }
            Step::Usage(u) => reported = Some(u),
            Step::Failed(e) => return Err(e),
            Step::Done => break,
            Step::Skip => {}
        }
    }
    let mut message = Message::assistant(content);
    if !reasoning.is_empty() {
        ctx.reasoning_format.apply(&mut message, reasoning);
    }
    let mut text = TextResponse::new(meta.actual_model_name.clone(), message, Some("stop".to_string()), Usage::default());
    if !id.is_empty() {
        text.id = id;
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
    let resp = check_status(ctx.cancellation(), resp).await?;
    out.begin_stream();
    let mut builder = ChunkBuilder::new(meta.actual_model_name.clone(), ctx.reasoning_format);
    let mut events = EventReader::new(resp);
    let mut produced = String::new();
    let mut reported = None;
    let mut started = false;
    loop {
        let step = match events.next(ctx).await {
            Ok(Some(step)) => step,
            Ok(None) if ctx.is_cancelled() => return Ok(finish_usage(reported, meta, &produced)),
            Ok(None) => break,
            Err(e) => {
                tracing::warn!(error = %e, "coze stream read failed");
                out.send_error(&e).await?;
                return Ok(finish_usage(reported, meta, &produced));
            }
        };
        match step {
            Step::Answer { id, text, reasoning } => {
                if !started {
                    builder.set_id(id);
                    out.send_chunk(&builder.role()).await?;
                    started = true;
                }
                if !reasoning.is_empty() {
                    produced.push_str(&reasoning);
                    out.send_chunk(&builder.reasoning(reasoning)).await?;
                }
                if !text.is_empty() {
                    produced.push_str(&text);
                    out.send_chunk(&builder.text(text)).await?;
                }
            }
            Step::Usage(u) => reported = Some(u),
            Step::Failed(e) => {
                out.send_error(&e).await?;
                return Ok(finish_usage(reported, meta, &produced));
            }
            Step::Done => break,
            Step::Skip => {}
        }
    }
    let usage = finish_usage(reported, meta, &produced);
    out.send_chunk(&builder.finish("stop")).await?;
    out.send_chunk(&builder.usage(usage.clone())).await?;
    out.send_done().await?;
    Ok(usage)
}

#[derive(Debug, Default)]
pub struct CozeAdaptor {
    meta: Meta,
}

#[async_trait]
impl Adaptor for CozeAdaptor {
    fn init(&mut self, meta: &Meta) {
        self.meta = meta.clone();
    }

    fn request_url(&self, meta: &Meta) -> Result<String> {
        Ok(format!("{}/v3/chat", require_base(meta)?))
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
        match mode {
            Mode::ChatCompletions | Mode::ClaudeMessages => Ok(convert_request(
                request,
                &self.meta.actual_model_name,
                self.meta.config.user_id.as_deref(),
            )),
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
        if meta.is_stream {
            stream_handler(ctx, resp, meta, out).await
        } else {
            handler(ctx, resp, meta, out).await
        }
    }

    fn default_model_pricing(&self) -> Arc<PricingMap> {
        pricing::table("coze")
    }

    fn channel_name(&self) -> &'static str {
        "coze"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::ChannelType;
    use bytes::Bytes;

    const EVENTS: &str = concat!(
        "event:conversation.chat.created\ndata:{\"id\":\"c1\",\"status\":\"created\"}\n\n",
        "event:conversation.message.delta\ndata:{\"id\":\"m1\",\"role\":\"assistant\",\"type\":\"answer\",\"content\":\"Hel\"}\n\n",
        "event:conversation.message.delta\ndata:{\"id\":\"m1\",\"role\":\"assistant\",\"type\":\"answer\",\"content\":\"lo\"}\n\n",
        "event:conversation.message.completed\ndata:{\"id\":\"m1\",\"type\":\"answer\",\"content\":\"Hello\"}\n\n",
        "event:conversation.chat.completed\ndata:{\"id\":\"c1\",\"usage\":{\"token_count\":9,\"output_count\":2,\"input_count\":7}}\n\n",
        "event:done\ndata:\"[DONE]\"\n\n",
    );

    #[test]
    fn test_bot_id_and_user() {
        let req = GeneralRequest {
            messages: vec![Message::system("dropped"), Message::user("hi")],
            ..Default::default()
        };
        let body = convert_request(&req, "bot-7342", Some("u-1"));
        assert_eq!(body["bot_id"], "7342");
        assert_eq!(body["user_id"], "u-1");
        assert_eq!(body["additional_messages"].as_array().unwrap().len(), 1);
        assert_eq!(convert_request(&req, "bot-1", None)["user_id"], DEFAULT_USER);
    }

    #[tokio::test]
    async fn test_events_folded_into_completion() {
        let resp = UpstreamResponse::from_chunks(200, "text/event-stream", vec![Bytes::from(EVENTS)]);
        let meta = Meta::new(ChannelType::Coze, "bot-7342");
        let mut ctx = RelayContext::default();
        let mut sink = Vec::new();
        let mut out = ResponseWriter::openai(&mut sink);
        let usage = handler(&mut ctx, resp, &meta, &mut out).await.unwrap();
        assert_eq!((usage.prompt_tokens, usage.completion_tokens), (7, 2));
        assert_eq!(ctx.converted_response.unwrap()["choices"][0]["message"]["content"], "Hello");
    }

    #[tokio::test]
    async fn test_failed_chat_in_stream() {
        let events = concat!(
            "event:conversation.message.delta\ndata:{\"id\":\"m1\",\"type\":\"answer\",\"content\":\"a\"}\n\n",
            "event:conversation.chat.failed\ndata:{\"id\":\"c1\",\"last_error\":{\"code\":4011,\"msg\":\"quota\"}}\n\n",
        );
        let resp = UpstreamResponse::from_chunks(200, "text/event-stream", vec![Bytes::from(events)]);
        let meta = Meta::new(ChannelType::Coze, "bot-1").with_stream(true);
        let mut sink = Vec::new();
        let mut out = ResponseWriter::openai(&mut sink);
        stream_handler(&mut RelayContext::default(), resp, &meta, &mut out).await.unwrap();
        drop(out);
        let text = String::from_utf8(sink).unwrap();
        assert!(text.contains("quota"));
        assert!(!text.contains("[DONE]"));
    }
}
