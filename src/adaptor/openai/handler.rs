//! Response handlers shared by every OpenAI-compatible backend.
//!
//! DeepSeek, Groq, Mistral, Moonshot, Cloudflare and the OpenAI vendor family
//! all answer in the Chat Completions shape, so they share these.

use crate::adaptor::common::{check_status, read_checked_json, to_value};
use crate::context::RelayContext;
use crate::meta::Meta;
use crate::stream::{fallback_usage, sse_data, LineReader, ReadOutcome, ResponseWriter, DONE_SIGNAL};
use crate::stream::reasoning::ReasoningFormat;
use crate::transport::{http, UpstreamResponse};
use crate::types::{
    ChatCompletionsStreamResponse, EmbeddingResponse, ImageResponse, RerankResponse, TextResponse, Usage,
};
use crate::{Error, Result};

/// Relays an OpenAI SSE stream.
///
/// Lines are forwarded verbatim unless the caller asked for a different
/// reasoning field or speaks Claude; then each chunk is re-serialized.
/// A missing `[DONE]` is injected. A read error mid-stream is reported to the
/// caller as an error event and the partial usage is still returned.
pub async fn stream_handler(
    ctx: &mut RelayContext,
    resp: UpstreamResponse,
    meta: &Meta,
    out: &mut ResponseWriter<'_>,
) -> Result<Usage> {
    let resp = check_status(ctx.cancellation(), resp).await?;
    out.begin_stream();
    let format = ctx.reasoning_format;
    let mut reader = LineReader::from_response(resp);
    let mut produced = String::new();
    let mut reported: Option<Usage> = None;

    loop {
        let line = match reader.next_line(ctx.cancellation()).await {
            Ok(ReadOutcome::Line(line)) => line,
            Ok(ReadOutcome::Eof) => break,
            Ok(ReadOutcome::Cancelled) => {
                tracing::debug!(model = %meta.actual_model_name, "caller went away, stopping stream");
                return Ok(finish_usage(reported, meta, &produced));
            }
            Err(e) => {
                tracing::warn!(error = %e, model = %meta.actual_model_name, "stream read failed");
                out.send_error(&e).await?;
                return Ok(finish_usage(reported, meta, &produced));
            }
        };
        let Some(data) = sse_data(&line).map(str::trim_start) else {
            continue;
        };
        if data.is_empty() {
            continue;
        }
        if data == DONE_SIGNAL {
            break;
        }
        let mut chunk: ChatCompletionsStreamResponse = match serde_json::from_str(data) {
            Ok(c) => c,
            Err(e) => {
                tracing::debug!(error = %e, line = %data, "skipping undecodable stream line");
                continue;
            }
        };
        accumulate(&chunk, &mut produced);
        if let Some(u) = chunk.usage.as_ref().filter(|u| !u.is_empty()) {
            reported = Some(u.clone());
        }
        if normalize_chunk(&mut chunk, format) {
            out.send_chunk(&chunk).await?;
        } else {
            out.send_raw_data(data).await?;
        }
    }

    let usage = finish_usage(reported, meta, &produced);
    out.set_usage(&usage);
    out.send_done().await?;
    Ok(usage)
}

/// Moves reasoning into the field the caller selected. `true` when the chunk changed.
fn normalize_chunk(chunk: &mut ChatCompletionsStreamResponse, format: ReasoningFormat) -> bool {
    if format == ReasoningFormat::Unspecified {
        return false;
    }
    chunk
        .choices
        .iter_mut()
        .fold(false, |changed, c| format.normalize(&mut c.delta) || changed)
}

fn accumulate(chunk: &ChatCompletionsStreamResponse, produced: &mut String) {
    for choice in &chunk.choices {
        if let Some(r) = choice.delta.reasoning_text() {
            produced.push_str(&r);
        }
        produced.push_str(&choice.delta.string_content());
        for tool in choice.delta.tool_calls.iter().flatten() {
            produced.push_str(&tool.function.name);
            produced.push_str(tool.arguments());
        }
    }
}

/// Backend usage when present, with the prompt pre-count filling a missing
/// prompt side; otherwise the estimate over `produced`.
pub fn finish_usage(reported: Option<Usage>, meta: &Meta, produced: &str) -> Usage {
    finish_usage_with(reported, meta.prompt_tokens, produced)
}

pub fn finish_usage_with(reported: Option<Usage>, prompt_tokens: u64, produced: &str) -> Usage {
    match reported {
        Some(mut u) if !u.is_empty() => {
            if u.prompt_tokens == 0 {
                u.prompt_tokens = prompt_tokens;
            }
            u.finalize()
        }
        _ => fallback_usage(prompt_tokens, produced),
    }
}

/// Relays a whole Chat Completion.
pub async fn handler(
    ctx: &mut RelayContext,
    resp: UpstreamResponse,
    meta: &Meta,
    out: &mut ResponseWriter<'_>,
) -> Result<Usage> {
    let mut body: TextResponse = read_checked_json(ctx.cancellation(), resp, "openai").await?;
    if ctx.reasoning_format != ReasoningFormat::Unspecified {
        for choice in body.choices.iter_mut() {
            ctx.reasoning_format.normalize(&mut choice.message);
        }
    }
    let reported = Some(body.usage.clone()).filter(|u| !u.is_empty());
    let usage = finish_usage(reported, meta, &body.assembled_text());
    body.usage = usage.clone();
    if body.model.is_empty() {
        body.model = meta.actual_model_name.clone();
    }
    ctx.converted_response = Some(to_value(&body)?);
    out.send_completion(&body).await?;
    Ok(usage)
}

pub async fn embedding_handler(
    ctx: &mut RelayContext,
    resp: UpstreamResponse,
    meta: &Meta,
    out: &mut ResponseWriter<'_>,
) -> Result<Usage> {
    let mut body: EmbeddingResponse = read_checked_json(ctx.cancellation(), resp, "embedding").await?;
    let usage = if body.usage.prompt_tokens == 0 {
        Usage::new(meta.prompt_tokens, 0)
    } else {
        body.usage.clone().finalize()
    };
    body.usage = usage.clone();
    out.send_json(200, &body).await?;
    Ok(usage)
}

/// Images are billed per picture: `prompt_tokens` is the image count.
pub async fn image_handler(
    ctx: &mut RelayContext,
    resp: UpstreamResponse,
    _meta: &Meta,
    out: &mut ResponseWriter<'_>,
) -> Result<Usage> {
    let body: ImageResponse = read_checked_json(ctx.cancellation(), resp, "image").await?;
    let usage = Usage::new(body.data.len() as u64, 0);
    out.send_json(200, &body).await?;
    Ok(usage)
}

pub async fn rerank_handler(
    ctx: &mut RelayContext,
    resp: UpstreamResponse,
    meta: &Meta,
    out: &mut ResponseWriter<'_>,
) -> Result<Usage> {
    let mut body: RerankResponse = read_checked_json(ctx.cancellation(), resp, "rerank").await?;
    let usage = if body.usage.is_empty() {
        Usage::new(meta.prompt_tokens, 0)
    } else {
        body.usage.clone().finalize()
    };
    body.usage = usage.clone();
    out.send_json(200, &body).await?;
    Ok(usage)
}

/// Forwards synthesized audio bytes; billed on the input pre-count.
pub async fn speech_handler(
    ctx: &mut RelayContext,
    resp: UpstreamResponse,
    meta: &Meta,
    out: &mut ResponseWriter<'_>,
) -> Result<Usage> {
    let resp = check_status(ctx.cancellation(), resp).await?;
    let content_type = audio_content_type(resp.content_type());
    let body = http::collect_body(ctx.cancellation(), resp).await?;
    if body.is_empty() {
        return Err(Error::stream_read("backend returned an empty audio body"));
    }
    out.send_bytes(200, content_type, body).await?;
    Ok(Usage::new(meta.prompt_tokens, 0))
}

fn audio_content_type(ct: Option<&str>) -> &'static str {
    let ct = ct.map(|c| c.split(';').next().unwrap_or(c).trim()).unwrap_or("");
    match ct {
        "audio/mpeg" | "audio/mp3" => "audio/mpeg",
        "audio/wav" | "audio/x-wav" => "audio/wav",
        "audio/ogg" | "audio/opus" => "audio/ogg",
        "audio/aac" => "audio/aac",
        "audio/flac" => "audio/flac",
        "audio/pcm" => "audio/pcm",
        "" => "audio/mpeg",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::ChannelType;
    use crate::stream::ClientDialect;
    use bytes::Bytes;

    fn sse(lines: &[&str]) -> UpstreamResponse {
        let body: String = lines.iter().map(|l| format!("{}\n\n", l)).collect();
        UpstreamResponse::from_chunks(200, "text/event-stream", vec![Bytes::from(body)])
    }

    #[tokio::test]
    async fn test_stream_injects_done_and_counts_fallback() {
        let mut ctx = RelayContext::default();
        let meta = Meta::new(ChannelType::OpenAI, "gpt-4o").with_prompt_tokens(5);
        let resp = sse(&[
            r#"data: {"id":"a","choices":[{"index":0,"delta":{"content":"hello world"}}]}"#,
            ": keep-alive",
        ]);
        let mut buf: Vec<u8> = Vec::new();
        let usage = {
            let mut out = ResponseWriter::openai(&mut buf);
            stream_handler(&mut ctx, resp, &meta, &mut out).await.unwrap()
        };
        let text = String::from_utf8(buf).unwrap();
        assert!(text.contains(r#""content":"hello world""#));
        assert!(text.trim_end().ends_with("data: [DONE]"));
        assert_eq!(usage.prompt_tokens, 5);
        assert!(usage.completion_tokens > 0);
        assert_eq!(usage.total_tokens, usage.prompt_tokens + usage.completion_tokens);
    }

    #[tokio::test]
    async fn test_stream_prefers_reported_usage() {
        let mut ctx = RelayContext::default();
        let meta = Meta::new(ChannelType::OpenAI, "gpt-4o").with_prompt_tokens(99);
        let resp = sse(&[
            r#"data: {"id":"a","choices":[{"index":0,"delta":{"content":"x"}}]}"#,
            r#"data: {"id":"a","choices":[],"usage":{"prompt_tokens":7,"completion_tokens":3,"total_tokens":10}}"#,
            "data: [DONE]",
        ]);
        let mut buf: Vec<u8> = Vec::new();
        let mut out = ResponseWriter::openai(&mut buf);
        let usage = stream_handler(&mut ctx, resp, &meta, &mut out).await.unwrap();
        assert_eq!((usage.prompt_tokens, usage.completion_tokens, usage.total_tokens), (7, 3, 10));
    }

    #[tokio::test]
    async fn test_stream_rewrites_reasoning_field() {
        let mut ctx = RelayContext::default().with_reasoning_format(ReasoningFormat::Thinking);
        let meta = Meta::new(ChannelType::OpenAI, "m");
        let resp = sse(&[
            r#"data: {"id":"a","choices":[{"index":0,"delta":{"reasoning_content":"hm"}}]}"#,
            "data: [DONE]",
        ]);
        let mut buf: Vec<u8> = Vec::new();
        {
            let mut out = ResponseWriter::new(&mut buf, ClientDialect::OpenAi);
            stream_handler(&mut ctx, resp, &meta, &mut out).await.unwrap();
        }
        let text = String::from_utf8(buf).unwrap();
        assert!(text.contains(r#""thinking":"hm""#));
        assert!(!text.contains("reasoning_content"));
    }

    #[tokio::test]
    async fn test_upstream_error_status_is_an_error() {
        let mut ctx = RelayContext::default();
        let meta = Meta::new(ChannelType::OpenAI, "m");
        let resp = UpstreamResponse::from_bytes(429, "application/json", r#"{"error":{"message":"slow down"}}"#);
        let mut buf: Vec<u8> = Vec::new();
        let mut out = ResponseWriter::openai(&mut buf);
        let err = stream_handler(&mut ctx, resp, &meta, &mut out).await.unwrap_err();
        assert_eq!(err.status(), 429);
        assert!(!out.is_started());
    }

    #[tokio::test]
    async fn test_non_stream_fills_missing_usage() {
        let mut ctx = RelayContext::default();
        let meta = Meta::new(ChannelType::OpenAI, "gpt-4o").with_prompt_tokens(4);
        let resp = UpstreamResponse::from_bytes(
            200,
            "application/json",
            r#"{"id":"x","model":"gpt-4o","choices":[{"index":0,"message":{"role":"assistant","content":"abcdefgh"},"finish_reason":"stop"}]}"#,
        );
        let mut buf: Vec<u8> = Vec::new();
        let usage = {
            let mut out = ResponseWriter::openai(&mut buf);
            handler(&mut ctx, resp, &meta, &mut out).await.unwrap()
        };
        assert_eq!(usage.prompt_tokens, 4);
        assert_eq!(usage.completion_tokens, 2);
        let v: serde_json::Value = serde_json::from_slice(&buf).unwrap();
        assert_eq!(v["usage"]["total_tokens"], 6);
        assert!(ctx.converted_response.is_some());
    }

    #[test]
    fn test_audio_content_type() {
        assert_eq!(audio_content_type(Some("audio/mpeg; charset=x")), "audio/mpeg");
        assert_eq!(audio_content_type(None), "audio/mpeg");
        assert_eq!(audio_content_type(Some("text/html")), "application/octet-stream");
    }
}
