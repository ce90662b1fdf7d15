//! Streaming translation between backend dialects and the caller.

use ai_relay_rust::adaptor::anthropic::stream::stream_handler as anthropic_stream;
use ai_relay_rust::adaptor::openai::handler::stream_handler as openai_stream;
use ai_relay_rust::cache::{SignatureCache, SignatureKey};
use ai_relay_rust::context::ThinkingAnchor;
use ai_relay_rust::meta::{ChannelType, Meta};
use ai_relay_rust::stream::ResponseWriter;
use ai_relay_rust::transport::UpstreamResponse;
use ai_relay_rust::{Error, RelayContext};
use bytes::Bytes;
use futures::stream;
use reqwest::header::HeaderMap;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

fn sse(events: &[(&str, &str)]) -> UpstreamResponse {
    let body: String = events
        .iter()
        .map(|(name, data)| format!("event: {}\ndata: {}\n\n", name, data))
        .collect();
    UpstreamResponse::from_bytes(200, "text/event-stream", body)
}

/// JSON payloads of the `data:` lines, `[DONE]` excluded.
fn data_lines(raw: &[u8]) -> Vec<Value> {
    String::from_utf8_lossy(raw)
        .lines()
        .filter_map(|l| l.strip_prefix("data: "))
        .filter(|d| *d != "[DONE]")
        .map(|d| serde_json::from_str(d).unwrap())
        .collect()
}

#[tokio::test]
async fn anthropic_tool_use_stream_keeps_index_and_concatenates_arguments() {
    let resp = sse(&[
        ("message_start", r#"{"type":"message_start","message":{"id":"msg_1","type":"message","role":"assistant","model":"claude-3-5-sonnet-20241022","content":[],"usage":{"input_tokens":25,"output_tokens":1}}}"#),
        ("content_block_start", r#"{"type":"content_block_start","index":0,"content_block":{"type":"text","text":""}}"#),
        ("content_block_delta", r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"Checking."}}"#),
        ("content_block_stop", r#"{"type":"content_block_stop","index":0}"#),
        ("content_block_start", r#"{"type":"content_block_start","index":1,"content_block":{"type":"tool_use","id":"toolu_1","name":"get_weather","input":{}}}"#),
        ("content_block_delta", r#"{"type":"content_block_delta","index":1,"delta":{"type":"input_json_delta","partial_json":"{\"location\":"}}"#),
        ("content_block_delta", r#"{"type":"content_block_delta","index":1,"delta":{"type":"input_json_delta","partial_json":" \"Paris\"}"}}"#),
        ("content_block_stop", r#"{"type":"content_block_stop","index":1}"#),
        ("message_delta", r#"{"type":"message_delta","delta":{"stop_reason":"tool_use"},"usage":{"output_tokens":15}}"#),
        ("message_stop", r#"{"type":"message_stop"}"#),
    ]);
    let meta = Meta::new(ChannelType::Anthropic, "claude-3-5-sonnet-20241022").with_stream(true);
    let mut sink = Vec::new();
    let mut out = ResponseWriter::openai(&mut sink);
    let usage = anthropic_stream(&mut RelayContext::default(), resp, &meta, &mut out)
        .await
        .unwrap();
    drop(out);

    assert_eq!(usage.prompt_tokens, 25);
    assert_eq!(usage.completion_tokens, 15);
    assert_eq!(usage.total_tokens, 40);

    let chunks = data_lines(&sink);
    let mut indexes = Vec::new();
    let mut arguments = String::new();
    let mut finish = None;
    for chunk in &chunks {
        let choice = &chunk["choices"][0];
        for call in choice["delta"]["tool_calls"].as_array().into_iter().flatten() {
            indexes.push(call["index"].as_u64().unwrap());
            arguments.push_str(call["function"]["arguments"].as_str().unwrap_or_default());
        }
        if let Some(reason) = choice["finish_reason"].as_str() {
            finish = Some(reason.to_string());
        }
    }
    assert!(!indexes.is_empty());
    assert!(indexes.iter().all(|&i| i == indexes[0]));
    assert_eq!(arguments, r#"{"location": "Paris"}"#);
    assert_eq!(finish.as_deref(), Some("tool_calls"));
    assert!(String::from_utf8_lossy(&sink).ends_with("data: [DONE]\n\n"));
}

#[tokio::test]
async fn thinking_signature_is_cached_at_the_reply_anchor() {
    let resp = sse(&[
        ("message_start", r#"{"type":"message_start","message":{"id":"msg_2","type":"message","role":"assistant","model":"claude-3-7-sonnet-20250219","content":[],"usage":{"input_tokens":10,"output_tokens":1}}}"#),
        ("content_block_start", r#"{"type":"content_block_start","index":0,"content_block":{"type":"thinking","thinking":""}}"#),
        ("content_block_delta", r#"{"type":"content_block_delta","index":0,"delta":{"type":"thinking_delta","thinking":"Let me add."}}"#),
        ("content_block_delta", r#"{"type":"content_block_delta","index":0,"delta":{"type":"signature_delta","signature":"sig_xyz"}}"#),
        ("content_block_stop", r#"{"type":"content_block_stop","index":0}"#),
        ("content_block_start", r#"{"type":"content_block_start","index":1,"content_block":{"type":"text","text":""}}"#),
        ("content_block_delta", r#"{"type":"content_block_delta","index":1,"delta":{"type":"text_delta","text":"4"}}"#),
        ("content_block_stop", r#"{"type":"content_block_stop","index":1}"#),
        ("message_delta", r#"{"type":"message_delta","delta":{"stop_reason":"end_turn"},"usage":{"output_tokens":6}}"#),
        ("message_stop", r#"{"type":"message_stop"}"#),
    ]);
    let cache = Arc::new(SignatureCache::new(Duration::from_secs(60)));
    let mut ctx = RelayContext::new(7, 1).with_signature_cache(cache.clone());
    ctx.set_thinking_anchor(ThinkingAnchor {
        conversation_id: "conv".into(),
        message_index: 3,
    });
    let meta = Meta::new(ChannelType::Anthropic, "claude-3-7-sonnet-20250219").with_stream(true);
    let mut sink = Vec::new();
    let mut out = ResponseWriter::openai(&mut sink);
    anthropic_stream(&mut ctx, resp, &meta, &mut out).await.unwrap();
    drop(out);

    let stored = cache.get(&SignatureKey::new("token_7", "conv", 3, 0)).await;
    assert_eq!(stored.as_deref(), Some("sig_xyz"));

    let text = String::from_utf8_lossy(&sink);
    assert!(text.contains(r#""reasoning_content":"Let me add.""#));
    assert!(!text.contains("sig_xyz"));
}

#[tokio::test]
async fn openai_stream_is_reelevated_for_claude_callers() {
    let body = concat!(
        "data: {\"id\":\"c1\",\"object\":\"chat.completion.chunk\",\"created\":1,\"model\":\"deepseek-chat\",\"choices\":[{\"index\":0,\"delta\":{\"role\":\"assistant\",\"content\":\"\"},\"finish_reason\":null}]}\n\n",
        "data: {\"id\":\"c1\",\"object\":\"chat.completion.chunk\",\"created\":1,\"model\":\"deepseek-chat\",\"choices\":[{\"index\":0,\"delta\":{\"content\":\"Bonjour\"},\"finish_reason\":null}]}\n\n",
        "data: {\"id\":\"c1\",\"object\":\"chat.completion.chunk\",\"created\":1,\"model\":\"deepseek-chat\",\"choices\":[{\"index\":0,\"delta\":{},\"finish_reason\":\"stop\"}],\"usage\":{\"prompt_tokens\":5,\"completion_tokens\":2,\"total_tokens\":7}}\n\n",
        "data: [DONE]\n\n",
    );
    let resp = UpstreamResponse::from_bytes(200, "text/event-stream", body);
    let meta = Meta::new(ChannelType::DeepSeek, "deepseek-chat").with_stream(true);
    let mut ctx = RelayContext::default();
    ctx.claude_messages_conversion = true;
    let mut sink = Vec::new();
    let mut out = ResponseWriter::claude(&mut sink, "deepseek-chat", 5);
    let usage = openai_stream(&mut ctx, resp, &meta, &mut out).await.unwrap();
    drop(out);

    assert_eq!(usage.total_tokens, 7);
    let text = String::from_utf8_lossy(&sink);
    let order = [
        "event: message_start",
        "event: content_block_start",
        "event: content_block_delta",
        "event: content_block_stop",
        "event: message_delta",
        "event: message_stop",
    ];
    let mut at = 0;
    for marker in order {
        let pos = text[at..].find(marker).unwrap_or_else(|| panic!("{} missing or out of order", marker));
        at += pos + marker.len();
    }
    assert!(text.contains("Bonjour"));
    assert!(text.contains(r#""stop_reason":"end_turn""#));
    assert!(!text.contains("[DONE]"));
}

#[tokio::test]
async fn mid_stream_failure_ends_with_error_event_and_partial_usage() {
    let first = Bytes::from_static(
        b"data: {\"id\":\"c1\",\"object\":\"chat.completion.chunk\",\"created\":1,\"model\":\"gpt-4o\",\"choices\":[{\"index\":0,\"delta\":{\"content\":\"partial answer\"},\"finish_reason\":null}]}\n\n",
    );
    let body = stream::iter(vec![Ok(first), Err(Error::stream_read("connection reset"))]);
    let mut headers = HeaderMap::new();
    headers.insert("content-type", "text/event-stream".parse().unwrap());
    let resp = UpstreamResponse::new(200, headers, Box::pin(body));

    let meta = Meta::new(ChannelType::OpenAI, "gpt-4o").with_stream(true).with_prompt_tokens(3);
    let mut sink = Vec::new();
    let mut out = ResponseWriter::openai(&mut sink);
    let usage = openai_stream(&mut RelayContext::default(), resp, &meta, &mut out)
        .await
        .unwrap();
    assert_eq!(out.status(), 200);
    drop(out);

    assert_eq!(usage.prompt_tokens, 3);
    assert!(usage.completion_tokens > 0);
    let text = String::from_utf8_lossy(&sink);
    assert!(text.contains("partial answer"));
    assert!(text.contains(r#""error""#));
    assert!(!text.contains("[DONE]"));
}

#[tokio::test]
async fn cancelled_caller_returns_usage_without_error() {
    let body = stream::pending::<ai_relay_rust::Result<Bytes>>();
    let mut headers = HeaderMap::new();
    headers.insert("content-type", "text/event-stream".parse().unwrap());
    let resp = UpstreamResponse::new(200, headers, Box::pin(body));

    let token = tokio_util::sync::CancellationToken::new();
    let mut ctx = RelayContext::default().with_cancellation(token.clone());
    let meta = Meta::new(ChannelType::OpenAI, "gpt-4o").with_stream(true).with_prompt_tokens(4);
    token.cancel();

    let mut sink = Vec::new();
    let mut out = ResponseWriter::openai(&mut sink);
    let usage = openai_stream(&mut ctx, resp, &meta, &mut out).await.unwrap();
    assert_eq!(usage.prompt_tokens, 4);
    assert_eq!(usage.completion_tokens, 0);
}
