//! Relay round trips against a mock upstream.

use ai_relay_rust::cache::SignatureCache;
use ai_relay_rust::meta::{ChannelType, Meta};
use ai_relay_rust::stream::ResponseWriter;
use ai_relay_rust::types::{ClaudeContent, ClaudeMessage, ClaudeRequest, GeneralRequest, Message, Thinking};
use ai_relay_rust::{relay, RelayContext, RelayRequest};
use mockito::{Matcher, Mock, Server, ServerGuard};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// Test fixture that manages a mock server
struct MockServerFixture {
    server: Arc<Mutex<ServerGuard>>,
    base_url: String,
}

impl MockServerFixture {
    async fn new() -> Self {
        let server = Server::new_async().await;
        let base_url = server.url();
        Self {
            server: Arc::new(Mutex::new(server)),
            base_url,
        }
    }

    fn meta(&self, channel: ChannelType, model: &str) -> Meta {
        Meta::new(channel, model)
            .with_base_url(self.base_url.clone())
            .with_api_key("sk-test")
    }

    /// SSE body; frames without an `event:` line get a `data: ` prefix.
    async fn mock_sse_stream(&self, path: &str, body_contains: &str, frames: &[&str]) -> Mock {
        let body: String = frames
            .iter()
            .map(|f| {
                if f.starts_with("event: ") || f.starts_with("data: ") {
                    format!("{}\n\n", f)
                } else {
                    format!("data: {}\n\n", f)
                }
            })
            .collect();
        let mut server = self.server.lock().await;
        server
            .mock("POST", path)
            .match_body(Matcher::Regex(regex_escape(body_contains)))
            .with_status(200)
            .with_header("content-type", "text/event-stream")
            .with_body(body)
            .create_async()
            .await
    }

    async fn mock_json_response(&self, path: &str, body_contains: &str, status: u16, body: &str) -> Mock {
        let mut server = self.server.lock().await;
        server
            .mock("POST", path)
            .match_body(Matcher::Regex(regex_escape(body_contains)))
            .with_status(status.into())
            .with_header("content-type", "application/json")
            .with_body(body)
            .create_async()
            .await
    }
}

fn regex_escape(s: &str) -> String {
    regex::escape(s)
}

#[tokio::test]
async fn claude_caller_on_deepseek_gets_claude_events() {
    let fixture = MockServerFixture::new().await;
    let upstream = fixture
        .mock_sse_stream(
            "/v1/chat/completions",
            r#""stream":true"#,
            &[
                r#"{"id":"c1","object":"chat.completion.chunk","created":1,"model":"deepseek-chat","choices":[{"index":0,"delta":{"role":"assistant","content":"Hel"},"finish_reason":null}]}"#,
                r#"{"id":"c1","object":"chat.completion.chunk","created":1,"model":"deepseek-chat","choices":[{"index":0,"delta":{"content":"lo"},"finish_reason":"stop"}],"usage":{"prompt_tokens":8,"completion_tokens":2,"total_tokens":10}}"#,
                "[DONE]",
            ],
        )
        .await;

    let request = RelayRequest::Claude(ClaudeRequest {
        model: "deepseek-chat".into(),
        messages: vec![ClaudeMessage::new("user", vec![ClaudeContent::text("hi")])],
        max_tokens: 64,
        stream: Some(true),
        ..Default::default()
    });
    let mut ctx = RelayContext::new(1, 2);
    let mut sink = Vec::new();
    let mut out = ResponseWriter::claude(&mut sink, "deepseek-chat", 0);
    let outcome = relay(&mut ctx, fixture.meta(ChannelType::DeepSeek, "deepseek-chat"), request, &mut out)
        .await
        .unwrap();
    drop(out);

    upstream.assert_async().await;
    assert!(ctx.claude_messages_conversion);
    assert_eq!(outcome.usage.total_tokens, 10);
    assert!(outcome.quota > 0);
    assert!(!outcome.cancelled);

    let text = String::from_utf8_lossy(&sink);
    assert!(text.starts_with("event: message_start"));
    assert!(text.contains(r#""text":"Hel""#));
    assert!(text.trim_end().ends_with(r#"data: {"type":"message_stop"}"#));
}

/// `data:` payload of the named Claude event.
fn claude_event(sse: &str, name: &str) -> serde_json::Value {
    let marker = format!("event: {}\ndata: ", name);
    let start = sse.find(&marker).map(|i| i + marker.len()).unwrap();
    let end = sse[start..].find('\n').map_or(sse.len(), |i| start + i);
    serde_json::from_str(&sse[start..end]).unwrap()
}

#[tokio::test]
async fn claude_caller_sees_billed_usage_when_backend_reports_none() {
    let fixture = MockServerFixture::new().await;
    let _upstream = fixture
        .mock_sse_stream(
            "/v1/chat/completions",
            r#""stream":true"#,
            &[
                r#"{"id":"c2","object":"chat.completion.chunk","created":1,"model":"deepseek-chat","choices":[{"index":0,"delta":{"role":"assistant","content":"The quick brown fox "},"finish_reason":null}]}"#,
                r#"{"id":"c2","object":"chat.completion.chunk","created":1,"model":"deepseek-chat","choices":[{"index":0,"delta":{"content":"jumps over the lazy dog."},"finish_reason":"stop"}]}"#,
                "[DONE]",
            ],
        )
        .await;

    let request = RelayRequest::Claude(ClaudeRequest {
        model: "deepseek-chat".into(),
        messages: vec![ClaudeMessage::new("user", vec![ClaudeContent::text("tell me a pangram")])],
        max_tokens: 64,
        stream: Some(true),
        ..Default::default()
    });
    let mut sink = Vec::new();
    let mut out = ResponseWriter::claude(&mut sink, "deepseek-chat", 0);
    let outcome = relay(
        &mut RelayContext::new(1, 2),
        fixture.meta(ChannelType::DeepSeek, "deepseek-chat"),
        request,
        &mut out,
    )
    .await
    .unwrap();
    drop(out);

    assert!(outcome.usage.prompt_tokens > 0);
    assert!(outcome.usage.completion_tokens > 0);
    let text = String::from_utf8_lossy(&sink);
    let delta = claude_event(&text, "message_delta");
    assert_eq!(delta["usage"]["output_tokens"], outcome.usage.completion_tokens);
    assert_eq!(delta["usage"]["input_tokens"], outcome.usage.prompt_tokens);
}

#[tokio::test]
async fn thinking_signature_survives_to_the_next_turn() {
    let fixture = MockServerFixture::new().await;
    let cache = Arc::new(SignatureCache::new(Duration::from_secs(60)));
    let model = "claude-3-7-sonnet-20250219";

    let first_turn = fixture
        .mock_sse_stream(
            "/v1/messages",
            "what is 2 + 2?",
            &[
                r#"event: message_start
data: {"type":"message_start","message":{"id":"msg_1","type":"message","role":"assistant","model":"claude-3-7-sonnet-20250219","content":[],"usage":{"input_tokens":12,"output_tokens":1}}}"#,
                r#"event: content_block_start
data: {"type":"content_block_start","index":0,"content_block":{"type":"thinking","thinking":""}}"#,
                r#"event: content_block_delta
data: {"type":"content_block_delta","index":0,"delta":{"type":"thinking_delta","thinking":"2 + 2 is 4"}}"#,
                r#"event: content_block_delta
data: {"type":"content_block_delta","index":0,"delta":{"type":"signature_delta","signature":"sig_turn1"}}"#,
                r#"event: content_block_stop
data: {"type":"content_block_stop","index":0}"#,
                r#"event: content_block_start
data: {"type":"content_block_start","index":1,"content_block":{"type":"text","text":""}}"#,
                r#"event: content_block_delta
data: {"type":"content_block_delta","index":1,"delta":{"type":"text_delta","text":"The answer is 4."}}"#,
                r#"event: content_block_stop
data: {"type":"content_block_stop","index":1}"#,
                r#"event: message_delta
data: {"type":"message_delta","delta":{"stop_reason":"end_turn"},"usage":{"output_tokens":9}}"#,
                r#"event: message_stop
data: {"type":"message_stop"}"#,
            ],
        )
        .await;

    let question = Message::user("what is 2 + 2?");
    let turn1 = GeneralRequest {
        model: model.into(),
        messages: vec![question.clone()],
        max_tokens: Some(4096),
        thinking: Some(Thinking::enabled(2048)),
        stream: true,
        ..Default::default()
    };
    let mut ctx = RelayContext::new(42, 3).with_signature_cache(cache.clone());
    let mut sink = Vec::new();
    let mut out = ResponseWriter::openai(&mut sink);
    let outcome = relay(&mut ctx, fixture.meta(ChannelType::Anthropic, model), RelayRequest::General(turn1), &mut out)
        .await
        .unwrap();
    drop(out);
    first_turn.assert_async().await;
    assert_eq!(outcome.usage.prompt_tokens, 12);
    assert_eq!(outcome.usage.completion_tokens, 9);
    assert!(!String::from_utf8_lossy(&sink).contains("sig_turn1"));

    let second_turn = fixture
        .mock_json_response(
            "/v1/messages",
            r#""signature":"sig_turn1""#,
            200,
            r#"{"id":"msg_2","type":"message","role":"assistant","model":"claude-3-7-sonnet-20250219",
                "content":[{"type":"text","text":"6"}],"stop_reason":"end_turn",
                "usage":{"input_tokens":30,"output_tokens":2}}"#,
        )
        .await;

    let mut answer = Message::assistant("The answer is 4.");
    answer.reasoning_content = Some("2 + 2 is 4".into());
    let turn2 = GeneralRequest {
        model: model.into(),
        messages: vec![question, answer, Message::user("and 3 + 3?")],
        max_tokens: Some(4096),
        thinking: Some(Thinking::enabled(2048)),
        ..Default::default()
    };
    let mut ctx = RelayContext::new(42, 3).with_signature_cache(cache);
    let mut sink = Vec::new();
    let mut out = ResponseWriter::openai(&mut sink);
    let outcome = relay(&mut ctx, fixture.meta(ChannelType::Anthropic, model), RelayRequest::General(turn2), &mut out)
        .await
        .unwrap();
    drop(out);
    second_turn.assert_async().await;
    assert_eq!(outcome.usage.total_tokens, 32);
    let reply: serde_json::Value = serde_json::from_slice(&sink).unwrap();
    assert_eq!(reply["choices"][0]["message"]["content"], "6");
}

#[tokio::test]
async fn error_envelope_with_200_status_is_reported_as_bad_gateway() {
    let fixture = MockServerFixture::new().await;
    let _upstream = fixture
        .mock_json_response(
            "/v1/chat/completions",
            "gpt-4o",
            200,
            r#"{"error":{"message":"model overloaded","type":"server_error"}}"#,
        )
        .await;
    let request = RelayRequest::General(GeneralRequest {
        model: "gpt-4o".into(),
        messages: vec![Message::user("hello")],
        ..Default::default()
    });
    let mut sink = Vec::new();
    let mut out = ResponseWriter::openai(&mut sink);
    let err = relay(&mut RelayContext::default(), fixture.meta(ChannelType::OpenAI, "gpt-4o"), request, &mut out)
        .await
        .unwrap_err();
    assert_eq!(err.status(), 502);
    assert!(err.to_string().contains("model overloaded"));
    assert!(!out.is_started());
}
