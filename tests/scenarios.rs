//! End-to-end translation scenarios: tool calls, thinking signatures,
//! pricing layers and stop reasons.

use ai_relay_rust::adaptor::anthropic::request::convert_request;
use ai_relay_rust::adaptor::{get_adaptor, ApiType};
use ai_relay_rust::cache::{generate_conversation_id, SignatureCache, SignatureKey};
use ai_relay_rust::convert::{claude_stop_to_openai, openai_finish_to_claude};
use ai_relay_rust::meta::ChannelPricing;
use ai_relay_rust::pricing::{
    resolve_with, GlobalPricingManager, PriceSource, DEFAULT_COMPLETION_RATIO, MILLI_TOKENS_USD,
};
use ai_relay_rust::stream::ToolCallAssembler;
use ai_relay_rust::types::{
    ClaudeContent, ClaudeMessageContent, GeneralRequest, Message, Thinking, Tool,
};
use ai_relay_rust::RelayContext;
use std::sync::Arc;
use std::time::Duration;

fn ctx_with(cache: Arc<SignatureCache>) -> RelayContext {
    RelayContext::new(12345, 1).with_signature_cache(cache)
}

fn thinking_request() -> GeneralRequest {
    let mut assistant = Message::assistant("The answer is 4.");
    assistant.reasoning_content = Some("2 + 2 is 4".into());
    GeneralRequest {
        model: "claude-3-7-sonnet-20250219".into(),
        messages: vec![
            Message::user("what is 2 + 2?"),
            assistant,
            Message::user("and 3 + 3?"),
        ],
        max_tokens: Some(4096),
        thinking: Some(Thinking::enabled(2048)),
        ..Default::default()
    }
}

#[tokio::test]
async fn empty_assistant_with_tool_calls_becomes_single_tool_use() {
    let mut assistant = Message::assistant("");
    assistant.tool_calls = Some(vec![Tool::call("c1", "w", r#"{"loc":"SF"}"#)]);
    let req = GeneralRequest {
        model: "claude-3-5-sonnet-20241022".into(),
        messages: vec![Message::user("weather?"), assistant, Message::tool_result("c1", "72F")],
        ..Default::default()
    };
    let cache = Arc::new(SignatureCache::new(Duration::from_secs(60)));
    let out = convert_request(&ctx_with(cache), &req, "").await.unwrap();

    let assistant_blocks = out.messages[1].blocks();
    assert_eq!(out.messages[1].role, "assistant");
    assert_eq!(assistant_blocks.len(), 1);
    match &assistant_blocks[0] {
        ClaudeContent::ToolUse { id, name, input } => {
            assert_eq!(id, "c1");
            assert_eq!(name, "w");
            assert_eq!(input["loc"], "SF");
        }
        other => panic!("expected tool_use, got {:?}", other),
    }

    let user_blocks = out.messages[2].blocks();
    assert_eq!(out.messages[2].role, "user");
    assert_eq!(user_blocks.len(), 1);
    match &user_blocks[0] {
        ClaudeContent::ToolResult { tool_use_id, content, .. } => {
            assert_eq!(tool_use_id, "c1");
            assert_eq!(content, &Some(ClaudeMessageContent::Text("72F".into())));
        }
        other => panic!("expected tool_result, got {:?}", other),
    }
}

#[test]
fn streamed_tool_call_deltas_assemble_into_one_call() {
    let mut first = Tool::call("call_1", "get_weather", "");
    first.index = Some(0);
    let mut second = Tool::call("", "", r#"{"location":"#);
    second.id = None;
    second.index = Some(0);
    let mut third = Tool::call("", "", r#" "Paris"}"#);
    third.id = None;
    third.index = Some(0);

    let mut acc = ToolCallAssembler::new();
    for delta in [&first, &second, &third] {
        assert_eq!(acc.push_delta(delta), 0);
    }
    let calls = acc.finalize();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].id.as_deref(), Some("call_1"));
    assert_eq!(calls[0].function.name, "get_weather");
    assert_eq!(calls[0].arguments(), r#"{"location": "Paris"}"#);
    assert_eq!(calls[0].index, Some(0));
}

#[tokio::test]
async fn cached_signature_is_restored_before_text() {
    let req = thinking_request();
    let cache = Arc::new(SignatureCache::new(Duration::from_secs(60)));
    let conversation = generate_conversation_id(&req.messages[..1]);
    let key = SignatureKey::new("token_12345", conversation.as_str(), 1, 0);
    assert_eq!(
        key.to_string(),
        format!("thinking_sig:token_12345:{}:1:0", conversation)
    );
    cache.store(&key, "sig_abc").await;

    let out = convert_request(&ctx_with(cache), &req, "").await.unwrap();
    let blocks = out.messages[1].blocks();
    match &blocks[0] {
        ClaudeContent::Thinking { thinking, signature } => {
            assert_eq!(thinking, "2 + 2 is 4");
            assert_eq!(signature.as_deref(), Some("sig_abc"));
        }
        other => panic!("expected thinking first, got {:?}", other),
    }
    assert!(matches!(&blocks[1], ClaudeContent::Text { text, .. } if text == "The answer is 4."));
    assert!(out.thinking.is_some());
}

#[tokio::test]
async fn missing_signature_falls_back_to_think_tag() {
    let req = thinking_request();
    let cache = Arc::new(SignatureCache::new(Duration::from_secs(60)));

    let out = convert_request(&ctx_with(cache), &req, "").await.unwrap();
    let blocks = out.messages[1].blocks();
    match &blocks[0] {
        ClaudeContent::Text { text, .. } => {
            assert_eq!(text, "<think>2 + 2 is 4</think>\n\nThe answer is 4.");
        }
        other => panic!("expected inlined text, got {:?}", other),
    }
    assert!(out.thinking.is_none());
}

#[test]
fn three_layer_pricing() {
    let openai = get_adaptor(ApiType::OpenAI).unwrap();
    let global = GlobalPricingManager::with_contributors(vec![ApiType::OpenAI, ApiType::Anthropic]);

    let mut channel = ChannelPricing::default();
    channel.model_ratio.insert("gpt-4".into(), 1e-4);
    let price = resolve_with("gpt-4", &channel, openai.as_ref(), &global);
    assert_eq!(price.ratio, 1e-4);
    assert_eq!(price.ratio_source, PriceSource::Channel);

    let none = ChannelPricing::default();
    let price = resolve_with("gpt-4", &none, openai.as_ref(), &global);
    assert_eq!(price.ratio, 30.0 * MILLI_TOKENS_USD);
    assert_eq!(price.ratio_source, PriceSource::Adaptor);

    let price = resolve_with("claude-3-opus-20240229", &none, openai.as_ref(), &global);
    assert_eq!(price.ratio, 15.0 * MILLI_TOKENS_USD);
    assert_eq!(price.ratio_source, PriceSource::Global);

    let price = resolve_with("no-such-model-xyz", &none, openai.as_ref(), &global);
    assert_eq!(price.ratio, 2.5 * MILLI_TOKENS_USD);
    assert_eq!(price.completion_ratio, DEFAULT_COMPLETION_RATIO);
    assert_eq!(price.ratio_source, PriceSource::Default);
}

#[test]
fn stop_reason_mapping() {
    for (claude, openai) in [
        ("end_turn", "stop"),
        ("stop_sequence", "stop"),
        ("max_tokens", "length"),
        ("tool_use", "tool_calls"),
    ] {
        assert_eq!(claude_stop_to_openai(claude), openai);
    }
    assert_eq!(openai_finish_to_claude("length"), "max_tokens");
    assert_eq!(openai_finish_to_claude("tool_calls"), "tool_use");
}
