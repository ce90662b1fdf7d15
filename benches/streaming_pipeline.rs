//! Benchmarks for streaming translation throughput
//!
//! This benchmark measures:
//! - OpenAI SSE relay (verbatim and reasoning-normalized)
//! - Anthropic SSE → OpenAI chunk translation
//! - OpenAI chunks re-elevated to Claude events
//! - Tool call delta accumulation

use ai_relay_rust::adaptor::anthropic::stream::stream_handler as anthropic_stream;
use ai_relay_rust::adaptor::openai::handler::stream_handler as openai_stream;
use ai_relay_rust::meta::{ChannelType, Meta};
use ai_relay_rust::stream::{ChunkBuilder, ReasoningFormat, ResponseWriter, ToolCallAssembler};
use ai_relay_rust::transport::UpstreamResponse;
use ai_relay_rust::types::Tool;
use ai_relay_rust::RelayContext;
use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};

/// Sample SSE frames (OpenAI format)
const OPENAI_FRAMES: &[&str] = &[
    r#"data: {"id":"chatcmpl-123","object":"chat.completion.chunk","created":1694268190,"model":"gpt-4o","choices":[{"index":0,"delta":{"role":"assistant","content":""},"finish_reason":null}]}"#,
    r#"data: {"id":"chatcmpl-123","object":"chat.completion.chunk","created":1694268190,"model":"gpt-4o","choices":[{"index":0,"delta":{"reasoning_content":"Thinking it over"},"finish_reason":null}]}"#,
    r#"data: {"id":"chatcmpl-123","object":"chat.completion.chunk","created":1694268190,"model":"gpt-4o","choices":[{"index":0,"delta":{"content":"Hello"},"finish_reason":null}]}"#,
    r#"data: {"id":"chatcmpl-123","object":"chat.completion.chunk","created":1694268190,"model":"gpt-4o","choices":[{"index":0,"delta":{"content":" there"},"finish_reason":null}]}"#,
    r#"data: {"id":"chatcmpl-123","object":"chat.completion.chunk","created":1694268190,"model":"gpt-4o","choices":[{"index":0,"delta":{},"finish_reason":"stop"}],"usage":{"prompt_tokens":9,"completion_tokens":4,"total_tokens":13}}"#,
    "data: [DONE]",
];

/// Sample SSE events (Anthropic Messages format)
const CLAUDE_EVENTS: &[&str] = &[
    "event: message_start\ndata: {\"type\":\"message_start\",\"message\":{\"id\":\"msg_1\",\"type\":\"message\",\"role\":\"assistant\",\"model\":\"claude-3-5-sonnet-20241022\",\"content\":[],\"usage\":{\"input_tokens\":25,\"output_tokens\":1}}}",
    "event: content_block_start\ndata: {\"type\":\"content_block_start\",\"index\":0,\"content_block\":{\"type\":\"text\",\"text\":\"\"}}",
    "event: content_block_delta\ndata: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"Hello\"}}",
    "event: content_block_delta\ndata: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\" world\"}}",
    "event: content_block_stop\ndata: {\"type\":\"content_block_stop\",\"index\":0}",
    "event: content_block_start\ndata: {\"type\":\"content_block_start\",\"index\":1,\"content_block\":{\"type\":\"tool_use\",\"id\":\"toolu_1\",\"name\":\"get_weather\",\"input\":{}}}",
    "event: content_block_delta\ndata: {\"type\":\"content_block_delta\",\"index\":1,\"delta\":{\"type\":\"input_json_delta\",\"partial_json\":\"{\\\"location\\\":\"}}",
    "event: content_block_delta\ndata: {\"type\":\"content_block_delta\",\"index\":1,\"delta\":{\"type\":\"input_json_delta\",\"partial_json\":\" \\\"Paris\\\"}\"}}",
    "event: content_block_stop\ndata: {\"type\":\"content_block_stop\",\"index\":1}",
    "event: message_delta\ndata: {\"type\":\"message_delta\",\"delta\":{\"stop_reason\":\"tool_use\"},\"usage\":{\"output_tokens\":15}}",
    "event: message_stop\ndata: {\"type\":\"message_stop\"}",
];

fn body(frames: &[&str], repeat: usize) -> Vec<Bytes> {
    let one: String = frames.iter().map(|f| format!("{}\n\n", f)).collect();
    (0..repeat).map(|_| Bytes::from(one.clone())).collect()
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

fn bench_openai_relay(c: &mut Criterion) {
    let rt = runtime();
    let chunks = body(OPENAI_FRAMES, 1);
    let bytes: usize = chunks.iter().map(Bytes::len).sum();
    let meta = Meta::new(ChannelType::OpenAI, "gpt-4o").with_stream(true);

    let mut group = c.benchmark_group("openai_relay");
    group.throughput(Throughput::Bytes(bytes as u64));

    for (name, format) in [
        ("verbatim", ReasoningFormat::Unspecified),
        ("reasoning_renamed", ReasoningFormat::Reasoning),
    ] {
        group.bench_function(name, |b| {
            b.to_async(&rt).iter(|| async {
                let resp = UpstreamResponse::from_chunks(200, "text/event-stream", chunks.clone());
                let mut ctx = RelayContext::default().with_reasoning_format(format);
                let mut sink = Vec::with_capacity(4096);
                let mut out = ResponseWriter::openai(&mut sink);
                let usage = openai_stream(&mut ctx, resp, &meta, &mut out).await.unwrap();
                black_box(usage);
            })
        });
    }
    group.finish();
}

fn bench_anthropic_translation(c: &mut Criterion) {
    let rt = runtime();
    let chunks = body(CLAUDE_EVENTS, 1);
    let bytes: usize = chunks.iter().map(Bytes::len).sum();
    let meta = Meta::new(ChannelType::Anthropic, "claude-3-5-sonnet-20241022").with_stream(true);

    let mut group = c.benchmark_group("anthropic_to_openai");
    group.throughput(Throughput::Bytes(bytes as u64));
    group.bench_function("text_and_tool_use", |b| {
        b.to_async(&rt).iter(|| async {
            let resp = UpstreamResponse::from_chunks(200, "text/event-stream", chunks.clone());
            let mut ctx = RelayContext::default();
            let mut sink = Vec::with_capacity(4096);
            let mut out = ResponseWriter::openai(&mut sink);
            let usage = anthropic_stream(&mut ctx, resp, &meta, &mut out).await.unwrap();
            black_box(usage);
        })
    });
    group.finish();
}

fn bench_claude_reelevation(c: &mut Criterion) {
    let rt = runtime();
    let builder = ChunkBuilder::new("deepseek-chat", ReasoningFormat::Unspecified);
    let chunks = vec![
        builder.role(),
        builder.reasoning("Let me think."),
        builder.text("Hello"),
        builder.text(" there"),
        builder.finish("stop"),
    ];

    let mut group = c.benchmark_group("claude_reelevation");
    group.throughput(Throughput::Elements(chunks.len() as u64));
    group.bench_function("five_chunks", |b| {
        b.to_async(&rt).iter(|| async {
            let mut sink = Vec::with_capacity(4096);
            let mut out = ResponseWriter::claude(&mut sink, "deepseek-chat", 12);
            for chunk in &chunks {
                out.send_chunk(chunk).await.unwrap();
            }
            out.send_done().await.unwrap();
            black_box(out.bytes_written());
        })
    });
    group.finish();
}

fn bench_tool_call_accumulation(c: &mut Criterion) {
    let mut first = Tool::call("call_abc123", "get_weather", "");
    first.index = Some(0);
    let fragments = ["{\"lo", "cation", "\": \"To", "kyo\"}"];
    let deltas: Vec<Tool> = fragments
        .iter()
        .map(|f| {
            let mut t = Tool::call("", "", *f);
            t.id = None;
            t.index = Some(0);
            t
        })
        .collect();

    let mut group = c.benchmark_group("tool_calls");
    group.throughput(Throughput::Elements(deltas.len() as u64 + 1));
    group.bench_function("push_deltas", |b| {
        b.iter(|| {
            let mut acc = ToolCallAssembler::new();
            acc.push_delta(black_box(&first));
            for d in &deltas {
                acc.push_delta(black_box(d));
            }
            black_box(acc.finalize())
        })
    });
    group.finish();
}

criterion_group!(
    benches,
    bench_openai_relay,
    bench_anthropic_translation,
    bench_claude_reelevation,
    bench_tool_call_accumulation,
);
criterion_main!(benches);
