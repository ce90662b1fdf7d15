//! 类型系统模块：定义网关内部统一使用的请求、消息、工具与用量结构。
//!
//! # Types Module
//!
//! Canonical wire structs shared by every adaptor. The OpenAI Chat Completions
//! shape is the hub; the Claude Messages shape is modelled separately in
//! [`claude`] because the Claude-facing frontend speaks it natively.
//!
//! ## Key Types
//!
//! | Type | Description |
//! |------|-------------|
//! | [`GeneralRequest`] | OpenAI-shaped superset request |
//! | [`Message`] | Chat message; content is text or a list of parts |
//! | [`ContentPart`] | `text`, `image_url`, `input_audio`, `thinking` |
//! | [`Tool`] | Tool definition and tool call, streamed or whole |
//! | [`Usage`] | Token usage with the `total = prompt + completion` invariant |
//! | [`ClaudeRequest`] / [`ClaudeResponse`] | Anthropic Messages wire shapes |
//!
//! ## Example
//!
//! ```rust
//! use ai_relay_rust::types::{GeneralRequest, Message};
//!
//! let req: GeneralRequest = serde_json::from_str(
//!     r#"{"model":"gpt-4o","messages":[{"role":"user","content":"hi"}]}"#,
//! ).unwrap();
//! assert_eq!(req.messages[0].string_content(), "hi");
//! let _ = Message::user("again");
//! ```

pub mod claude;
pub mod message;
pub mod request;
pub mod response;
pub mod tool;
pub mod usage;

pub use claude::{
    ClaudeContent, ClaudeDelta, ClaudeMessage, ClaudeMessageContent, ClaudeRequest,
    ClaudeResponse, ClaudeStreamEvent, ClaudeSystem, ClaudeTool, ClaudeToolChoice, ClaudeUsage,
    ImageSource,
};
pub use message::{parse_data_url, ContentPart, ImageUrl, InputAudio, Message, MessageContent, Role};
pub use request::{
    EmbeddingInput, GeneralRequest, ImageRequest, ProviderRouting, ResponseFormat, StopSequences,
    StreamOptions, Thinking, ThinkingType, VideoRequest,
};
pub use response::{
    ChatCompletionsStreamResponse, EmbeddingData, EmbeddingResponse, ImageData, ImageResponse,
    RerankResponse, RerankResult, StreamChoice, TextResponse, TextResponseChoice, VideoData,
    VideoResponse,
};
pub use tool::{Function, NamedToolChoice, Tool, ToolChoice};
pub use usage::{CompletionTokensDetails, PromptTokensDetails, Usage};
