//! # ai-relay-rust
//!
//! 面向 OpenAI / Claude 兼容 LLM 网关的核心库：适配器框架、协议翻译与分层计费。
//!
//! The core of an LLM API gateway. A frontend parses a request, picks a
//! channel and hands both to this crate, which rewrites the request into the
//! channel's native wire format, forwards it, translates the (possibly
//! streamed) reply back into the caller's protocol and prices the usage.
//!
//! ## Overview
//!
//! - **Adaptors**: one [`adaptor::Adaptor`] per backend family, dispatched
//!   through [`adaptor::get_adaptor`] by [`adaptor::ApiType`]
//! - **Translation**: OpenAI Chat Completions is the hub; Claude Messages
//!   requests are lowered to it ([`convert`]) and replies re-elevated by the
//!   [`stream::ResponseWriter`]
//! - **Thinking signatures**: Anthropic thinking-block signatures survive
//!   stateless clients through the [`cache::SignatureCache`]
//! - **Pricing**: channel override, adaptor list, global registry, default
//!   ([`pricing::resolve`])
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use ai_relay_rust::meta::{ChannelType, Meta};
//! use ai_relay_rust::relay::{relay, RelayRequest};
//! use ai_relay_rust::stream::ResponseWriter;
//! use ai_relay_rust::types::{GeneralRequest, Message};
//! use ai_relay_rust::RelayContext;
//!
//! #[tokio::main]
//! async fn main() -> ai_relay_rust::Result<()> {
//!     let meta = Meta::new(ChannelType::OpenAI, "gpt-4o-mini").with_api_key("sk-...");
//!     let request = GeneralRequest {
//!         model: "gpt-4o-mini".into(),
//!         messages: vec![Message::user("Hello!")],
//!         ..Default::default()
//!     };
//!
//!     let mut body = Vec::new();
//!     let mut out = ResponseWriter::openai(&mut body);
//!     let mut ctx = RelayContext::new(42, 7);
//!     let outcome = relay(&mut ctx, meta, RelayRequest::General(request), &mut out).await?;
//!     println!("billed {} quota", outcome.quota);
//!     Ok(())
//! }
//! ```
//!
//! ## Module Organization
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`adaptor`] | Adaptor trait, registry and one module per backend |
//! | [`convert`] | Claude ↔ OpenAI request and response bridging |
//! | [`stream`] | SSE line reading, chunk building, tool-call assembly, caller writer |
//! | [`cache`] | Thinking-signature cache and conversation ids |
//! | [`pricing`] | Price tables, global registry, three-layer resolver, quota |
//! | [`relay`] | End-to-end driver for one request |
//! | [`transport`] | HTTP, WebSocket, signing and AWS eventstream plumbing |
//! | [`storage`] | Object store for generated images |
//! | [`types`] | Canonical wire types |
//! | [`tokens`] | Prompt pre-count and completion fallback estimate |
//! | [`meta`] | Per-request channel metadata |
//! | [`config`] | Process-wide configuration |

pub mod adaptor;
pub mod cache;
pub mod config;
pub mod context;
pub mod convert;
pub mod error_code;
pub mod meta;
pub mod pricing;
pub mod relay;
pub mod storage;
pub mod stream;
pub mod tokens;
pub mod transport;
pub mod types;

// Re-export main types for convenience
pub use adaptor::{get_adaptor, Adaptor, ApiType};
pub use config::RelayConfig;
pub use context::RelayContext;
pub use error_code::RelayErrorCode;
pub use meta::{ChannelType, Meta, Mode};
pub use relay::{relay, RelayOutcome, RelayRequest};
pub use types::{ClaudeRequest, GeneralRequest, Message, Usage};

use futures::Stream;
use std::pin::Pin;

/// Result type alias for the library
pub type Result<T> = std::result::Result<T, Error>;

/// A pinned, boxed stream that emits `Result<T>`
pub type BoxStream<'a, T> = Pin<Box<dyn Stream<Item = Result<T>> + Send + 'a>>;

/// Error type for the library
pub mod error;
pub use error::{Error, ErrorContext};
