//! 思维签名缓存模块：把 Anthropic 思维块签名绑定到会话位置，支持可插拔后端。
//!
//! # Thinking Signature Cache
//!
//! Anthropic's extended thinking returns an opaque `signature` per thinking
//! block. Follow-up turns must echo it back or the provider rejects the prior
//! thinking. Clients of the OpenAI dialect never see signatures, so the relay
//! keeps them here, keyed by caller token and conversation position.
//!
//! ## Key Components
//!
//! | Component | Description |
//! |-----------|-------------|
//! | [`SignatureCache`] | TTL cache with optional external backend and hourly sweeper |
//! | [`SignatureBackend`] | Trait for a shared external cache |
//! | [`MemoryStore`] | In-memory map + expiry min-heap |
//! | [`SignatureKey`] | `thinking_sig:<token>:<conversation>:<message>:<thinking>` |
//! | [`generate_conversation_id`] | Hash of user text and tool-call counts |
//!
//! ## Example
//!
//! ```rust
//! use ai_relay_rust::cache::{SignatureCache, SignatureKey};
//! use std::time::Duration;
//!
//! # tokio_test::block_on(async {
//! let cache = SignatureCache::new(Duration::from_secs(3600));
//! let key = SignatureKey::new("token_7", "0011223344556677", 1, 0);
//! cache.store(&key, "sig_abc").await;
//! assert_eq!(cache.get(&key).await.as_deref(), Some("sig_abc"));
//! # });
//! ```

pub mod backend;
pub mod key;
pub mod signature;

pub use backend::{MemoryStore, SignatureBackend};
pub use key::{generate_conversation_id, token_segment, SignatureKey};
pub use signature::{global_signature_cache, SignatureCache};
