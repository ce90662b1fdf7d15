//! Token 计数模块：提示词预计数与补全 Token 的回退估算。
//!
//! # Token Counting
//!
//! Backends do not always report usage. When they do not, the relay estimates
//! completion tokens from the assembled response text, and the frontend may
//! pre-count the prompt with the same estimator.
//!
//! | Item | Description |
//! |------|-------------|
//! | [`TokenCounter`] | Trait for token counting implementations |
//! | [`CharacterEstimator`] | 4 characters ≈ 1 token, rounded up |
//! | [`count_request_tokens`] | Prompt pre-count for OpenAI-shaped requests |
//! | [`count_claude_request_tokens`] | Prompt pre-count for Claude Messages requests |
//!
//! ## Example
//!
//! ```rust
//! use ai_relay_rust::tokens::{count_text_tokens, CharacterEstimator, TokenCounter};
//!
//! assert_eq!(count_text_tokens("Hello, how are you?"), 5);
//! assert_eq!(CharacterEstimator::with_ratio(2.0).count("abcd"), 2);
//! ```

mod counter;

pub use counter::{
    count_claude_request_tokens, count_request_tokens, count_text_tokens, CharacterEstimator,
    TokenCounter,
};
