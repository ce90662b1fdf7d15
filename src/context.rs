//! 请求上下文：前端与核心之间的边界键。
//!
//! Per-request context shared between the frontend and the core.
//!
//! The frontend fills in the caller identity (`token_id`, `channel_id`), the
//! optional `reasoning_format` and `conversation_id`, and a cancellation
//! token. The core records what it did on the way through:
//! `claude_messages_conversion`, `original_claude_request` and
//! `converted_response`.

use crate::cache::signature::{global_signature_cache, SignatureCache};
use crate::cache::key::token_segment;
use crate::stream::reasoning::ReasoningFormat;
use crate::types::ClaudeRequest;
use serde_json::Value;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Where thinking signatures of the current response are stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThinkingAnchor {
    pub conversation_id: String,
    /// Position the assistant reply will take in the next request.
    pub message_index: usize,
}

pub struct RelayContext {
    pub token_id: i64,
    pub channel_id: i64,
    pub reasoning_format: ReasoningFormat,
    /// Caller-supplied conversation id; overrides the message-prefix hash.
    pub conversation_id: Option<String>,
    /// Set when a Claude Messages request was lowered to the OpenAI shape.
    pub claude_messages_conversion: bool,
    pub original_claude_request: Option<ClaudeRequest>,
    /// Final response body for frontends that re-forward it.
    pub converted_response: Option<Value>,
    /// Requested clip length of a video generation, billed per second.
    pub video_seconds: Option<u32>,
    pub(crate) thinking_anchor: Option<ThinkingAnchor>,
    cancel: CancellationToken,
    signatures: Arc<SignatureCache>,
}

impl RelayContext {
    pub fn new(token_id: i64, channel_id: i64) -> Self {
        Self {
            token_id,
            channel_id,
            reasoning_format: ReasoningFormat::default(),
            conversation_id: None,
            claude_messages_conversion: false,
            original_claude_request: None,
            converted_response: None,
            video_seconds: None,
            thinking_anchor: None,
            cancel: CancellationToken::new(),
            signatures: global_signature_cache(),
        }
    }

    pub fn with_reasoning_format(mut self, format: ReasoningFormat) -> Self {
        self.reasoning_format = format;
        self
    }

    pub fn with_conversation_id(mut self, id: impl Into<String>) -> Self {
        self.conversation_id = Some(id.into());
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn with_signature_cache(mut self, cache: Arc<SignatureCache>) -> Self {
        self.signatures = cache;
        self
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn signatures(&self) -> &Arc<SignatureCache> {
        &self.signatures
    }

    /// Token segment of signature-cache keys (`token_<id>`).
    pub fn token_key(&self) -> String {
        token_segment(self.token_id)
    }

    pub fn thinking_anchor(&self) -> Option<&ThinkingAnchor> {
        self.thinking_anchor.as_ref()
    }

    pub fn set_thinking_anchor(&mut self, anchor: ThinkingAnchor) {
        self.thinking_anchor = Some(anchor);
    }
}

impl Default for RelayContext {
    fn default() -> Self {
        Self::new(0, 0)
    }
}
