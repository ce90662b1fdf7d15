//! Signature cache keys and conversation identity.

use crate::types::{Message, Role};
use sha2::{Digest, Sha256};
use std::fmt;

pub const KEY_PREFIX: &str = "thinking_sig";

/// Characters of each user message that participate in the conversation hash.
const USER_CONTENT_PREFIX_CHARS: usize = 100;

/// `thinking_sig:<token>:<conversation>:<message index>:<thinking index>`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SignatureKey {
    pub token: String,
    pub conversation_id: String,
    pub message_index: usize,
    pub thinking_index: usize,
}

impl SignatureKey {
    pub fn new(
        token: impl Into<String>,
        conversation_id: impl Into<String>,
        message_index: usize,
        thinking_index: usize,
    ) -> Self {
        Self {
            token: token.into(),
            conversation_id: conversation_id.into(),
            message_index,
            thinking_index,
        }
    }
}

impl fmt::Display for SignatureKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}:{}:{}",
            KEY_PREFIX, self.token, self.conversation_id, self.message_index, self.thinking_index
        )
    }
}

/// Token segment of a key: `token_<id>`.
pub fn token_segment(token_id: i64) -> String {
    format!("token_{}", token_id)
}

/// Deterministic 64-bit conversation hash, hex encoded.
///
/// Only user text (first 100 characters of each message) and the number of
/// tool calls on each assistant message participate, so the id does not move
/// when reasoning text is added to earlier turns.
pub fn generate_conversation_id(messages: &[Message]) -> String {
    let mut hasher = Sha256::new();
    for msg in messages {
        match msg.role {
            Role::User => {
                let content: String = msg
                    .string_content()
                    .chars()
                    .take(USER_CONTENT_PREFIX_CHARS)
                    .collect();
                hasher.update(b"u:");
                hasher.update(content.as_bytes());
                hasher.update(b"\n");
            }
            Role::Assistant => {
                let calls = msg.tool_calls.as_ref().map_or(0, Vec::len);
                hasher.update(format!("a:{}\n", calls).as_bytes());
            }
            Role::System | Role::Tool => {}
        }
    }
    let digest = hasher.finalize();
    digest[..8].iter().map(|b| format!("{:02x}", b)).collect()
}
