//! 流式模块：行读取、分块构建、工具调用重组与面向客户端的写出。
//!
//! # Streaming
//!
//! Every streaming `do_response` is the same loop: read a line from the
//! backend, translate it, write an event to the caller, repeat until the
//! backend ends or the caller goes away.
//!
//! | Item | Description |
//! |------|-------------|
//! | [`LineReader`] | Newline splitter over an [`UpstreamResponse`] body, bounded by `max_line_bytes` |
//! | [`ChunkBuilder`] | OpenAI `chat.completion.chunk` builder sharing one id/model/created |
//! | [`ToolCallAssembler`] | Reassembles streamed tool-call fragments by index |
//! | [`ReasoningFormat`] | Which field carries reasoning text toward the caller |
//! | [`ClaudeStreamEmitter`] | OpenAI chunks to Claude Messages SSE events |
//! | [`ResponseWriter`] | SSE/JSON writer in the caller's dialect |
//!
//! Lines longer than the configured limit fail the stream with a
//! `StreamRead` error instead of growing the buffer without bound.

pub mod chunk;
pub mod claude_emitter;
pub mod reasoning;
pub mod tool_calls;
pub mod writer;

pub use chunk::ChunkBuilder;
pub use claude_emitter::{ClaudeEvent, ClaudeStreamEmitter};
pub use reasoning::ReasoningFormat;
pub use tool_calls::ToolCallAssembler;
pub use writer::{ClientDialect, ResponseWriter};

use crate::config::RelayConfig;
use crate::transport::UpstreamResponse;
use crate::types::Usage;
use crate::{BoxStream, Error, Result};
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use tokio_util::sync::CancellationToken;

pub const DONE_SIGNAL: &str = "[DONE]";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadOutcome {
    Line(String),
    Eof,
    Cancelled,
}

/// Splits a byte stream into lines. `\r\n` and `\n` both terminate a line.
pub struct LineReader {
    body: BoxStream<'static, Bytes>,
    buf: BytesMut,
    /// Bytes of `buf` already searched for a newline.
    scanned: usize,
    max_line_bytes: usize,
    done: bool,
}

impl LineReader {
    pub fn new(body: BoxStream<'static, Bytes>, max_line_bytes: usize) -> Self {
        Self {
            body,
            buf: BytesMut::new(),
            scanned: 0,
            max_line_bytes,
            done: false,
        }
    }

    /// Reader over a response body with the configured line limit.
    pub fn from_response(resp: UpstreamResponse) -> Self {
        Self::new(resp.body, RelayConfig::global().max_line_bytes)
    }

    fn overlong(&self) -> Error {
        Error::stream_read(format!("line exceeds {} bytes", self.max_line_bytes))
    }

    /// Next complete line, if buffered. Only bytes after the last scan are
    /// searched. A line, or a pending partial one, longer than the limit
    /// is an error; the `\r` of a `\r\n` terminator does not count.
    fn take_line(&mut self) -> Result<Option<String>> {
        let start = self.scanned;
        let Some(offset) = self.buf[start..].iter().position(|b| *b == b'\n') else {
            self.scanned = self.buf.len();
            let pending = self.buf.len() - usize::from(self.buf.last() == Some(&b'\r'));
            if pending > self.max_line_bytes {
                return Err(self.overlong());
            }
            return Ok(None);
        };
        let pos = start + offset;
        self.scanned = 0;
        let mut line = self.buf.split_to(pos + 1);
        line.truncate(pos);
        if line.last() == Some(&b'\r') {
            line.truncate(pos - 1);
        }
        if line.len() > self.max_line_bytes {
            return Err(self.overlong());
        }
        Ok(Some(String::from_utf8_lossy(&line).into_owned()))
    }

    pub async fn next_line(&mut self, cancel: &CancellationToken) -> Result<ReadOutcome> {
        loop {
            if let Some(line) = self.take_line()? {
                return Ok(ReadOutcome::Line(line));
            }
            if self.done {
                if self.buf.is_empty() {
                    return Ok(ReadOutcome::Eof);
                }
                self.scanned = 0;
                let rest = self.buf.split();
                return Ok(ReadOutcome::Line(String::from_utf8_lossy(&rest).into_owned()));
            }
            let next = tokio::select! {
                _ = cancel.cancelled() => return Ok(ReadOutcome::Cancelled),
                n = self.body.next() => n,
            };
            match next {
                Some(Ok(chunk)) => self.buf.extend_from_slice(&chunk),
                Some(Err(e)) => return Err(Error::stream_read(e.to_string())),
                None => self.done = true,
            }
        }
    }
}

/// Payload of an SSE `data:` line, with or without the space.
pub fn sse_data(line: &str) -> Option<&str> {
    let rest = line.strip_prefix("data:")?;
    Some(rest.strip_prefix(' ').unwrap_or(rest).trim_end())
}

/// Name of an SSE `event:` line.
pub fn sse_event(line: &str) -> Option<&str> {
    let rest = line.strip_prefix("event:")?;
    Some(rest.trim())
}

/// Usage to bill when the backend reported none: the prompt pre-count plus an
/// estimate over everything the stream produced.
pub fn fallback_usage(prompt_tokens: u64, produced_text: &str) -> Usage {
    Usage::new(prompt_tokens, crate::tokens::count_text_tokens(produced_text))
}
