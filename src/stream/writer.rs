//! Writes translated output to the caller in the caller's dialect.

use super::claude_emitter::{ClaudeEvent, ClaudeStreamEmitter};
use super::DONE_SIGNAL;
use crate::convert::openai_to_claude_response;
use crate::types::{ChatCompletionsStreamResponse, ClaudeResponse, TextResponse, Usage};
use crate::{Error, Result};
use bytes::Bytes;
use serde::Serialize;
use tokio::io::{AsyncWrite, AsyncWriteExt};

pub const EVENT_STREAM: &str = "text/event-stream";
pub const APPLICATION_JSON: &str = "application/json";

/// Protocol the caller spoke on the way in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClientDialect {
    #[default]
    OpenAi,
    Claude,
}

/// SSE and JSON writer over the caller's connection.
///
/// The first write fixes [`status`](Self::status) and
/// [`content_type`](Self::content_type); the frontend reads them to build the
/// response head. Every event is flushed as soon as it is written.
pub struct ResponseWriter<'a> {
    out: &'a mut (dyn AsyncWrite + Send + Unpin),
    dialect: ClientDialect,
    emitter: Option<ClaudeStreamEmitter>,
    status: u16,
    content_type: Option<&'static str>,
    started: bool,
    closed: bool,
    bytes_written: u64,
}

impl<'a> ResponseWriter<'a> {
    pub fn new(out: &'a mut (dyn AsyncWrite + Send + Unpin), dialect: ClientDialect) -> Self {
        Self {
            out,
            dialect,
            emitter: None,
            status: 200,
            content_type: None,
            started: false,
            closed: false,
            bytes_written: 0,
        }
    }

    pub fn openai(out: &'a mut (dyn AsyncWrite + Send + Unpin)) -> Self {
        Self::new(out, ClientDialect::OpenAi)
    }

    /// Writer for a Claude Messages caller. OpenAI chunks sent through it are
    /// re-elevated to Claude events.
    pub fn claude(
        out: &'a mut (dyn AsyncWrite + Send + Unpin),
        model: impl Into<String>,
        prompt_tokens: u64,
    ) -> Self {
        let mut w = Self::new(out, ClientDialect::Claude);
        w.emitter = Some(ClaudeStreamEmitter::new(model, prompt_tokens));
        w
    }

    pub fn dialect(&self) -> ClientDialect {
        self.dialect
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn content_type(&self) -> Option<&'static str> {
        self.content_type
    }

    /// Whether any byte reached the caller.
    pub fn is_started(&self) -> bool {
        self.started
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    async fn write(&mut self, status: u16, content_type: &'static str, data: &[u8]) -> Result<()> {
        if !self.started {
            self.status = status;
            self.content_type = Some(content_type);
            self.started = true;
        }
        self.out.write_all(data).await?;
        self.out.flush().await?;
        self.bytes_written += data.len() as u64;
        Ok(())
    }

    async fn write_sse(&mut self, frame: String) -> Result<()> {
        self.write(200, EVENT_STREAM, frame.as_bytes()).await
    }

    async fn write_claude_events(&mut self, events: Vec<ClaudeEvent>) -> Result<()> {
        for (name, payload) in events {
            self.send_claude_event(name, &payload).await?;
        }
        Ok(())
    }

    /// Billed usage for the closing Claude `message_delta`. No effect on
    /// OpenAI callers, who get usage through a chunk.
    pub fn set_usage(&mut self, usage: &Usage) {
        if let Some(emitter) = self.emitter.as_mut() {
            emitter.set_usage(usage.clone());
        }
    }

    /// Marks the response as a stream without writing a byte.
    pub fn begin_stream(&mut self) {
        if !self.started {
            self.status = 200;
            self.content_type = Some(EVENT_STREAM);
        }
    }

    pub async fn send_chunk(&mut self, chunk: &ChatCompletionsStreamResponse) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        match self.dialect {
            ClientDialect::OpenAi => {
                let data = serde_json::to_string(chunk)?;
                self.write_sse(format!("data: {}\n\n", data)).await
            }
            ClientDialect::Claude => {
                let events = self
                    .emitter
                    .get_or_insert_with(|| ClaudeStreamEmitter::new(chunk.model.clone(), 0))
                    .on_chunk(chunk);
                self.write_claude_events(events).await
            }
        }
    }

    /// Forwards an OpenAI `data:` payload unchanged. A Claude caller gets it
    /// re-elevated instead.
    pub async fn send_raw_data(&mut self, data: &str) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        match self.dialect {
            ClientDialect::OpenAi => self.write_sse(format!("data: {}\n\n", data)).await,
            ClientDialect::Claude => {
                let chunk: ChatCompletionsStreamResponse = serde_json::from_str(data)?;
                self.send_chunk(&chunk).await
            }
        }
    }

    /// Native Claude SSE event.
    pub async fn send_claude_event(&mut self, name: &str, payload: &impl Serialize) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        let data = serde_json::to_string(payload)?;
        self.write_sse(format!("event: {}\ndata: {}\n\n", name, data)).await
    }

    /// Native Claude SSE event whose payload is already serialized.
    pub async fn send_claude_raw(&mut self, name: &str, data: &str) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.write_sse(format!("event: {}\ndata: {}\n\n", name, data)).await
    }

    /// Ends the stream: `[DONE]` for OpenAI callers, `message_delta` and
    /// `message_stop` for re-elevated Claude callers. Idempotent.
    pub async fn send_done(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        match self.dialect {
            ClientDialect::OpenAi => self.write_sse(format!("data: {}\n\n", DONE_SIGNAL)).await?,
            ClientDialect::Claude => {
                if let Some(emitter) = self.emitter.as_mut() {
                    let events = emitter.finish();
                    self.write_claude_events(events).await?;
                }
            }
        }
        self.closed = true;
        Ok(())
    }

    /// Marks a natively passed-through Claude stream as complete.
    pub fn close(&mut self) {
        self.closed = true;
    }

    pub async fn send_completion(&mut self, resp: &TextResponse) -> Result<()> {
        match self.dialect {
            ClientDialect::OpenAi => self.send_json(200, resp).await,
            ClientDialect::Claude => {
                let claude = openai_to_claude_response(resp);
                self.send_json(200, &claude).await
            }
        }
    }

    pub async fn send_claude_response(&mut self, resp: &ClaudeResponse) -> Result<()> {
        self.send_json(200, resp).await
    }

    pub async fn send_json(&mut self, status: u16, body: &impl Serialize) -> Result<()> {
        let data = serde_json::to_vec(body)?;
        self.write(status, APPLICATION_JSON, &data).await?;
        self.closed = true;
        Ok(())
    }

    pub async fn send_bytes(&mut self, status: u16, content_type: &'static str, body: Bytes) -> Result<()> {
        self.write(status, content_type, &body).await?;
        self.closed = true;
        Ok(())
    }

    /// Reports `err` to the caller.
    ///
    /// Before the first byte this is a JSON error body with the error's
    /// status. Mid-stream it is a terminal error event in the caller's
    /// protocol, after which the writer ignores further output.
    pub async fn send_error(&mut self, err: &Error) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        let streaming = self.started && self.content_type == Some(EVENT_STREAM);
        let result = match (self.dialect, streaming) {
            (ClientDialect::OpenAi, false) => self.send_json(err.status(), &err.to_openai_body()).await,
            (ClientDialect::Claude, false) => self.send_json(err.status(), &err.to_claude_body()).await,
            (ClientDialect::OpenAi, true) => {
                let data = serde_json::to_string(&err.to_openai_body())?;
                self.write_sse(format!("data: {}\n\n", data)).await
            }
            (ClientDialect::Claude, true) => {
                let body = err.to_claude_body();
                self.send_claude_event("error", &body).await
            }
        };
        self.closed = true;
        result
    }
}
