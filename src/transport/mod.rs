//! 传输层：共享 HTTP 客户端、上游响应抽象与请求签名。
//!
//! Transport layer.
//!
//! | Item | Description |
//! |------|-------------|
//! | [`UpstreamResponse`] | Status, headers and a byte stream; built from reqwest or any other source |
//! | [`http`] | Shared `reqwest` client, cancellable send and body collection |
//! | [`signing`] | HMAC helpers, AWS SigV4 and Tencent TC3 |
//! | [`eventstream`] | `application/vnd.amazon.eventstream` frame decoder |
//! | [`websocket`] | One-shot WebSocket exchange with frames as body lines |
//!
//! Backends that do not speak plain HTTP (Xunfei over WebSocket) still hand
//! their frames to the response translators as an [`UpstreamResponse`], so
//! every `do_response` reads the same type.

pub mod eventstream;
pub mod http;
pub mod signing;
pub mod websocket;

use crate::BoxStream;
use bytes::Bytes;
use futures::{stream, StreamExt, TryStreamExt};
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(String),

    #[error("request cancelled")]
    Cancelled,

    #[error("Transport error: {0}")]
    Other(String),
}

/// A backend response: status line, headers and the body as a byte stream.
pub struct UpstreamResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: BoxStream<'static, Bytes>,
}

impl UpstreamResponse {
    pub fn new(status: u16, headers: HeaderMap, body: BoxStream<'static, Bytes>) -> Self {
        Self {
            status,
            headers,
            body,
        }
    }

    /// Wraps a fully buffered body.
    pub fn from_bytes(status: u16, content_type: &str, body: impl Into<Bytes>) -> Self {
        let body: Bytes = body.into();
        Self::from_chunks(status, content_type, vec![body])
    }

    /// Wraps a body that arrives in the given pieces; useful for exercising line framing.
    pub fn from_chunks(status: u16, content_type: &str, chunks: Vec<Bytes>) -> Self {
        let mut headers = HeaderMap::new();
        if let Ok(v) = HeaderValue::from_str(content_type) {
            headers.insert(CONTENT_TYPE, v);
        }
        Self {
            status,
            headers,
            body: Box::pin(stream::iter(chunks.into_iter().map(Ok))),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn content_type(&self) -> Option<&str> {
        self.headers.get(CONTENT_TYPE).and_then(|v| v.to_str().ok())
    }

    pub fn is_event_stream(&self) -> bool {
        self.content_type()
            .map_or(false, |ct| ct.starts_with("text/event-stream"))
    }
}

impl From<reqwest::Response> for UpstreamResponse {
    fn from(resp: reqwest::Response) -> Self {
        let status = resp.status().as_u16();
        let headers = resp.headers().clone();
        let body = resp
            .bytes_stream()
            .map_err(|e| crate::Error::Transport(TransportError::Http(e)))
            .boxed();
        Self {
            status,
            headers,
            body,
        }
    }
}

impl std::fmt::Debug for UpstreamResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamResponse")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}
