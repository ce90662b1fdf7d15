//! One-shot WebSocket exchanges presented as an [`UpstreamResponse`].
//!
//! The request is sent as a single text frame; every text frame the server
//! sends back becomes one `\n`-terminated line of the body, so response
//! translators read it with the same line reader they use for HTTP streams.

use super::{TransportError, UpstreamResponse};
use crate::{Error, Result};
use bytes::Bytes;
use futures::{stream, SinkExt, StreamExt};
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

/// Content type of the synthesized body.
pub const LINES_CONTENT_TYPE: &str = "application/x-ndjson";

fn ws_error(e: impl std::fmt::Display) -> Error {
    Error::Transport(TransportError::WebSocket(e.to_string()))
}

/// Connects to `url`, sends `request` and streams the replies.
///
/// The body ends when the server closes the socket. A handshake rejected
/// with an HTTP status surfaces as an upstream error carrying that status.
pub async fn exchange(cancel: &CancellationToken, url: &str, request: String) -> Result<UpstreamResponse> {
    let connect = tokio_tungstenite::connect_async(url);
    let (socket, _) = tokio::select! {
        _ = cancel.cancelled() => return Err(Error::Transport(TransportError::Cancelled)),
        r = connect => r.map_err(|e| match e {
            tokio_tungstenite::tungstenite::Error::Http(resp) => {
                let status = resp.status().as_u16();
                let body = resp.body().clone().unwrap_or_default();
                Error::from_upstream_body(status, &body)
            }
            other => ws_error(other),
        })?,
    };
    let (mut sink, source) = socket.split();
    sink.send(Message::Text(request)).await.map_err(ws_error)?;
    tracing::debug!(host = %super::http::redact_query(url), "websocket request sent");

    let body = stream::unfold((source, sink, false), |(mut source, sink, done)| async move {
        if done {
            return None;
        }
        loop {
            match source.next().await {
                Some(Ok(Message::Text(text))) => {
                    let mut line = text.into_bytes();
                    line.push(b'\n');
                    return Some((Ok(Bytes::from(line)), (source, sink, false)));
                }
                Some(Ok(Message::Close(_))) | None => return None,
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Some((Err(ws_error(e)), (source, sink, true))),
            }
        }
    });

    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static(LINES_CONTENT_TYPE));
    Ok(UpstreamResponse::new(200, headers, Box::pin(body)))
}
