use super::{TransportError, UpstreamResponse};
use crate::config::RelayConfig;
use crate::{Error, ErrorContext, Result};
use base64::Engine as _;
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use once_cell::sync::OnceCell;
use reqwest::header::{HeaderMap, CONTENT_TYPE};
use reqwest::{Method, Proxy};
use tokio_util::sync::CancellationToken;

static CLIENT: OnceCell<reqwest::Client> = OnceCell::new();

fn build_client(cfg: &RelayConfig) -> Result<reqwest::Client> {
    // No overall request timeout: streams live as long as the caller's context.
    let mut builder = reqwest::Client::builder()
        .connect_timeout(cfg.connect_timeout())
        .pool_max_idle_per_host(cfg.pool_max_idle_per_host)
        .pool_idle_timeout(Some(cfg.pool_idle_timeout()))
        .http2_adaptive_window(true)
        .http2_keep_alive_interval(Some(std::time::Duration::from_secs(30)))
        .http2_keep_alive_timeout(std::time::Duration::from_secs(10));

    if let Some(proxy_url) = cfg.proxy_url.as_deref() {
        match Proxy::all(proxy_url) {
            Ok(proxy) => builder = builder.proxy(proxy),
            Err(e) => tracing::warn!(proxy = proxy_url, error = %e, "ignoring invalid proxy url"),
        }
    }

    builder
        .build()
        .map_err(|e| Error::Transport(TransportError::Other(e.to_string())))
}

/// Process-wide client, built from [`RelayConfig::global`] on first use.
pub fn shared_client() -> Result<&'static reqwest::Client> {
    CLIENT.get_or_try_init(|| build_client(&RelayConfig::global()))
}

/// Sends one request and returns as soon as headers arrive.
///
/// Cancellation of `cancel` aborts the in-flight call with
/// [`TransportError::Cancelled`].
pub async fn send(
    cancel: &CancellationToken,
    method: Method,
    url: &str,
    headers: HeaderMap,
    body: Option<Vec<u8>>,
) -> Result<UpstreamResponse> {
    let client = shared_client()?;
    let mut req = client.request(method.clone(), url).headers(headers);
    if let Some(body) = body {
        req = req.body(body);
    }

    let started = std::time::Instant::now();
    let resp = tokio::select! {
        _ = cancel.cancelled() => return Err(Error::Transport(TransportError::Cancelled)),
        r = req.send() => r.map_err(|e| Error::Transport(TransportError::Http(e)))?,
    };
    tracing::debug!(
        method = %method,
        url = %redact_query(url),
        status = resp.status().as_u16(),
        duration_ms = started.elapsed().as_millis() as u64,
        "upstream responded"
    );
    Ok(UpstreamResponse::from(resp))
}

/// POSTs a JSON body.
pub async fn post_json(
    cancel: &CancellationToken,
    url: &str,
    mut headers: HeaderMap,
    body: &serde_json::Value,
) -> Result<UpstreamResponse> {
    if !headers.contains_key(CONTENT_TYPE) {
        headers.insert(CONTENT_TYPE, reqwest::header::HeaderValue::from_static("application/json"));
    }
    send(cancel, Method::POST, url, headers, Some(serde_json::to_vec(body)?)).await
}

/// Reads the whole body. Cancellation yields [`TransportError::Cancelled`].
pub async fn collect_body(cancel: &CancellationToken, resp: UpstreamResponse) -> Result<Bytes> {
    let mut body = resp.body;
    let mut buf = BytesMut::new();
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Transport(TransportError::Cancelled)),
            n = body.next() => n,
        };
        match next {
            Some(Ok(chunk)) => buf.extend_from_slice(&chunk),
            Some(Err(e)) => return Err(e),
            None => break,
        }
    }
    Ok(buf.freeze())
}

/// Reads a JSON body into `T`, turning non-2xx statuses into upstream errors.
pub async fn read_json<T: serde::de::DeserializeOwned>(
    cancel: &CancellationToken,
    resp: UpstreamResponse,
    source: &str,
) -> Result<T> {
    let status = resp.status;
    let body = collect_body(cancel, resp).await?;
    if !(200..300).contains(&status) {
        return Err(Error::from_upstream_body(status, &body));
    }
    serde_json::from_slice(&body).map_err(|e| {
        Error::unmarshal_with_context(
            e.to_string(),
            ErrorContext::new()
                .with_source(source.to_string())
                .with_details(truncate_for_log(&body)),
        )
    })
}

/// Downloads an image and returns `(mime, base64 payload)`.
pub async fn fetch_image_base64(cancel: &CancellationToken, url: &str) -> Result<(String, String)> {
    let resp = send(cancel, Method::GET, url, HeaderMap::new(), None).await?;
    let status = resp.status;
    let mime = resp
        .content_type()
        .map(|ct| ct.split(';').next().unwrap_or(ct).trim().to_string())
        .unwrap_or_else(|| "image/jpeg".to_string());
    let body = collect_body(cancel, resp).await?;
    if !(200..300).contains(&status) {
        return Err(Error::from_upstream_body(status, &body));
    }
    Ok((mime, base64::engine::general_purpose::STANDARD.encode(&body)))
}

pub(crate) fn truncate_for_log(body: &[u8]) -> String {
    let text = String::from_utf8_lossy(body);
    text.chars().take(512).collect()
}

pub(crate) fn redact_query(url: &str) -> &str {
    url.split('?').next().unwrap_or(url)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_collect_body_joins_chunks() {
        let resp = UpstreamResponse::from_chunks(
            200,
            "application/json",
            vec![Bytes::from_static(b"{\"a\":"), Bytes::from_static(b"1}")],
        );
        let body = collect_body(&CancellationToken::new(), resp).await.unwrap();
        assert_eq!(&body[..], b"{\"a\":1}");
    }

    #[tokio::test]
    async fn test_read_json_maps_error_status() {
        let resp = UpstreamResponse::from_bytes(
            429,
            "application/json",
            r#"{"error":{"message":"slow down","type":"rate_limit"}}"#,
        );
        let err = read_json::<serde_json::Value>(&CancellationToken::new(), resp, "test")
            .await
            .unwrap_err();
        assert_eq!(err.status(), 429);
    }

    #[tokio::test]
    async fn test_collect_body_cancelled() {
        let token = CancellationToken::new();
        token.cancel();
        let resp = UpstreamResponse::new(
            200,
            HeaderMap::new(),
            Box::pin(futures::stream::pending()),
        );
        let err = collect_body(&token, resp).await.unwrap_err();
        assert!(matches!(err, Error::Transport(TransportError::Cancelled)));
    }

    #[test]
    fn test_redact_query() {
        assert_eq!(redact_query("https://a/b?access_token=x"), "https://a/b");
    }
}
