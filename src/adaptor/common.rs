//! Plumbing shared by every adaptor.

use super::Adaptor;
use crate::context::RelayContext;
use crate::meta::Meta;
use crate::transport::{http, UpstreamResponse};
use crate::{Error, ErrorContext, Result};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

/// Builds the URL and headers through the adaptor, then POSTs `body`.
pub async fn do_request_helper<A: Adaptor + ?Sized>(
    adaptor: &A,
    ctx: &RelayContext,
    meta: &Meta,
    body: &Value,
) -> Result<UpstreamResponse> {
    let url = adaptor.request_url(meta)?;
    let mut headers = HeaderMap::new();
    setup_common_headers(&mut headers, meta);
    adaptor.setup_request_header(&mut headers, meta)?;
    tracing::debug!(
        adaptor = adaptor.channel_name(),
        model = %meta.actual_model_name,
        stream = meta.is_stream,
        "forwarding request"
    );
    http::post_json(ctx.cancellation(), &url, headers, body).await
}

/// `Content-Type` plus `Accept: text/event-stream` for streams.
pub fn setup_common_headers(headers: &mut HeaderMap, meta: &Meta) {
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    if meta.is_stream && !headers.contains_key(ACCEPT) {
        headers.insert(ACCEPT, HeaderValue::from_static("text/event-stream"));
    }
}

pub fn header_value(value: &str) -> Result<HeaderValue> {
    HeaderValue::from_str(value).map_err(|e| {
        Error::invalid_request_with_context(
            "credential contains characters not allowed in a header",
            ErrorContext::new().with_details(e.to_string()),
        )
    })
}

pub fn set_header(headers: &mut HeaderMap, name: &'static str, value: &str) -> Result<()> {
    headers.insert(HeaderName::from_static(name), header_value(value)?);
    Ok(())
}

pub fn set_bearer(headers: &mut HeaderMap, token: &str) -> Result<()> {
    headers.insert(AUTHORIZATION, header_value(&format!("Bearer {}", token))?);
    Ok(())
}

/// Turns a non-2xx response into an upstream error, reading its body.
pub async fn check_status(cancel: &CancellationToken, resp: UpstreamResponse) -> Result<UpstreamResponse> {
    if resp.is_success() {
        return Ok(resp);
    }
    let status = resp.status;
    let body = http::collect_body(cancel, resp).await?;
    tracing::warn!(status, body = %http::truncate_for_log(&body), "upstream returned an error status");
    Err(Error::from_upstream_body(status, &body))
}

/// Reads a JSON body into `T`.
///
/// Non-2xx statuses and 200 responses whose body is an error envelope
/// (`{"error": {...}}`, Baidu `error_code`) both become upstream errors.
pub async fn read_checked_json<T: serde::de::DeserializeOwned>(
    cancel: &CancellationToken,
    resp: UpstreamResponse,
    source: &str,
) -> Result<T> {
    let status = resp.status;
    let body = http::collect_body(cancel, resp).await?;
    if !(200..300).contains(&status) {
        tracing::warn!(status, source, body = %http::truncate_for_log(&body), "upstream returned an error status");
        return Err(Error::from_upstream_body(status, &body));
    }
    let value: Value = serde_json::from_slice(&body).map_err(|e| {
        Error::unmarshal_with_context(
            e.to_string(),
            ErrorContext::new()
                .with_source(source.to_string())
                .with_details(http::truncate_for_log(&body)),
        )
    })?;
    if is_error_envelope(&value) {
        tracing::warn!(source, body = %http::truncate_for_log(&body), "upstream reported an error in a 2xx body");
        return Err(Error::from_upstream_body(502, &body));
    }
    serde_json::from_value(value).map_err(|e| {
        Error::unmarshal_with_context(
            e.to_string(),
            ErrorContext::new()
                .with_source(source.to_string())
                .with_details(http::truncate_for_log(&body)),
        )
    })
}

pub fn is_error_envelope(v: &Value) -> bool {
    let openai = v.get("error").map_or(false, |e| e.is_object() || e.is_string());
    let baidu = v.get("error_code").map_or(false, |c| !c.is_null() && c != 0);
    openai || baidu
}

/// Base URL of the channel, or a config error when none is configured.
pub fn require_base(meta: &Meta) -> Result<&str> {
    let base = meta.base();
    if base.is_empty() {
        return Err(Error::config_missing(
            format!("channel type {} needs a base URL", meta.channel_type.name()),
            ErrorContext::new().with_field_path("base_url"),
        ));
    }
    Ok(base)
}

/// Credential part `index` of a `|`-separated key, or a config error naming `what`.
pub fn key_part<'a>(meta: &'a Meta, index: usize, what: &str) -> Result<&'a str> {
    meta.key_parts()
        .get(index)
        .copied()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| {
            Error::config_missing(
                format!("api key is missing its {}", what),
                ErrorContext::new().with_field_path("api_key"),
            )
        })
}

/// Serializes `v`, failing as an internal error.
pub fn to_value<T: serde::Serialize>(v: &T) -> Result<Value> {
    serde_json::to_value(v).map_err(Error::from)
}

pub fn clamp(v: Option<f64>, lo: f64, hi: f64) -> Option<f64> {
    v.map(|x| x.clamp(lo, hi))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::ChannelType;

    #[test]
    fn test_key_part() {
        let meta = Meta::new(ChannelType::Xunfei, "Spark-Lite").with_api_key("app|key|");
        assert_eq!(key_part(&meta, 0, "app id").unwrap(), "app");
        assert!(matches!(key_part(&meta, 2, "secret"), Err(Error::ConfigMissing { .. })));
        assert!(key_part(&meta, 5, "x").is_err());
    }

    #[test]
    fn test_common_headers() {
        let mut h = HeaderMap::new();
        setup_common_headers(&mut h, &Meta::new(ChannelType::OpenAI, "m").with_stream(true));
        assert_eq!(h[ACCEPT], "text/event-stream");
        set_bearer(&mut h, "sk").unwrap();
        assert_eq!(h[AUTHORIZATION], "Bearer sk");
        assert!(set_bearer(&mut h, "bad\nkey").is_err());
    }

    #[test]
    fn test_error_envelope() {
        assert!(is_error_envelope(&serde_json::json!({"error": {"message": "x"}})));
        assert!(is_error_envelope(&serde_json::json!({"error_code": 110, "error_msg": "x"})));
        assert!(!is_error_envelope(&serde_json::json!({"error_code": 0, "result": "ok"})));
        assert!(!is_error_envelope(&serde_json::json!({"error": null, "choices": []})));
    }

    #[tokio::test]
    async fn test_read_checked_json_rejects_error_body() {
        let resp = UpstreamResponse::from_bytes(200, "application/json", r#"{"error":{"message":"quota"}}"#);
        let err = read_checked_json::<Value>(&CancellationToken::new(), resp, "t").await.unwrap_err();
        assert!(matches!(err, Error::Upstream { .. }));
        assert!(require_base(&Meta::new(ChannelType::Azure, "gpt-4")).is_err());
    }

    #[test]
    fn test_clamp() {
        assert_eq!(clamp(Some(1.5), 0.0, 1.0), Some(1.0));
        assert_eq!(clamp(None, 0.0, 1.0), None);
    }
}
