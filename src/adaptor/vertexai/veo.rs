//! Veo on Vertex: `predictLongRunning` returns an operation name, which is
//! polled through `fetchPredictOperation` until it is done.
//!
//! The first poll goes out immediately; later ones wait
//! [`RelayConfig::video_poll_interval`]. Cancellation is checked between
//! ticks and ends the wait without an error and without billing. Completion
//! tokens are `duration_seconds × TOKENS_PER_SEC`.

use super::model_url;
use crate::adaptor::common::{read_checked_json, set_bearer};
use crate::config::RelayConfig;
use crate::context::RelayContext;
use crate::meta::Meta;
use crate::pricing::TOKENS_PER_SEC;
use crate::storage::{default_store, object_key, ObjectStore};
use crate::stream::ResponseWriter;
use crate::transport::{http, UpstreamResponse};
use crate::types::response::unix_now;
use crate::types::{Usage, VideoData, VideoRequest, VideoResponse};
use crate::{Error, ErrorContext, Result};
use base64::Engine;
use bytes::Bytes;
use reqwest::header::HeaderMap;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::{Duration, Instant};

/// Longest a single generation is waited for.
pub const MAX_WAIT: Duration = Duration::from_secs(20 * 60);

pub fn request_body(request: &VideoRequest) -> Value {
    let mut parameters = json!({
        "durationSeconds": request.duration(),
        "sampleCount": request.n.filter(|n| *n > 0).unwrap_or(1),
    });
    if let Some(ratio) = request.aspect_ratio.as_deref().filter(|r| !r.is_empty()) {
        parameters["aspectRatio"] = json!(ratio);
    }
    if let Some(negative) = request.negative_prompt.as_deref().filter(|n| !n.is_empty()) {
        parameters["negativePrompt"] = json!(negative);
    }
    if let Some(uri) = request.storage_uri.as_deref().filter(|u| !u.is_empty()) {
        parameters["storageUri"] = json!(uri);
    }
    json!({
        "instances": [{ "prompt": request.prompt }],
        "parameters": parameters,
    })
}

#[derive(Debug, Deserialize)]
struct OperationRef {
    name: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct Operation {
    #[serde(default)]
    pub done: bool,
    #[serde(default)]
    pub response: Option<OperationResponse>,
    #[serde(default)]
    pub error: Option<OperationError>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationResponse {
    #[serde(default)]
    pub videos: Vec<GeneratedVideo>,
    #[serde(default)]
    pub rai_media_filtered_count: u32,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeneratedVideo {
    #[serde(default)]
    pub gcs_uri: Option<String>,
    #[serde(default)]
    pub bytes_base64_encoded: Option<String>,
    #[serde(default)]
    pub mime_type: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct OperationError {
    #[serde(default)]
    pub code: i64,
    #[serde(default)]
    pub message: String,
}

async fn poll_once(ctx: &RelayContext, meta: &Meta, operation: &str) -> Result<Operation> {
    let url = model_url(meta, &meta.actual_model_name, "fetchPredictOperation")?;
    let mut headers = HeaderMap::new();
    set_bearer(&mut headers, &meta.api_key)?;
    let resp = http::post_json(ctx.cancellation(), &url, headers, &json!({ "operationName": operation })).await?;
    read_checked_json(ctx.cancellation(), resp, "vertexai.veo").await
}

/// Polls `operation` until done. `None` when the caller cancelled.
pub async fn wait_for(ctx: &RelayContext, meta: &Meta, operation: &str, interval: Duration) -> Result<Option<Operation>> {
    let started = Instant::now();
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        let op = match poll_once(ctx, meta, operation).await {
            Ok(op) => op,
            Err(_) if ctx.is_cancelled() => return Ok(None),
            Err(e) => return Err(e),
        };
        if op.done {
            tracing::debug!(operation, attempt, elapsed_ms = started.elapsed().as_millis() as u64, "video operation finished");
            return Ok(Some(op));
        }
        if started.elapsed() >= MAX_WAIT {
            return Err(Error::Upstream {
                status: 504,
                message: format!("video operation {} did not finish in time", operation),
                provider_code: None,
            });
        }
        tokio::select! {
            _ = ctx.cancellation().cancelled() => return Ok(None),
            _ = tokio::time::sleep(interval) => {}
        }
    }
}

async fn video_url(ctx: &RelayContext, store: Option<&dyn ObjectStore>, video: GeneratedVideo) -> Result<Option<VideoData>> {
    let mime = video.mime_type.unwrap_or_else(|| "video/mp4".to_string());
    if let Some(uri) = video.gcs_uri.filter(|u| !u.is_empty()) {
        return Ok(Some(VideoData {
            url: uri,
            mime_type: Some(mime),
        }));
    }
    let Some(b64) = video.bytes_base64_encoded.filter(|b| !b.is_empty()) else {
        return Ok(None);
    };
    let url = match store {
        Some(store) => {
            let raw = base64::engine::general_purpose::STANDARD
                .decode(b64.as_bytes())
                .map_err(|e| Error::unmarshal_with_context(e.to_string(), ErrorContext::new().with_source("vertexai.veo")))?;
            store.put(ctx.cancellation(), &object_key(&mime), &mime, Bytes::from(raw)).await?
        }
        None => format!("data:{};base64,{}", mime, b64),
    };
    Ok(Some(VideoData {
        url,
        mime_type: Some(mime),
    }))
}

pub async fn handler(
    ctx: &mut RelayContext,
    resp: UpstreamResponse,
    meta: &Meta,
    out: &mut ResponseWriter<'_>,
) -> Result<Usage> {
    let started: OperationRef = read_checked_json(ctx.cancellation(), resp, "vertexai.veo").await?;
    tracing::info!(operation = %started.name, model = %meta.actual_model_name, "video generation started");

    let interval = RelayConfig::global().video_poll_interval();
    let Some(op) = wait_for(ctx, meta, &started.name, interval).await? else {
        tracing::debug!(operation = %started.name, "caller went away while video was generating");
        return Ok(Usage::default());
    };
    if let Some(err) = op.error {
        return Err(Error::Upstream {
            status: 502,
            message: err.message,
            provider_code: Some(err.code.to_string()),
        });
    }
    let response = op.response.unwrap_or_default();
    let store = default_store();
    let mut data = Vec::new();
    for video in response.videos {
        if let Some(v) = video_url(ctx, store.as_deref(), video).await? {
            data.push(v);
        }
    }
    if data.is_empty() {
        return Err(Error::Upstream {
            status: 400,
            message: format!(
                "video generation returned nothing ({} filtered)",
                response.rai_media_filtered_count
            ),
            provider_code: Some("rai_filtered".to_string()),
        });
    }

    let seconds = ctx.video_seconds.unwrap_or(VideoRequest::DEFAULT_DURATION_SECONDS) as u64;
    let usage = Usage::new(0, seconds * TOKENS_PER_SEC);
    let reply = VideoResponse {
        id: started.name,
        model: meta.actual_model_name.clone(),
        created: unix_now(),
        status: "succeeded".to_string(),
        data,
        usage: usage.clone(),
    };
    out.send_json(200, &reply).await?;
    Ok(usage)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::{ChannelConfig, ChannelType, Mode};
    use tokio_util::sync::CancellationToken;

    fn meta(base: &str) -> Meta {
        Meta::new(ChannelType::VertexAI, "veo-2.0-generate-001")
            .with_base_url(base)
            .with_api_key("ya29.token")
            .with_mode(Mode::VideoGenerations)
            .with_config(ChannelConfig {
                project_id: Some("proj".into()),
                ..Default::default()
            })
    }

    #[test]
    fn test_request_body() {
        let req = VideoRequest {
            prompt: "waves".into(),
            aspect_ratio: Some("16:9".into()),
            storage_uri: Some("gs://bucket/out/".into()),
            ..Default::default()
        };
        let body = request_body(&req);
        assert_eq!(body["parameters"]["durationSeconds"], 8);
        assert_eq!(body["parameters"]["storageUri"], "gs://bucket/out/");
    }

    #[tokio::test]
    async fn test_polls_until_done_and_bills_seconds() {
        let mut server = mockito::Server::new_async().await;
        let poll = server
            .mock(
                "POST",
                "/v1/projects/proj/locations/us-central1/publishers/google/models/veo-2.0-generate-001:fetchPredictOperation",
            )
            .match_header("authorization", "Bearer ya29.token")
            .with_status(200)
            .with_body(r#"{"done":true,"response":{"videos":[{"gcsUri":"gs://b/v.mp4","mimeType":"video/mp4"}]}}"#)
            .create_async()
            .await;

        let mut ctx = RelayContext::default();
        ctx.video_seconds = Some(5);
        let resp = UpstreamResponse::from_bytes(200, "application/json", r#"{"name":"projects/proj/operations/op1"}"#);
        let mut sink = Vec::new();
        let mut out = ResponseWriter::openai(&mut sink);
        let usage = handler(&mut ctx, resp, &meta(&server.url()), &mut out).await.unwrap();
        assert_eq!(usage.completion_tokens, 5 * TOKENS_PER_SEC);
        assert_eq!(usage.total_tokens, usage.prompt_tokens + usage.completion_tokens);
        drop(out);
        let body: Value = serde_json::from_slice(&sink).unwrap();
        assert_eq!(body["data"][0]["url"], "gs://b/v.mp4");
        poll.assert_async().await;
    }

    #[tokio::test]
    async fn test_cancel_stops_waiting() {
        let mut server = mockito::Server::new_async().await;
        let _poll = server
            .mock("POST", mockito::Matcher::Any)
            .with_status(200)
            .with_body(r#"{"done":false}"#)
            .create_async()
            .await;
        let token = CancellationToken::new();
        let ctx = RelayContext::default().with_cancellation(token.clone());
        let m = meta(&server.url());
        let waiter = wait_for(&ctx, &m, "op", Duration::from_secs(3600));
        token.cancel();
        assert!(waiter.await.unwrap().is_none());
    }
}
