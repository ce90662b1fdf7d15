//! Imagen on Vertex: `predict` with `instances[].prompt`, images come back
//! as base64 and are published through the object store.

use crate::adaptor::common::read_checked_json;
use crate::context::RelayContext;
use crate::meta::Meta;
use crate::storage::{default_store, publish_images};
use crate::stream::ResponseWriter;
use crate::transport::UpstreamResponse;
use crate::types::response::unix_now;
use crate::types::{ImageRequest, ImageResponse, Usage};
use crate::{Error, Result};
use serde::Deserialize;
use serde_json::{json, Value};

pub fn request_body(request: &ImageRequest) -> Value {
    let mut parameters = json!({ "sampleCount": request.count() });
    if let Some(ratio) = request.aspect_ratio() {
        parameters["aspectRatio"] = json!(ratio);
    }
    if let Some(negative) = request.negative_prompt.as_deref().filter(|n| !n.is_empty()) {
        parameters["negativePrompt"] = json!(negative);
    }
    json!({
        "instances": [{ "prompt": request.prompt }],
        "parameters": parameters,
    })
}

#[derive(Debug, Deserialize)]
struct PredictReply {
    #[serde(default)]
    predictions: Vec<Prediction>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Prediction {
    #[serde(default)]
    bytes_base64_encoded: Option<String>,
    #[serde(default)]
    mime_type: Option<String>,
    #[serde(default)]
    rai_filtered_reason: Option<String>,
}

/// Images are billed per picture; filtered predictions are skipped.
pub async fn handler(
    ctx: &mut RelayContext,
    resp: UpstreamResponse,
    meta: &Meta,
    out: &mut ResponseWriter<'_>,
) -> Result<Usage> {
    let body: PredictReply = read_checked_json(ctx.cancellation(), resp, "vertexai.imagen").await?;
    let mut images = Vec::new();
    for p in body.predictions {
        match p.bytes_base64_encoded {
            Some(b64) if !b64.is_empty() => {
                images.push((p.mime_type.unwrap_or_else(|| "image/png".to_string()), b64));
            }
            _ => {
                tracing::debug!(model = %meta.actual_model_name, reason = ?p.rai_filtered_reason, "imagen prediction filtered");
            }
        }
    }
    if images.is_empty() {
        return Err(Error::Upstream {
            status: 400,
            message: "imagen returned no images, the prompt may have been filtered".to_string(),
            provider_code: Some("rai_filtered".to_string()),
        });
    }
    let store = default_store();
    let data = publish_images(store.as_deref(), ctx.cancellation(), images).await?;
    let usage = Usage::new(data.len() as u64, 0);
    out.send_json(200, &ImageResponse { created: unix_now(), data }).await?;
    Ok(usage)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::ChannelType;

    #[test]
    fn test_request_body() {
        let req = ImageRequest {
            prompt: "a lighthouse".into(),
            n: Some(2),
            size: Some("1792x1024".into()),
            negative_prompt: Some("fog".into()),
            ..Default::default()
        };
        let body = request_body(&req);
        assert_eq!(body["instances"][0]["prompt"], "a lighthouse");
        assert_eq!(body["parameters"]["sampleCount"], 2);
        assert_eq!(body["parameters"]["aspectRatio"], "7:4");
        assert_eq!(body["parameters"]["negativePrompt"], "fog");
    }

    #[tokio::test]
    async fn test_all_filtered_is_an_error() {
        let resp = UpstreamResponse::from_bytes(
            200,
            "application/json",
            r#"{"predictions":[{"raiFilteredReason":"blocked"}]}"#,
        );
        let mut sink = Vec::new();
        let mut out = ResponseWriter::openai(&mut sink);
        let meta = Meta::new(ChannelType::VertexAI, "imagen-3.0-generate-002");
        let err = handler(&mut RelayContext::default(), resp, &meta, &mut out)
            .await
            .unwrap_err();
        assert_eq!(err.status(), 400);
    }
}
