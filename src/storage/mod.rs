//! 对象存储：把图像生成返回的 base64 数据上传到 S3/R2 兼容存储并换成 URL。
//!
//! # Object storage
//!
//! | Variable | R2 | Generic S3 |
//! |----------|----|------------|
//! | account / endpoint | `CLOUDFLARE_R2_ACCOUNT_ID` | `S3_ENDPOINT` |
//! | access key | `CLOUDFLARE_R2_ACCESS_KEY_ID` | `S3_ACCESS_KEY_ID` |
//! | secret key | `CLOUDFLARE_R2_SECRET_ACCESS_KEY` | `S3_SECRET_ACCESS_KEY` |
//! | bucket | `CLOUDFLARE_R2_BUCKET` | `S3_BUCKET` |
//! | public URL prefix | `CLOUDFLARE_R2_PUBLIC_URL` | `S3_PUBLIC_URL` |
//! | region | `auto` | `S3_REGION` (default `us-east-1`) |
//!
//! R2 variables win when both sets are present. Without either, images are
//! returned to the caller as `b64_json`.

use crate::transport::signing::SigV4;
use crate::transport::{http, UpstreamResponse};
use crate::types::ImageData;
use crate::{Error, ErrorContext, Result};
use async_trait::async_trait;
use base64::Engine;
use bytes::Bytes;
use once_cell::sync::Lazy;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use reqwest::Method;
use std::env;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Somewhere generated media can be put and later fetched by URL.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Stores `body` under `key` and returns its public URL.
    async fn put(&self, cancel: &CancellationToken, key: &str, content_type: &str, body: Bytes) -> Result<String>;
}

/// Path-style S3 API endpoint (AWS S3, Cloudflare R2, MinIO).
#[derive(Debug, Clone, PartialEq)]
pub struct S3CompatibleStore {
    pub endpoint: String,
    pub bucket: String,
    pub region: String,
    pub access_key: String,
    pub secret_key: String,
    /// Prefix of returned URLs; the object URL itself when unset.
    pub public_url: Option<String>,
}

fn var(name: &str) -> Option<String> {
    env::var(name).ok().map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

impl S3CompatibleStore {
    pub fn from_env() -> Option<Self> {
        if let (Some(account), Some(access_key), Some(secret_key), Some(bucket)) = (
            var("CLOUDFLARE_R2_ACCOUNT_ID"),
            var("CLOUDFLARE_R2_ACCESS_KEY_ID"),
            var("CLOUDFLARE_R2_SECRET_ACCESS_KEY"),
            var("CLOUDFLARE_R2_BUCKET"),
        ) {
            return Some(Self {
                endpoint: format!("https://{}.r2.cloudflarestorage.com", account),
                bucket,
                region: "auto".to_string(),
                access_key,
                secret_key,
                public_url: var("CLOUDFLARE_R2_PUBLIC_URL"),
            });
        }
        Some(Self {
            endpoint: var("S3_ENDPOINT")?,
            bucket: var("S3_BUCKET")?,
            region: var("S3_REGION").unwrap_or_else(|| "us-east-1".to_string()),
            access_key: var("S3_ACCESS_KEY_ID")?,
            secret_key: var("S3_SECRET_ACCESS_KEY")?,
            public_url: var("S3_PUBLIC_URL"),
        })
    }

    pub fn object_url(&self, key: &str) -> String {
        format!("{}/{}/{}", self.endpoint.trim_end_matches('/'), self.bucket, key)
    }

    fn public_url_of(&self, key: &str) -> String {
        match &self.public_url {
            Some(prefix) => format!("{}/{}", prefix.trim_end_matches('/'), key),
            None => self.object_url(key),
        }
    }
}

#[async_trait]
impl ObjectStore for S3CompatibleStore {
    async fn put(&self, cancel: &CancellationToken, key: &str, content_type: &str, body: Bytes) -> Result<String> {
        let url = self.object_url(key);
        let parsed = url::Url::parse(&url).map_err(|e| {
            Error::config_missing(
                format!("object store endpoint is not a valid URL: {}", e),
                ErrorContext::new().with_field_path("S3_ENDPOINT"),
            )
        })?;
        let mut headers = HeaderMap::new();
        headers.insert(
            CONTENT_TYPE,
            HeaderValue::from_str(content_type).unwrap_or(HeaderValue::from_static("application/octet-stream")),
        );
        let signer = SigV4::new(&self.access_key, &self.secret_key, &self.region, "s3");
        signer.sign("PUT", &parsed, &mut headers, &body, chrono::Utc::now())?;

        let resp: UpstreamResponse = http::send(cancel, Method::PUT, &url, headers, Some(body.to_vec())).await?;
        if !resp.is_success() {
            let status = resp.status;
            let text = http::collect_body(cancel, resp).await?;
            tracing::warn!(status, bucket = %self.bucket, key, "object upload failed");
            return Err(Error::from_upstream_body(status, &text));
        }
        tracing::debug!(bucket = %self.bucket, key, "object uploaded");
        Ok(self.public_url_of(key))
    }
}

static DEFAULT_STORE: Lazy<Option<Arc<dyn ObjectStore>>> = Lazy::new(|| {
    S3CompatibleStore::from_env().map(|s| {
        tracing::info!(endpoint = %s.endpoint, bucket = %s.bucket, "object store configured");
        Arc::new(s) as Arc<dyn ObjectStore>
    })
});

/// The store configured through the environment, if any.
pub fn default_store() -> Option<Arc<dyn ObjectStore>> {
    DEFAULT_STORE.clone()
}

fn extension(mime: &str) -> &'static str {
    match mime {
        "image/jpeg" | "image/jpg" => "jpg",
        "image/webp" => "webp",
        "image/gif" => "gif",
        "video/mp4" => "mp4",
        _ => "png",
    }
}

/// `generated/<yyyy>/<mm>/<dd>/<uuid>.<ext>`
pub fn object_key(mime: &str) -> String {
    format!(
        "generated/{}/{}.{}",
        chrono::Utc::now().format("%Y/%m/%d"),
        uuid::Uuid::new_v4().simple(),
        extension(mime)
    )
}

/// Uploads base64 images and returns them as URLs. Without a store, or when
/// an upload fails, the image stays inline as `b64_json`.
pub async fn publish_images(
    store: Option<&dyn ObjectStore>,
    cancel: &CancellationToken,
    images: Vec<(String, String)>,
) -> Result<Vec<ImageData>> {
    let mut out = Vec::with_capacity(images.len());
    for (mime, b64) in images {
        let Some(store) = store else {
            out.push(ImageData {
                b64_json: Some(b64),
                ..Default::default()
            });
            continue;
        };
        let raw = base64::engine::general_purpose::STANDARD
            .decode(b64.as_bytes())
            .map_err(|e| Error::unmarshal_with_context(e.to_string(), ErrorContext::new().with_source("storage")))?;
        match store.put(cancel, &object_key(&mime), &mime, Bytes::from(raw)).await {
            Ok(url) => out.push(ImageData {
                url: Some(url),
                ..Default::default()
            }),
            Err(e) => {
                tracing::warn!(error = %e, "falling back to inline image");
                out.push(ImageData {
                    b64_json: Some(b64),
                    ..Default::default()
                });
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(endpoint: &str) -> S3CompatibleStore {
        S3CompatibleStore {
            endpoint: endpoint.to_string(),
            bucket: "media".into(),
            region: "auto".into(),
            access_key: "AK".into(),
            secret_key: "SK".into(),
            public_url: Some("https://cdn.example.com/".into()),
        }
    }

    #[test]
    fn test_object_key_shape() {
        let key = object_key("image/jpeg");
        assert!(key.starts_with("generated/"));
        assert!(key.ends_with(".jpg"));
    }

    #[tokio::test]
    async fn test_put_signs_and_returns_public_url() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("PUT", "/media/a.png")
            .match_header("x-amz-content-sha256", mockito::Matcher::Any)
            .match_header("authorization", mockito::Matcher::Regex("^AWS4-HMAC-SHA256 ".into()))
            .with_status(200)
            .create_async()
            .await;
        let s = store(&server.url());
        let url = s
            .put(&CancellationToken::new(), "a.png", "image/png", Bytes::from_static(b"png"))
            .await
            .unwrap();
        assert_eq!(url, "https://cdn.example.com/a.png");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_images_stay_inline_without_store() {
        let images = publish_images(None, &CancellationToken::new(), vec![("image/png".into(), "AAAA".into())])
            .await
            .unwrap();
        assert_eq!(images[0].b64_json.as_deref(), Some("AAAA"));
        assert!(images[0].url.is_none());
    }
}
