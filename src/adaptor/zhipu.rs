//! 智谱 BigModel（GLM）适配器。
//!
//! The `/api/paas/v4` surface is OpenAI-shaped, so bodies and replies go
//! through the OpenAI helpers. Differences:
//!
//! - The API key is `id.secret` and is turned into a short-lived HS256 JWT
//!   (`sign_type: SIGN`, millisecond `exp`/`timestamp`). Tokens are cached
//!   per key.
//! - `temperature` and `top_p` are limited to `[0, 1]`.
//! - Images (CogView) go to `/images/generations`.

use super::common::{clamp, require_base, set_bearer};
use super::openai::{chat_body, compatible, embedding_body, handler};
use super::Adaptor;
use crate::context::RelayContext;
use crate::meta::{Meta, Mode};
use crate::pricing::{self, PricingMap};
use crate::stream::ResponseWriter;
use crate::transport::signing::hmac_sha256;
use crate::transport::UpstreamResponse;
use crate::types::{GeneralRequest, ImageRequest, Usage};
use crate::{Error, ErrorContext, Result};
use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use lru::LruCache;
use once_cell::sync::Lazy;
use reqwest::header::HeaderMap;
use serde_json::{json, Value};
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

/// Lifetime written into the token.
const TOKEN_TTL: Duration = Duration::from_secs(24 * 60 * 60);
/// Cached tokens are replaced this long before they expire.
const TOKEN_REFRESH_MARGIN: Duration = Duration::from_secs(5 * 60);

static TOKENS: Lazy<Mutex<LruCache<String, (String, Instant)>>> =
    Lazy::new(|| Mutex::new(LruCache::new(NonZeroUsize::new(256).unwrap_or(NonZeroUsize::MIN))));

/// Signs a BigModel JWT for `api_key` at `now_ms`.
pub fn sign_token(api_key: &str, now_ms: i64, ttl: Duration) -> Result<String> {
    let (id, secret) = api_key.split_once('.').ok_or_else(|| {
        Error::config_missing(
            "zhipu api key must look like `id.secret`",
            ErrorContext::new().with_field_path("api_key"),
        )
    })?;
    let header = json!({ "alg": "HS256", "sign_type": "SIGN" });
    let claims = json!({
        "api_key": id,
        "exp": now_ms + ttl.as_millis() as i64,
        "timestamp": now_ms,
    });
    let signing_input = format!(
        "{}.{}",
        URL_SAFE_NO_PAD.encode(header.to_string()),
        URL_SAFE_NO_PAD.encode(claims.to_string())
    );
    let signature = hmac_sha256(secret.as_bytes(), signing_input.as_bytes())?;
    Ok(format!("{}.{}", signing_input, URL_SAFE_NO_PAD.encode(signature)))
}

/// Cached token for `api_key`, signing a new one when missing or stale.
pub fn token(api_key: &str) -> Result<String> {
    let mut cache = TOKENS.lock().unwrap_or_else(PoisonError::into_inner);
    if let Some((token, expires_at)) = cache.get(api_key) {
        if *expires_at > Instant::now() {
            return Ok(token.clone());
        }
    }
    let token = sign_token(api_key, chrono::Utc::now().timestamp_millis(), TOKEN_TTL)?;
    let fresh_until = Instant::now() + TOKEN_TTL.saturating_sub(TOKEN_REFRESH_MARGIN);
    cache.put(api_key.to_string(), (token.clone(), fresh_until));
    Ok(token)
}

#[derive(Debug, Default)]
pub struct ZhipuAdaptor {
    meta: Meta,
}

#[async_trait]
impl Adaptor for ZhipuAdaptor {
    fn init(&mut self, meta: &Meta) {
        self.meta = meta.clone();
    }

    fn request_url(&self, meta: &Meta) -> Result<String> {
        Ok(format!("{}/api/paas/v4{}", require_base(meta)?, compatible::mode_path(meta.mode)))
    }

    fn setup_request_header(&self, headers: &mut HeaderMap, meta: &Meta) -> Result<()> {
        set_bearer(headers, &token(&meta.api_key)?)
    }

    async fn convert_request(
        &self,
        _ctx: &mut RelayContext,
        mode: Mode,
        request: &GeneralRequest,
    ) -> Result<Value> {
        match mode {
            Mode::ChatCompletions | Mode::ClaudeMessages => {
                let mut req = request.clone();
                req.temperature = clamp(req.temperature, 0.0, 1.0);
                req.top_p = clamp(req.top_p, 0.0, 1.0);
                chat_body(&req, &self.meta.actual_model_name, false)
            }
            Mode::Embeddings => embedding_body(request, &self.meta.actual_model_name),
            _ => Err(Error::mode_unsupported(&request.model, self.channel_name(), mode)),
        }
    }

    async fn convert_image_request(&self, _ctx: &mut RelayContext, request: &ImageRequest) -> Result<Value> {
        let mut body = json!({
            "model": self.meta.actual_model_name,
            "prompt": request.prompt,
        });
        if let Some(size) = request.size.as_deref() {
            body["size"] = json!(size);
        }
        if let Some(user) = request.user.as_deref() {
            body["user_id"] = json!(user);
        }
        Ok(body)
    }

    async fn do_response(
        &self,
        ctx: &mut RelayContext,
        resp: UpstreamResponse,
        meta: &Meta,
        out: &mut ResponseWriter<'_>,
    ) -> Result<Usage> {
        match meta.mode {
            Mode::Embeddings => handler::embedding_handler(ctx, resp, meta, out).await,
            Mode::ImagesGenerations => handler::image_handler(ctx, resp, meta, out).await,
            _ if meta.is_stream => handler::stream_handler(ctx, resp, meta, out).await,
            _ => handler::handler(ctx, resp, meta, out).await,
        }
    }

    fn default_model_pricing(&self) -> Arc<PricingMap> {
        pricing::table("zhipu")
    }

    fn channel_name(&self) -> &'static str {
        "zhipu"
    }
}
