//! Groq：OpenAI 兼容接口（挂在 `/openai/v1` 下）。
//!
//! Groq rejects `n > 1`, `logit_bias` and vendor routing blocks, and takes
//! `reasoning_format` instead of a thinking block.

use super::common::{require_base, set_bearer};
use super::openai::{chat_body, compatible, handler};
use super::Adaptor;
use crate::context::RelayContext;
use crate::meta::{Meta, Mode};
use crate::pricing::{self, PricingMap};
use crate::stream::ResponseWriter;
use crate::transport::UpstreamResponse;
use crate::types::{GeneralRequest, Usage};
use crate::{Error, Result};
use async_trait::async_trait;
use reqwest::header::HeaderMap;
use serde_json::Value;
use std::sync::Arc;

#[derive(Debug, Default)]
pub struct GroqAdaptor {
    meta: Meta,
}

#[async_trait]
impl Adaptor for GroqAdaptor {
    fn init(&mut self, meta: &Meta) {
        self.meta = meta.clone();
    }

    fn request_url(&self, meta: &Meta) -> Result<String> {
        Ok(format!("{}/v1{}", require_base(meta)?, compatible::mode_path(meta.mode)))
    }

    fn setup_request_header(&self, headers: &mut HeaderMap, meta: &Meta) -> Result<()> {
        set_bearer(headers, &meta.api_key)
    }

    async fn convert_request(
        &self,
        _ctx: &mut RelayContext,
        mode: Mode,
        request: &GeneralRequest,
    ) -> Result<Value> {
        if !matches!(mode, Mode::ChatCompletions | Mode::ClaudeMessages) {
            return Err(Error::mode_unsupported(&request.model, self.channel_name(), mode));
        }
        let mut body = chat_body(request, &self.meta.actual_model_name, false)?;
        if let Some(obj) = body.as_object_mut() {
            obj.remove("n");
            obj.remove("logit_bias");
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
        if meta.is_stream {
            handler::stream_handler(ctx, resp, meta, out).await
        } else {
            handler::handler(ctx, resp, meta, out).await
        }
    }

    fn default_model_pricing(&self) -> Arc<PricingMap> {
        pricing::table("groq")
    }

    fn channel_name(&self) -> &'static str {
        "groq"
    }
}
