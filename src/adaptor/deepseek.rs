//! DeepSeek：OpenAI 兼容接口，去掉不支持的 `reasoning_effort`。
//!
//! `deepseek-reasoner` streams its chain of thought in `reasoning_content`;
//! the shared OpenAI handlers move it to the caller's reasoning field.

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
pub struct DeepSeekAdaptor {
    meta: Meta,
}

#[async_trait]
impl Adaptor for DeepSeekAdaptor {
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
            obj.remove("reasoning_effort");
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
        pricing::table("deepseek")
    }

    fn channel_name(&self) -> &'static str {
        "deepseek"
    }
}
