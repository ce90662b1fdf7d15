//! Moonshot（Kimi）：OpenAI 兼容接口，温度限制在 [0, 1]。

use super::common::{clamp, require_base, set_bearer};
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
pub struct MoonshotAdaptor {
    meta: Meta,
}

#[async_trait]
impl Adaptor for MoonshotAdaptor {
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
        let mut req = request.clone();
        req.temperature = clamp(req.temperature, 0.0, 1.0);
        chat_body(&req, &self.meta.actual_model_name, false)
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
        pricing::table("moonshot")
    }

    fn channel_name(&self) -> &'static str {
        "moonshot"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::ChannelType;

    #[tokio::test]
    async fn test_temperature_clamped() {
        let meta = Meta::new(ChannelType::Moonshot, "moonshot-v1-8k");
        let mut a = MoonshotAdaptor::default();
        a.init(&meta);
        let req = GeneralRequest {
            temperature: Some(1.7),
            ..Default::default()
        };
        let body = a
            .convert_request(&mut RelayContext::default(), Mode::ChatCompletions, &req)
            .await
            .unwrap();
        assert_eq!(body["temperature"], 1.0);
        assert_eq!(a.request_url(&meta).unwrap(), "https://api.moonshot.cn/v1/chat/completions");
    }
}
