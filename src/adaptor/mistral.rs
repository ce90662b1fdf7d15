//! Mistral：OpenAI 兼容接口，`seed` 改名为 `random_seed`。

use super::common::{require_base, set_bearer};
use super::openai::{chat_body, compatible, embedding_body, handler};
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
pub struct MistralAdaptor {
    meta: Meta,
}

/// Mistral spells `seed` as `random_seed` and has no `user` or `parallel_tool_calls`.
pub fn mistral_edits(body: &mut Value) {
    if let Some(obj) = body.as_object_mut() {
        if let Some(seed) = obj.remove("seed") {
            obj.insert("random_seed".to_string(), seed);
        }
        obj.remove("user");
        obj.remove("parallel_tool_calls");
    }
}

#[async_trait]
impl Adaptor for MistralAdaptor {
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
        let model = &self.meta.actual_model_name;
        match mode {
            Mode::ChatCompletions | Mode::ClaudeMessages => {
                let mut body = chat_body(request, model, false)?;
                mistral_edits(&mut body);
                Ok(body)
            }
            Mode::Embeddings => embedding_body(request, model),
            _ => Err(Error::mode_unsupported(&request.model, self.channel_name(), mode)),
        }
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
            _ if meta.is_stream => handler::stream_handler(ctx, resp, meta, out).await,
            _ => handler::handler(ctx, resp, meta, out).await,
        }
    }

    fn default_model_pricing(&self) -> Arc<PricingMap> {
        pricing::table("mistral")
    }

    fn channel_name(&self) -> &'static str {
        "mistral"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_seed_renamed() {
        let mut body = json!({"model": "mistral-large-latest", "seed": 7, "user": "u"});
        mistral_edits(&mut body);
        assert_eq!(body["random_seed"], 7);
        assert!(body.get("seed").is_none());
        assert!(body.get("user").is_none());
    }
}
