//! OpenAI 适配器：OpenAI、Azure 及 OpenAI 兼容厂商。
//!
//! # OpenAI
//!
//! Serves `ApiType::OpenAI`. The concrete vendor comes from
//! [`Meta::channel_type`]: Azure gets its deployment URL and `api-key`
//! header, every other vendor (OpenRouter, Doubao, Novita, xAI, ...) its URL
//! rule and price list from [`compatible`].
//!
//! | Mode | Path | Handler |
//! |------|------|---------|
//! | chat / claude-messages | `/v1/chat/completions` | [`handler::stream_handler`] / [`handler::handler`] |
//! | embeddings | `/v1/embeddings` | [`handler::embedding_handler`] |
//! | images | `/v1/images/generations` | [`handler::image_handler`] |
//! | audio speech | `/v1/audio/speech` | [`handler::speech_handler`] |
//! | rerank | `/v1/rerank` | [`handler::rerank_handler`] |

pub mod compatible;
pub mod handler;

use super::common::{require_base, set_bearer, set_header, to_value};
use super::Adaptor;
use crate::context::RelayContext;
use crate::meta::{ChannelType, Meta, Mode};
use crate::pricing::{self, PricingMap};
use crate::stream::ResponseWriter;
use crate::transport::UpstreamResponse;
use crate::types::{ContentPart, GeneralRequest, ImageRequest, MessageContent, StreamOptions, Usage};
use crate::{Error, Result};
use async_trait::async_trait;
use reqwest::header::HeaderMap;
use serde_json::{json, Value};
use std::sync::Arc;

pub const DEFAULT_AZURE_API_VERSION: &str = "2024-02-01";

#[derive(Debug, Default)]
pub struct OpenAiAdaptor {
    meta: Meta,
}

impl OpenAiAdaptor {
    fn channel(&self) -> ChannelType {
        self.meta.channel_type
    }
}

/// o-series and gpt-5 models take `max_completion_tokens` and reject sampling knobs.
pub fn is_reasoning_model(model: &str) -> bool {
    ["o1", "o3", "o4", "gpt-5"].iter().any(|p| model.starts_with(p))
}

/// Chat body for an OpenAI-compatible backend.
///
/// Works on a copy: forces `stream_options.include_usage` on streams,
/// drops the `provider` block unless the vendor routes on it, and strips
/// reasoning fields from history since OpenAI-style backends reject them.
pub fn chat_body(request: &GeneralRequest, model: &str, keep_provider: bool) -> Result<Value> {
    let mut req = request.clone();
    if !model.is_empty() {
        req.model = model.to_string();
    }
    if req.stream {
        req.stream_options = Some(StreamOptions { include_usage: true });
    } else {
        req.stream_options = None;
    }
    if !keep_provider {
        req.provider = None;
    }
    req.thinking = None;
    for msg in req.messages.iter_mut() {
        msg.clear_reasoning();
        if let Some(MessageContent::Parts(parts)) = msg.content.as_mut() {
            parts.retain(|p| !matches!(p, ContentPart::Thinking { .. }));
        }
    }
    if is_reasoning_model(&req.model) {
        if let Some(n) = req.max_tokens.take() {
            req.max_completion_tokens.get_or_insert(n);
        }
        req.temperature = None;
        req.top_p = None;
    }
    to_value(&req)
}

pub fn embedding_body(request: &GeneralRequest, model: &str) -> Result<Value> {
    let input = request
        .input
        .as_ref()
        .ok_or_else(|| Error::invalid_request("embedding request needs `input`"))?;
    let mut body = json!({ "model": model, "input": input });
    if let Some(f) = &request.encoding_format {
        body["encoding_format"] = json!(f);
    }
    if let Some(d) = request.dimensions {
        body["dimensions"] = json!(d);
    }
    if let Some(u) = &request.user {
        body["user"] = json!(u);
    }
    Ok(body)
}

pub fn rerank_body(request: &GeneralRequest, model: &str) -> Result<Value> {
    let query = request
        .query
        .as_deref()
        .ok_or_else(|| Error::invalid_request("rerank request needs `query`"))?;
    let documents = request.documents.clone().unwrap_or_default();
    let mut body = json!({ "model": model, "query": query, "documents": documents });
    if let Some(n) = request.top_n {
        body["top_n"] = json!(n);
    }
    Ok(body)
}

fn speech_body(request: &GeneralRequest, model: &str) -> Result<Value> {
    let input = request
        .input
        .as_ref()
        .map(|i| i.to_vec().join(""))
        .filter(|s| !s.is_empty())
        .ok_or_else(|| Error::invalid_request("speech request needs `input`"))?;
    let mut body = json!({
        "model": model,
        "input": input,
        "voice": request.voice.as_deref().unwrap_or("alloy"),
    });
    if let Some(f) = &request.encoding_format {
        body["response_format"] = json!(f);
    }
    Ok(body)
}

fn azure_url(meta: &Meta) -> Result<String> {
    let base = require_base(meta)?;
    let deployment = meta.actual_model_name.replace('.', "");
    let version = meta
        .config
        .api_version
        .as_deref()
        .filter(|v| !v.is_empty())
        .unwrap_or(DEFAULT_AZURE_API_VERSION);
    Ok(format!(
        "{}/openai/deployments/{}{}?api-version={}",
        base,
        deployment,
        compatible::mode_path(meta.mode),
        version
    ))
}

#[async_trait]
impl Adaptor for OpenAiAdaptor {
    fn init(&mut self, meta: &Meta) {
        self.meta = meta.clone();
    }

    fn request_url(&self, meta: &Meta) -> Result<String> {
        match meta.channel_type {
            ChannelType::Azure => azure_url(meta),
            channel => Ok(compatible::request_url(channel, require_base(meta)?, meta.mode)),
        }
    }

    fn setup_request_header(&self, headers: &mut HeaderMap, meta: &Meta) -> Result<()> {
        match meta.channel_type {
            ChannelType::Azure => set_header(headers, "api-key", &meta.api_key),
            ChannelType::OpenRouter => {
                set_bearer(headers, &meta.api_key)?;
                set_header(headers, "x-title", "ai-relay")
            }
            _ => set_bearer(headers, &meta.api_key),
        }
    }

    async fn convert_request(
        &self,
        _ctx: &mut RelayContext,
        mode: Mode,
        request: &GeneralRequest,
    ) -> Result<Value> {
        let model = if self.meta.actual_model_name.is_empty() {
            request.model.as_str()
        } else {
            self.meta.actual_model_name.as_str()
        };
        match mode {
            Mode::ChatCompletions | Mode::ClaudeMessages => {
                chat_body(request, model, compatible::supports_provider_routing(self.channel()))
            }
            Mode::Embeddings => embedding_body(request, model),
            Mode::Rerank => rerank_body(request, model),
            Mode::AudioSpeech => speech_body(request, model),
            Mode::ImagesGenerations | Mode::VideoGenerations => {
                Err(Error::mode_unsupported(model, self.channel_name(), mode))
            }
        }
    }

    async fn convert_image_request(&self, _ctx: &mut RelayContext, request: &ImageRequest) -> Result<Value> {
        let mut req = request.clone();
        if !self.meta.actual_model_name.is_empty() {
            req.model = self.meta.actual_model_name.clone();
        }
        req.negative_prompt = None;
        to_value(&req)
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
            Mode::AudioSpeech => handler::speech_handler(ctx, resp, meta, out).await,
            Mode::Rerank => handler::rerank_handler(ctx, resp, meta, out).await,
            _ if meta.is_stream => handler::stream_handler(ctx, resp, meta, out).await,
            _ => handler::handler(ctx, resp, meta, out).await,
        }
    }

    fn default_model_pricing(&self) -> Arc<PricingMap> {
        pricing::table(compatible::pricing_table(self.channel()))
    }

    fn channel_name(&self) -> &'static str {
        "openai"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Message, ProviderRouting, Thinking};

    fn adaptor(meta: &Meta) -> OpenAiAdaptor {
        let mut a = OpenAiAdaptor::default();
        a.init(meta);
        a
    }

    #[test]
    fn test_azure_url_strips_dots() {
        let meta = Meta::new(ChannelType::Azure, "gpt-3.5-turbo").with_base_url("https://res.openai.azure.com/");
        let url = adaptor(&meta).request_url(&meta).unwrap();
        assert_eq!(
            url,
            "https://res.openai.azure.com/openai/deployments/gpt-35-turbo/chat/completions?api-version=2024-02-01"
        );
    }

    #[tokio::test]
    async fn test_chat_body_edits() {
        let meta = Meta::new(ChannelType::OpenAI, "gpt-4o");
        let a = adaptor(&meta);
        let mut history = Message::assistant("a");
        history.reasoning_content = Some("r".into());
        let req = GeneralRequest {
            model: "alias".into(),
            messages: vec![Message::user("q"), history],
            stream: true,
            provider: Some(ProviderRouting::default()),
            thinking: Some(Thinking::enabled(2048)),
            ..Default::default()
        };
        let before = req.clone();
        let body = a
            .convert_request(&mut RelayContext::default(), Mode::ChatCompletions, &req)
            .await
            .unwrap();
        assert_eq!(req, before);
        assert_eq!(body["model"], "gpt-4o");
        assert_eq!(body["stream_options"]["include_usage"], true);
        assert!(body.get("provider").is_none());
        assert!(body.get("thinking").is_none());
        assert!(body["messages"][1].get("reasoning_content").is_none());
    }

    #[tokio::test]
    async fn test_openrouter_keeps_provider() {
        let meta = Meta::new(ChannelType::OpenRouter, "openai/gpt-4o");
        let req = GeneralRequest {
            messages: vec![Message::user("q")],
            provider: Some(ProviderRouting {
                order: vec!["azure".into()],
                ..Default::default()
            }),
            ..Default::default()
        };
        let body = adaptor(&meta)
            .convert_request(&mut RelayContext::default(), Mode::ChatCompletions, &req)
            .await
            .unwrap();
        assert_eq!(body["provider"]["order"][0], "azure");
    }

    #[test]
    fn test_reasoning_models_move_max_tokens() {
        let req = GeneralRequest {
            max_tokens: Some(100),
            temperature: Some(0.2),
            ..Default::default()
        };
        let body = chat_body(&req, "o3-mini", false).unwrap();
        assert_eq!(body["max_completion_tokens"], 100);
        assert!(body.get("max_tokens").is_none());
        assert!(body.get("temperature").is_none());
    }

    #[test]
    fn test_vendor_pricing_table_follows_channel() {
        let a = adaptor(&Meta::new(ChannelType::XAI, "grok-2"));
        assert!(a.model_list().iter().any(|m| m.starts_with("grok")));
        assert_eq!(a.channel_name(), "openai");
        let models = OpenAiAdaptor::default().model_list();
        assert!(models.contains(&"gpt-4".to_string()));
    }

    #[test]
    fn test_embedding_requires_input() {
        assert!(embedding_body(&GeneralRequest::default(), "text-embedding-3-small").is_err());
    }
}
