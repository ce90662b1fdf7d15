//! DeepL 翻译适配器。
//!
//! Translation is exposed as a chat model: `deepl-{lang}` translates the
//! last user message into `lang`. The reply is a normal completion (or a
//! one-chunk stream). DeepL reports no usage, so the reply is estimated.
//! Keys ending in `:fx` belong to the free tier and its separate host.

use super::common::{read_checked_json, set_header};
use super::openai::handler::finish_usage;
use super::Adaptor;
use crate::context::RelayContext;
use crate::meta::{Meta, Mode};
use crate::pricing::{self, PricingMap};
use crate::stream::{ChunkBuilder, ResponseWriter};
use crate::transport::UpstreamResponse;
use crate::types::{GeneralRequest, Message, TextResponse, Usage};
use crate::{Error, Result};
use async_trait::async_trait;
use reqwest::header::HeaderMap;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

pub const FREE_HOST: &str = "https://api-free.deepl.com";
pub const PRO_HOST: &str = "https://api.deepl.com";

/// `deepl-zh` → `ZH`.
pub fn target_lang(model: &str) -> Option<String> {
    model
        .strip_prefix("deepl-")
        .filter(|l| !l.is_empty())
        .map(str::to_ascii_uppercase)
}

fn host(meta: &Meta) -> &str {
    let base = meta.base();
    if base == FREE_HOST && !meta.api_key.ends_with(":fx") {
        PRO_HOST
    } else {
        base
    }
}

#[derive(Debug, Deserialize)]
struct TranslateReply {
    #[serde(default)]
    translations: Vec<Translation>,
}

#[derive(Debug, Deserialize)]
struct Translation {
    #[serde(default)]
    text: String,
}

pub async fn handler(
    ctx: &mut RelayContext,
    resp: UpstreamResponse,
    meta: &Meta,
    out: &mut ResponseWriter<'_>,
) -> Result<Usage> {
    let body: TranslateReply = read_checked_json(ctx.cancellation(), resp, "deepl").await?;
    let translated: String = body.translations.into_iter().map(|t| t.text).collect::<Vec<_>>().join("\n");
    let usage = finish_usage(None, meta, &translated);
    if meta.is_stream {
        out.begin_stream();
        let builder = ChunkBuilder::new(meta.actual_model_name.clone(), ctx.reasoning_format);
        out.send_chunk(&builder.role()).await?;
        out.send_chunk(&builder.text(translated)).await?;
        out.send_chunk(&builder.finish("stop")).await?;
        out.send_chunk(&builder.usage(usage.clone())).await?;
        out.send_done().await?;
    } else {
        let text = TextResponse::new(
            meta.actual_model_name.clone(),
            Message::assistant(translated),
            Some("stop".to_string()),
            usage.clone(),
        );
        ctx.converted_response = Some(serde_json::to_value(&text)?);
        out.send_completion(&text).await?;
    }
    Ok(usage)
}

#[derive(Debug, Default)]
pub struct DeepLAdaptor {
    meta: Meta,
}

#[async_trait]
impl Adaptor for DeepLAdaptor {
    fn init(&mut self, meta: &Meta) {
        self.meta = meta.clone();
    }

    fn request_url(&self, meta: &Meta) -> Result<String> {
        Ok(format!("{}/v2/translate", host(meta)))
    }

    fn setup_request_header(&self, headers: &mut HeaderMap, meta: &Meta) -> Result<()> {
        set_header(headers, "authorization", &format!("DeepL-Auth-Key {}", meta.api_key))
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
        let target = target_lang(&self.meta.actual_model_name).ok_or_else(|| {
            Error::model_unsupported(&self.meta.actual_model_name, self.channel_name())
        })?;
        let text = request.last_user_text();
        if text.is_empty() {
            return Err(Error::invalid_request("nothing to translate"));
        }
        Ok(json!({ "text": [text], "target_lang": target }))
    }

    async fn do_response(
        &self,
        ctx: &mut RelayContext,
        resp: UpstreamResponse,
        meta: &Meta,
        out: &mut ResponseWriter<'_>,
    ) -> Result<Usage> {
        handler(ctx, resp, meta, out).await
    }

    fn default_model_pricing(&self) -> Arc<PricingMap> {
        pricing::table("deepl")
    }

    fn channel_name(&self) -> &'static str {
        "deepl"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::ChannelType;

    #[test]
    fn test_target_lang_and_host() {
        assert_eq!(target_lang("deepl-zh").as_deref(), Some("ZH"));
        assert_eq!(target_lang("gpt-4"), None);
        let free = Meta::new(ChannelType::DeepL, "deepl-en").with_api_key("k:fx");
        assert_eq!(DeepLAdaptor::default().request_url(&free).unwrap(), "https://api-free.deepl.com/v2/translate");
        let pro = Meta::new(ChannelType::DeepL, "deepl-en").with_api_key("k");
        assert_eq!(DeepLAdaptor::default().request_url(&pro).unwrap(), "https://api.deepl.com/v2/translate");
    }

    #[tokio::test]
    async fn test_translates_last_user_message() {
        let meta = Meta::new(ChannelType::DeepL, "deepl-ja");
        let mut a = DeepLAdaptor::default();
        a.init(&meta);
        let req = GeneralRequest {
            messages: vec![Message::user("ignored"), Message::assistant("x"), Message::user("hello")],
            ..Default::default()
        };
        let body = a
            .convert_request(&mut RelayContext::default(), Mode::ChatCompletions, &req)
            .await
            .unwrap();
        assert_eq!(body, json!({ "text": ["hello"], "target_lang": "JA" }));
    }

    #[tokio::test]
    async fn test_stream_reply_is_estimated() {
        let resp = UpstreamResponse::from_bytes(
            200,
            "application/json",
            r#"{"translations":[{"detected_source_language":"EN","text":"你好"}]}"#,
        );
        let meta = Meta::new(ChannelType::DeepL, "deepl-zh").with_stream(true).with_prompt_tokens(5);
        let mut sink = Vec::new();
        let mut out = ResponseWriter::openai(&mut sink);
        let usage = handler(&mut RelayContext::default(), resp, &meta, &mut out).await.unwrap();
        assert_eq!(usage.prompt_tokens, 5);
        assert!(usage.completion_tokens > 0);
        drop(out);
        assert!(String::from_utf8(sink).unwrap().contains("你好"));
    }
}
