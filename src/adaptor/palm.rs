//! Google PaLM 2（`generateMessage`）适配器。
//!
//! `v1beta2/models/{model}:generateMessage` takes a `prompt` of `context`
//! plus alternating author `"0"` (user) and `"1"` (model) messages. It has
//! no streaming and reports no usage; stream requests get the whole reply
//! as one chunk and usage is estimated.

use super::common::{read_checked_json, require_base, set_header};
use super::openai::handler::finish_usage;
use super::Adaptor;
use crate::context::RelayContext;
use crate::meta::{Meta, Mode};
use crate::pricing::{self, PricingMap};
use crate::stream::{ChunkBuilder, ResponseWriter};
use crate::transport::UpstreamResponse;
use crate::types::{GeneralRequest, Message, Role, TextResponse, Usage};
use crate::{Error, Result};
use async_trait::async_trait;
use reqwest::header::HeaderMap;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

pub fn convert_request(request: &GeneralRequest) -> Value {
    let mut context: Vec<String> = Vec::new();
    let mut messages: Vec<Value> = Vec::new();
    for msg in &request.messages {
        let author = match msg.role {
            Role::System => {
                context.push(msg.string_content());
                continue;
            }
            Role::Assistant => "1",
            Role::User | Role::Tool => "0",
        };
        messages.push(json!({ "author": author, "content": msg.string_content() }));
    }
    let mut prompt = json!({ "messages": messages });
    if !context.is_empty() {
        prompt["context"] = json!(context.join("\n"));
    }
    let mut body = json!({ "prompt": prompt, "candidateCount": 1 });
    if let Some(t) = request.temperature {
        body["temperature"] = json!(t);
    }
    if let Some(p) = request.top_p {
        body["topP"] = json!(p);
    }
    if let Some(k) = request.top_k {
        body["topK"] = json!(k);
    }
    body
}

#[derive(Debug, Default, Deserialize)]
struct PalmReply {
    #[serde(default)]
    candidates: Vec<PalmMessage>,
    #[serde(default)]
    filters: Vec<PalmFilter>,
}

#[derive(Debug, Default, Deserialize)]
struct PalmMessage {
    #[serde(default)]
    content: String,
}

#[derive(Debug, Default, Deserialize)]
struct PalmFilter {
    #[serde(default)]
    reason: String,
}

pub async fn handler(
    ctx: &mut RelayContext,
    resp: UpstreamResponse,
    meta: &Meta,
    out: &mut ResponseWriter<'_>,
) -> Result<Usage> {
    let body: PalmReply = read_checked_json(ctx.cancellation(), resp, "palm").await?;
    let Some(candidate) = body.candidates.into_iter().next() else {
        let reason = body
            .filters
            .first()
            .map(|f| f.reason.clone())
            .unwrap_or_else(|| "no candidates".to_string());
        return Err(Error::Upstream {
            status: 400,
            message: format!("palm returned nothing: {}", reason),
            provider_code: Some("content_filter".to_string()),
        });
    };
    let usage = finish_usage(None, meta, &candidate.content);
    if meta.is_stream {
        out.begin_stream();
        let builder = ChunkBuilder::new(meta.actual_model_name.clone(), ctx.reasoning_format);
        out.send_chunk(&builder.role()).await?;
        out.send_chunk(&builder.text(candidate.content)).await?;
        out.send_chunk(&builder.finish("stop")).await?;
        out.send_chunk(&builder.usage(usage.clone())).await?;
        out.send_done().await?;
    } else {
        let text = TextResponse::new(
            meta.actual_model_name.clone(),
            Message::assistant(candidate.content),
            Some("stop".to_string()),
            usage.clone(),
        );
        ctx.converted_response = Some(serde_json::to_value(&text)?);
        out.send_completion(&text).await?;
    }
    Ok(usage)
}

#[derive(Debug, Default)]
pub struct PalmAdaptor {
    meta: Meta,
}

#[async_trait]
impl Adaptor for PalmAdaptor {
    fn init(&mut self, meta: &Meta) {
        self.meta = meta.clone();
    }

    fn request_url(&self, meta: &Meta) -> Result<String> {
        let model = match meta.actual_model_name.as_str() {
            "PaLM-2" => "chat-bison-001",
            other => other,
        };
        Ok(format!("{}/v1beta2/models/{}:generateMessage", require_base(meta)?, model))
    }

    fn setup_request_header(&self, headers: &mut HeaderMap, meta: &Meta) -> Result<()> {
        set_header(headers, "x-goog-api-key", &meta.api_key)
    }

    async fn convert_request(
        &self,
        _ctx: &mut RelayContext,
        mode: Mode,
        request: &GeneralRequest,
    ) -> Result<Value> {
        match mode {
            Mode::ChatCompletions | Mode::ClaudeMessages => Ok(convert_request(request)),
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
        handler(ctx, resp, meta, out).await
    }

    fn default_model_pricing(&self) -> Arc<PricingMap> {
        pricing::table("palm")
    }

    fn channel_name(&self) -> &'static str {
        "palm"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::ChannelType;

    #[test]
    fn test_prompt_shape() {
        let req = GeneralRequest {
            messages: vec![Message::system("ctx"), Message::user("q"), Message::assistant("a")],
            top_k: Some(40),
            ..Default::default()
        };
        let body = convert_request(&req);
        assert_eq!(body["prompt"]["context"], "ctx");
        assert_eq!(body["prompt"]["messages"][0]["author"], "0");
        assert_eq!(body["prompt"]["messages"][1]["author"], "1");
        assert_eq!(body["topK"], 40);
    }

    #[test]
    fn test_alias_url() {
        let meta = Meta::new(ChannelType::PaLM, "PaLM-2");
        assert_eq!(
            PalmAdaptor::default().request_url(&meta).unwrap(),
            "https://generativelanguage.googleapis.com/v1beta2/models/chat-bison-001:generateMessage"
        );
    }

    #[tokio::test]
    async fn test_filtered_reply() {
        let resp = UpstreamResponse::from_bytes(
            200,
            "application/json",
            r#"{"filters":[{"reason":"OTHER"}],"messages":[]}"#,
        );
        let meta = Meta::new(ChannelType::PaLM, "chat-bison-001");
        let mut sink = Vec::new();
        let mut out = ResponseWriter::openai(&mut sink);
        let err = handler(&mut RelayContext::default(), resp, &meta, &mut out).await.unwrap_err();
        assert_eq!(err.status(), 400);
    }
}
