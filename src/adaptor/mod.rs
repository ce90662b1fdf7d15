//! 适配器模块：统一的后端适配接口与注册表。
//!
//! # Adaptors
//!
//! An [`Adaptor`] turns a canonical request into one backend's wire format,
//! sends it, and translates the reply back into the caller's dialect while
//! counting usage. [`get_adaptor`] is the single dispatch point.
//!
//! | ApiType | Adaptor | Wire format |
//! |---------|---------|-------------|
//! | `OpenAI` | [`openai::OpenAiAdaptor`] | OpenAI Chat Completions, also Azure and the OpenAI-compatible vendors |
//! | `Anthropic` | [`anthropic::AnthropicAdaptor`] | Anthropic Messages |
//! | `AwsClaude` | [`aws::AwsClaudeAdaptor`] | Bedrock `invoke` with SigV4 and eventstream |
//! | `Gemini` / `PaLM` | [`gemini::GeminiAdaptor`] / [`palm::PalmAdaptor`] | Google Generative Language |
//! | `VertexAI` | [`vertexai::VertexAiAdaptor`] | Gemini, Claude, Imagen and Veo on Vertex |
//! | `Ali` / `Baidu` / `Tencent` / `Xunfei` / `Zhipu` | per-vendor | DashScope, Qianfan, Hunyuan TC3, Spark WebSocket, BigModel JWT |
//! | `Cohere` / `Cloudflare` / `Ollama` / `Replicate` / `Coze` / `DeepL` | per-vendor | native APIs |
//! | `DeepSeek` / `Groq` / `Mistral` / `Moonshot` | thin wrappers | OpenAI-compatible with edits |
//! | `Proxy` / `AIProxyLibrary` | pass-through | raw forwarding, knowledge-base library |
//!
//! ## Call sequence
//!
//! `init` → `request_url` → `setup_request_header` → `convert_*_request` →
//! `do_request` → `do_response`. [`crate::relay`] drives it.

pub mod aiproxy;
pub mod ali;
pub mod anthropic;
pub mod aws;
pub mod baidu;
pub mod cloudflare;
pub mod cohere;
pub mod common;
pub mod coze;
pub mod deepl;
pub mod deepseek;
pub mod gemini;
pub mod groq;
pub mod mistral;
pub mod moonshot;
pub mod ollama;
pub mod openai;
pub mod palm;
pub mod proxy;
pub mod replicate;
pub mod tencent;
pub mod vertexai;
pub mod xunfei;
pub mod zhipu;

use crate::context::RelayContext;
use crate::convert::claude_to_openai_request;
use crate::meta::{Meta, Mode};
use crate::pricing::{GlobalPricingManager, PricingMap, DEFAULT_COMPLETION_RATIO, DEFAULT_MODEL_RATIO};
use crate::stream::ResponseWriter;
use crate::transport::UpstreamResponse;
use crate::types::{ClaudeRequest, GeneralRequest, ImageRequest, Usage, VideoRequest};
use crate::{Error, Result};
use async_trait::async_trait;
use reqwest::header::HeaderMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

macro_rules! api_types {
    ($( $variant:ident = $code:expr, $name:expr; )*) => {
        /// Backend protocol family. Codes are stable; new entries append.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
        pub enum ApiType {
            #[default]
            $( $variant, )*
        }

        impl ApiType {
            pub const ALL: &'static [ApiType] = &[$( ApiType::$variant, )*];

            pub fn code(&self) -> u32 {
                match self { $( ApiType::$variant => $code, )* }
            }

            pub fn from_code(code: u32) -> Option<Self> {
                match code {
                    $( $code => Some(ApiType::$variant), )*
                    _ => None,
                }
            }

            pub fn name(&self) -> &'static str {
                match self { $( ApiType::$variant => $name, )* }
            }

            /// Case-insensitive lookup by variant or short name.
            pub fn from_name(name: &str) -> Option<Self> {
                let name = name.trim();
                ApiType::ALL.iter().copied().find(|t| {
                    t.name().eq_ignore_ascii_case(name) || format!("{:?}", t).eq_ignore_ascii_case(name)
                })
            }
        }
    };
}

api_types! {
    OpenAI = 0, "openai";
    Anthropic = 1, "anthropic";
    PaLM = 2, "palm";
    Baidu = 3, "baidu";
    Zhipu = 4, "zhipu";
    Ali = 5, "ali";
    Xunfei = 6, "xunfei";
    AIProxyLibrary = 7, "aiproxy-library";
    Tencent = 8, "tencent";
    Gemini = 9, "gemini";
    Ollama = 10, "ollama";
    AwsClaude = 11, "aws";
    Coze = 12, "coze";
    Cohere = 13, "cohere";
    Cloudflare = 14, "cloudflare";
    DeepL = 15, "deepl";
    VertexAI = 16, "vertexai";
    Proxy = 17, "proxy";
    Replicate = 18, "replicate";
    DeepSeek = 19, "deepseek";
    Groq = 20, "groq";
    Mistral = 21, "mistral";
    Moonshot = 22, "moonshot";
}

/// One backend family.
///
/// Instances come from [`get_adaptor`] and serve one request: `init` stores
/// the request's [`Meta`], everything else is a pure function of its
/// arguments plus that meta.
#[async_trait]
pub trait Adaptor: Send + Sync {
    /// Stores per-request metadata. Calling it twice with the same meta is a no-op.
    fn init(&mut self, meta: &Meta);

    fn request_url(&self, meta: &Meta) -> Result<String>;

    fn setup_request_header(&self, headers: &mut HeaderMap, meta: &Meta) -> Result<()>;

    /// Canonical request to the backend body. Must not change `request`.
    async fn convert_request(
        &self,
        ctx: &mut RelayContext,
        mode: Mode,
        request: &GeneralRequest,
    ) -> Result<Value>;

    async fn convert_image_request(&self, _ctx: &mut RelayContext, request: &ImageRequest) -> Result<Value> {
        Err(Error::mode_unsupported(&request.model, self.channel_name(), Mode::ImagesGenerations))
    }

    async fn convert_video_request(&self, _ctx: &mut RelayContext, request: &VideoRequest) -> Result<Value> {
        Err(Error::mode_unsupported(&request.model, self.channel_name(), Mode::VideoGenerations))
    }

    /// Claude Messages request to the backend body.
    ///
    /// The default lowers to the canonical shape, records the conversion on
    /// `ctx` and hands over to [`convert_request`](Self::convert_request).
    /// Claude-native backends override it with a pass-through.
    async fn convert_claude_request(&self, ctx: &mut RelayContext, request: &ClaudeRequest) -> Result<Value> {
        let lowered = claude_to_openai_request(request);
        ctx.claude_messages_conversion = true;
        ctx.original_claude_request = Some(request.clone());
        self.convert_request(ctx, Mode::ChatCompletions, &lowered).await
    }

    /// Sends the converted body. Transport errors and cancellation surface as
    /// errors; HTTP error statuses come back as a response.
    async fn do_request(&self, ctx: &RelayContext, meta: &Meta, body: Value) -> Result<UpstreamResponse> {
        common::do_request_helper(self, ctx, meta, &body).await
    }

    /// Translates the backend reply into `out` and returns the usage to bill.
    async fn do_response(
        &self,
        ctx: &mut RelayContext,
        resp: UpstreamResponse,
        meta: &Meta,
        out: &mut ResponseWriter<'_>,
    ) -> Result<Usage>;

    /// Models this adaptor prices, sorted.
    fn model_list(&self) -> Vec<String> {
        let mut models: Vec<String> = self.default_model_pricing().keys().cloned().collect();
        models.sort();
        models
    }

    fn default_model_pricing(&self) -> Arc<PricingMap>;

    /// Own price, then the global registry, then the default.
    fn model_ratio(&self, model: &str) -> f64 {
        self.default_model_pricing()
            .get(model)
            .map(|c| c.ratio)
            .or_else(|| GlobalPricingManager::global().model_ratio(model))
            .unwrap_or(DEFAULT_MODEL_RATIO)
    }

    fn completion_ratio(&self, model: &str) -> f64 {
        self.default_model_pricing()
            .get(model)
            .map(|c| c.completion_ratio)
            .or_else(|| GlobalPricingManager::global().completion_ratio(model))
            .unwrap_or(DEFAULT_COMPLETION_RATIO)
    }

    fn channel_name(&self) -> &'static str;
}

/// Adaptor for `api_type`. `None` only for types without an implementation.
pub fn get_adaptor(api_type: ApiType) -> Option<Box<dyn Adaptor>> {
    let adaptor: Box<dyn Adaptor> = match api_type {
        ApiType::OpenAI => Box::new(openai::OpenAiAdaptor::default()),
        ApiType::Anthropic => Box::new(anthropic::AnthropicAdaptor::default()),
        ApiType::PaLM => Box::new(palm::PalmAdaptor::default()),
        ApiType::Baidu => Box::new(baidu::BaiduAdaptor::default()),
        ApiType::Zhipu => Box::new(zhipu::ZhipuAdaptor::default()),
        ApiType::Ali => Box::new(ali::AliAdaptor::default()),
        ApiType::Xunfei => Box::new(xunfei::XunfeiAdaptor::default()),
        ApiType::AIProxyLibrary => Box::new(aiproxy::AiProxyLibraryAdaptor::default()),
        ApiType::Tencent => Box::new(tencent::TencentAdaptor::default()),
        ApiType::Gemini => Box::new(gemini::GeminiAdaptor::default()),
        ApiType::Ollama => Box::new(ollama::OllamaAdaptor::default()),
        ApiType::AwsClaude => Box::new(aws::AwsClaudeAdaptor::default()),
        ApiType::Coze => Box::new(coze::CozeAdaptor::default()),
        ApiType::Cohere => Box::new(cohere::CohereAdaptor::default()),
        ApiType::Cloudflare => Box::new(cloudflare::CloudflareAdaptor::default()),
        ApiType::DeepL => Box::new(deepl::DeepLAdaptor::default()),
        ApiType::VertexAI => Box::new(vertexai::VertexAiAdaptor::default()),
        ApiType::Proxy => Box::new(proxy::ProxyAdaptor::default()),
        ApiType::Replicate => Box::new(replicate::ReplicateAdaptor::default()),
        ApiType::DeepSeek => Box::new(deepseek::DeepSeekAdaptor::default()),
        ApiType::Groq => Box::new(groq::GroqAdaptor::default()),
        ApiType::Mistral => Box::new(mistral::MistralAdaptor::default()),
        ApiType::Moonshot => Box::new(moonshot::MoonshotAdaptor::default()),
    };
    Some(adaptor)
}

/// [`get_adaptor`] by stable integer code.
pub fn get_adaptor_by_code(code: u32) -> Option<Box<dyn Adaptor>> {
    ApiType::from_code(code).and_then(get_adaptor)
}
