//! 请求元数据：渠道类型、调用模式与渠道配置。
//!
//! Per-request metadata handed to every adaptor.
//!
//! `Meta` is built by the frontend once per request and treated as read-only
//! by the core. It carries the channel (type, base URL, credentials, config,
//! pricing overrides), the model names before and after mapping, the stream
//! flag, the prompt-token pre-count and the relay [`Mode`].

use crate::adaptor::ApiType;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// What kind of call the request is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    #[default]
    ChatCompletions,
    Embeddings,
    ImagesGenerations,
    AudioSpeech,
    Rerank,
    ClaudeMessages,
    VideoGenerations,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::ChatCompletions => "chat",
            Mode::Embeddings => "embedding",
            Mode::ImagesGenerations => "image",
            Mode::AudioSpeech => "audio",
            Mode::Rerank => "rerank",
            Mode::ClaudeMessages => "claude-messages",
            Mode::VideoGenerations => "video",
        }
    }

    /// Mode implied by an inbound request path.
    pub fn from_path(path: &str) -> Self {
        let path = path.split('?').next().unwrap_or(path);
        if path.ends_with("/embeddings") || path.ends_with("/engines/embeddings") {
            Mode::Embeddings
        } else if path.contains("/images/generations") {
            Mode::ImagesGenerations
        } else if path.contains("/audio/speech") {
            Mode::AudioSpeech
        } else if path.ends_with("/rerank") {
            Mode::Rerank
        } else if path.ends_with("/messages") {
            Mode::ClaudeMessages
        } else if path.contains("/videos") {
            Mode::VideoGenerations
        } else {
            Mode::ChatCompletions
        }
    }
}

macro_rules! channel_types {
    ($( $variant:ident = $code:expr, $name:expr, $api:ident, $url:expr; )*) => {
        /// Configured backend kind. Several channel types share one [`ApiType`].
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
        pub enum ChannelType {
            #[default]
            $( $variant, )*
        }

        impl ChannelType {
            pub const ALL: &'static [ChannelType] = &[$( ChannelType::$variant, )*];

            /// Stable integer code stored with the channel.
            pub fn code(&self) -> u32 {
                match self { $( ChannelType::$variant => $code, )* }
            }

            pub fn from_code(code: u32) -> Option<Self> {
                match code {
                    $( $code => Some(ChannelType::$variant), )*
                    _ => None,
                }
            }

            pub fn name(&self) -> &'static str {
                match self { $( ChannelType::$variant => $name, )* }
            }

            pub fn api_type(&self) -> ApiType {
                match self { $( ChannelType::$variant => ApiType::$api, )* }
            }

            /// Default base URL; empty where the URL depends on config (Azure, Vertex, Bedrock).
            pub fn default_base_url(&self) -> &'static str {
                match self { $( ChannelType::$variant => $url, )* }
            }
        }
    };
}

channel_types! {
    OpenAI = 1, "openai", OpenAI, "https://api.openai.com";
    Azure = 3, "azure", OpenAI, "";
    PaLM = 11, "palm", PaLM, "https://generativelanguage.googleapis.com";
    Anthropic = 14, "anthropic", Anthropic, "https://api.anthropic.com";
    Baidu = 15, "baidu", Baidu, "https://aip.baidubce.com";
    Zhipu = 16, "zhipu", Zhipu, "https://open.bigmodel.cn";
    Ali = 17, "ali", Ali, "https://dashscope.aliyuncs.com";
    Xunfei = 18, "xunfei", Xunfei, "wss://spark-api.xf-yun.com";
    AI360 = 19, "ai360", OpenAI, "https://ai.360.cn";
    OpenRouter = 20, "openrouter", OpenAI, "https://openrouter.ai/api";
    AIProxyLibrary = 21, "aiproxy-library", AIProxyLibrary, "https://api.aiproxy.io";
    Tencent = 23, "tencent", Tencent, "https://hunyuan.tencentcloudapi.com";
    Gemini = 24, "gemini", Gemini, "https://generativelanguage.googleapis.com";
    Moonshot = 25, "moonshot", Moonshot, "https://api.moonshot.cn";
    Baichuan = 26, "baichuan", OpenAI, "https://api.baichuan-ai.com";
    Minimax = 27, "minimax", OpenAI, "https://api.minimax.chat";
    Mistral = 28, "mistral", Mistral, "https://api.mistral.ai";
    Groq = 29, "groq", Groq, "https://api.groq.com/openai";
    Ollama = 30, "ollama", Ollama, "http://localhost:11434";
    LingYiWanWu = 31, "lingyiwanwu", OpenAI, "https://api.lingyiwanwu.com";
    StepFun = 32, "stepfun", OpenAI, "https://api.stepfun.com";
    AwsClaude = 33, "aws", AwsClaude, "";
    Coze = 34, "coze", Coze, "https://api.coze.com";
    Cohere = 35, "cohere", Cohere, "https://api.cohere.ai";
    DeepSeek = 36, "deepseek", DeepSeek, "https://api.deepseek.com";
    Cloudflare = 37, "cloudflare", Cloudflare, "https://api.cloudflare.com";
    DeepL = 38, "deepl", DeepL, "https://api-free.deepl.com";
    TogetherAI = 39, "together.ai", OpenAI, "https://api.together.xyz";
    Doubao = 40, "doubao", OpenAI, "https://ark.cn-beijing.volces.com";
    Novita = 41, "novita", OpenAI, "https://api.novita.ai/v3/openai";
    VertexAI = 42, "vertexai", VertexAI, "";
    Proxy = 43, "proxy", Proxy, "";
    SiliconFlow = 44, "siliconflow", OpenAI, "https://api.siliconflow.cn";
    XAI = 45, "xai", OpenAI, "https://api.x.ai";
    Replicate = 46, "replicate", Replicate, "https://api.replicate.com";
}

/// Backend-specific channel settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChannelConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    /// GCP project for Vertex AI.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_version: Option<String>,
    /// Coze user, Cloudflare account id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    /// DashScope plugin header value.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plugin: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub library_id: Option<String>,
    /// AWS access key; falls back to the first segment of the API key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ak: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sk: Option<String>,
}

/// Per-channel pricing overrides; the first layer of the price resolver.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChannelPricing {
    #[serde(default)]
    pub model_ratio: HashMap<String, f64>,
    #[serde(default)]
    pub completion_ratio: HashMap<String, f64>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Meta {
    pub channel_id: i64,
    pub channel_type: ChannelType,
    pub api_type: ApiType,
    /// Model name as the client sent it.
    pub origin_model_name: String,
    /// Model name after channel mapping; this is what goes upstream.
    pub actual_model_name: String,
    pub base_url: String,
    /// Opaque credential; multi-part credentials are `|`-separated.
    pub api_key: String,
    pub config: ChannelConfig,
    pub pricing: ChannelPricing,
    /// Prompt token pre-count set by the caller.
    pub prompt_tokens: u64,
    pub is_stream: bool,
    pub mode: Mode,
    pub request_url_path: String,
    /// Inbound headers the frontend forwards (`anthropic-version`, `anthropic-beta`).
    pub client_headers: HashMap<String, String>,
}

impl Meta {
    pub fn new(channel_type: ChannelType, model: impl Into<String>) -> Self {
        let model = model.into();
        Self {
            channel_type,
            api_type: channel_type.api_type(),
            origin_model_name: model.clone(),
            actual_model_name: model,
            base_url: channel_type.default_base_url().to_string(),
            ..Default::default()
        }
    }

    pub fn with_channel_id(mut self, id: i64) -> Self {
        self.channel_id = id;
        self
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        let url = url.into();
        if !url.is_empty() {
            self.base_url = url;
        }
        self
    }

    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = key.into();
        self
    }

    pub fn with_config(mut self, config: ChannelConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_pricing(mut self, pricing: ChannelPricing) -> Self {
        self.pricing = pricing;
        self
    }

    pub fn with_actual_model(mut self, model: impl Into<String>) -> Self {
        self.actual_model_name = model.into();
        self
    }

    pub fn with_stream(mut self, stream: bool) -> Self {
        self.is_stream = stream;
        self
    }

    pub fn with_mode(mut self, mode: Mode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_prompt_tokens(mut self, n: u64) -> Self {
        self.prompt_tokens = n;
        self
    }

    pub fn with_request_path(mut self, path: impl Into<String>) -> Self {
        self.request_url_path = path.into();
        self
    }

    pub fn with_client_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.client_headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    /// Base URL without a trailing slash.
    pub fn base(&self) -> &str {
        self.base_url.trim_end_matches('/')
    }

    /// `|`-separated credential parts.
    pub fn key_parts(&self) -> Vec<&str> {
        self.api_key.split('|').map(str::trim).collect()
    }

    pub fn client_header(&self, name: &str) -> Option<&str> {
        self.client_headers.get(name).map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_from_path() {
        assert_eq!(Mode::from_path("/v1/chat/completions"), Mode::ChatCompletions);
        assert_eq!(Mode::from_path("/v1/embeddings"), Mode::Embeddings);
        assert_eq!(Mode::from_path("/v1/messages?beta=true"), Mode::ClaudeMessages);
        assert_eq!(Mode::from_path("/v1/images/generations"), Mode::ImagesGenerations);
    }

    #[test]
    fn test_channel_codes_roundtrip() {
        for ct in ChannelType::ALL {
            assert_eq!(ChannelType::from_code(ct.code()), Some(*ct));
        }
        assert_eq!(ChannelType::Doubao.api_type(), ApiType::OpenAI);
        assert_eq!(ChannelType::AwsClaude.api_type(), ApiType::AwsClaude);
    }

    #[test]
    fn test_meta_defaults_base_url() {
        let m = Meta::new(ChannelType::DeepSeek, "deepseek-chat").with_base_url("");
        assert_eq!(m.base(), "https://api.deepseek.com");
        let m = m.with_base_url("https://proxy.local/").with_api_key("a|b|c");
        assert_eq!(m.base(), "https://proxy.local");
        assert_eq!(m.key_parts(), vec!["a", "b", "c"]);
    }
}
