//! Per-vendor rules for channels served by the OpenAI adaptor.

use crate::meta::{ChannelType, Mode};

/// Price list of an OpenAI-family channel.
pub fn pricing_table(channel: ChannelType) -> &'static str {
    match channel {
        ChannelType::AI360 => "ai360",
        ChannelType::Baichuan => "baichuan",
        ChannelType::Doubao => "doubao",
        ChannelType::LingYiWanWu => "lingyiwanwu",
        ChannelType::Minimax => "minimax",
        ChannelType::Novita => "novita",
        ChannelType::OpenRouter => "openrouter",
        ChannelType::SiliconFlow => "siliconflow",
        ChannelType::StepFun => "stepfun",
        ChannelType::TogetherAI => "togetherai",
        ChannelType::XAI => "xai",
        _ => "openai",
    }
}

/// Path suffix of `mode` under an OpenAI-style `/v1` root.
pub fn mode_path(mode: Mode) -> &'static str {
    match mode {
        Mode::Embeddings => "/embeddings",
        Mode::ImagesGenerations => "/images/generations",
        Mode::AudioSpeech => "/audio/speech",
        Mode::Rerank => "/rerank",
        Mode::ChatCompletions | Mode::ClaudeMessages | Mode::VideoGenerations => "/chat/completions",
    }
}

/// Version root each vendor mounts its OpenAI surface on.
pub fn version_root(channel: ChannelType) -> &'static str {
    match channel {
        ChannelType::Doubao => "/api/v3",
        // base URL already carries the version
        ChannelType::Novita => "",
        _ => "/v1",
    }
}

/// Full request URL for a non-Azure OpenAI-family channel.
pub fn request_url(channel: ChannelType, base: &str, mode: Mode) -> String {
    if channel == ChannelType::Minimax && matches!(mode, Mode::ChatCompletions | Mode::ClaudeMessages) {
        return format!("{}/v1/text/chatcompletion_v2", base);
    }
    format!("{}{}{}", base, version_root(channel), mode_path(mode))
}

/// Whether the vendor understands OpenRouter's `provider` routing block.
pub fn supports_provider_routing(channel: ChannelType) -> bool {
    channel == ChannelType::OpenRouter
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vendor_urls() {
        assert_eq!(
            request_url(ChannelType::OpenAI, "https://api.openai.com", Mode::ChatCompletions),
            "https://api.openai.com/v1/chat/completions"
        );
        assert_eq!(
            request_url(ChannelType::Doubao, "https://ark", Mode::Embeddings),
            "https://ark/api/v3/embeddings"
        );
        assert_eq!(
            request_url(ChannelType::Novita, "https://api.novita.ai/v3/openai", Mode::ChatCompletions),
            "https://api.novita.ai/v3/openai/chat/completions"
        );
        assert_eq!(
            request_url(ChannelType::Minimax, "https://api.minimax.chat", Mode::ChatCompletions),
            "https://api.minimax.chat/v1/text/chatcompletion_v2"
        );
    }

    #[test]
    fn test_pricing_tables() {
        assert_eq!(pricing_table(ChannelType::Azure), "openai");
        assert_eq!(pricing_table(ChannelType::XAI), "xai");
        assert!(supports_provider_routing(ChannelType::OpenRouter));
        assert!(!supports_provider_routing(ChannelType::OpenAI));
    }
}
