//! Three-layer ratio lookup and the quota formula.

use super::{GlobalPricingManager, DEFAULT_COMPLETION_RATIO, DEFAULT_MODEL_RATIO};
use crate::adaptor::Adaptor;
use crate::meta::ChannelPricing;
use crate::types::Usage;
use once_cell::sync::Lazy;
use serde::Serialize;
use std::collections::HashMap;

/// Layer that produced a ratio.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PriceSource {
    Channel,
    Adaptor,
    Global,
    Default,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PriceResolution {
    pub ratio: f64,
    pub completion_ratio: f64,
    pub ratio_source: PriceSource,
    pub completion_source: PriceSource,
}

pub fn resolve_model_ratio(
    model: &str,
    channel: &ChannelPricing,
    adaptor: &dyn Adaptor,
) -> (f64, PriceSource) {
    resolve_model_ratio_in(model, channel, adaptor, GlobalPricingManager::global())
}

fn resolve_model_ratio_in(
    model: &str,
    channel: &ChannelPricing,
    adaptor: &dyn Adaptor,
    global: &GlobalPricingManager,
) -> (f64, PriceSource) {
    if let Some(ratio) = channel.model_ratio.get(model) {
        return (*ratio, PriceSource::Channel);
    }
    if adaptor.default_model_pricing().contains_key(model) {
        return (adaptor.model_ratio(model), PriceSource::Adaptor);
    }
    if let Some(ratio) = global.model_ratio(model) {
        return (ratio, PriceSource::Global);
    }
    tracing::warn!(
        model = %model,
        adaptor = adaptor.channel_name(),
        ratio = DEFAULT_MODEL_RATIO,
        "model has no price, using default ratio"
    );
    (DEFAULT_MODEL_RATIO, PriceSource::Default)
}

pub fn resolve_completion_ratio(
    model: &str,
    channel: &ChannelPricing,
    adaptor: &dyn Adaptor,
) -> (f64, PriceSource) {
    resolve_completion_ratio_in(model, channel, adaptor, GlobalPricingManager::global())
}

fn resolve_completion_ratio_in(
    model: &str,
    channel: &ChannelPricing,
    adaptor: &dyn Adaptor,
    global: &GlobalPricingManager,
) -> (f64, PriceSource) {
    if let Some(ratio) = channel.completion_ratio.get(model) {
        return (*ratio, PriceSource::Channel);
    }
    if adaptor.default_model_pricing().contains_key(model) {
        return (adaptor.completion_ratio(model), PriceSource::Adaptor);
    }
    if let Some(ratio) = global.completion_ratio(model) {
        return (ratio, PriceSource::Global);
    }
    tracing::warn!(
        model = %model,
        adaptor = adaptor.channel_name(),
        "model has no completion price, using default"
    );
    (DEFAULT_COMPLETION_RATIO, PriceSource::Default)
}

/// Both ratios of `model`: channel override, adaptor list, global registry,
/// then the default.
pub fn resolve(model: &str, channel: &ChannelPricing, adaptor: &dyn Adaptor) -> PriceResolution {
    resolve_with(model, channel, adaptor, GlobalPricingManager::global())
}

/// [`resolve`] against an explicit registry.
pub fn resolve_with(
    model: &str,
    channel: &ChannelPricing,
    adaptor: &dyn Adaptor,
    global: &GlobalPricingManager,
) -> PriceResolution {
    let (ratio, ratio_source) = resolve_model_ratio_in(model, channel, adaptor, global);
    let (completion_ratio, completion_source) =
        resolve_completion_ratio_in(model, channel, adaptor, global);
    PriceResolution {
        ratio,
        completion_ratio,
        ratio_source,
        completion_source,
    }
}

/// `prompt * ratio + completion * ratio * completion_ratio + tools_cost`,
/// rounded up. A priced request never bills zero.
pub fn compute_quota(usage: &Usage, ratio: f64, completion_ratio: f64) -> i64 {
    let prompt = usage.prompt_tokens as f64 * ratio;
    let completion = usage.completion_tokens as f64 * ratio * completion_ratio;
    let mut quota = (prompt + completion).ceil() as i64 + usage.tools_cost;
    if ratio != 0.0 && quota <= 0 {
        quota = 1;
    }
    quota
}

static AUDIO_RATIO: Lazy<HashMap<&'static str, f64>> = Lazy::new(|| {
    HashMap::from([
        ("gpt-4o-audio-preview", 16.0),
        ("gpt-4o-audio-preview-2024-10-01", 40.0),
        ("gpt-4o-audio-preview-2024-12-17", 16.0),
        ("gpt-4o-mini-audio-preview", 66.7),
        ("gpt-4o-realtime-preview", 8.0),
        ("gpt-4o-mini-realtime-preview", 16.7),
    ])
});

static AUDIO_COMPLETION_RATIO: Lazy<HashMap<&'static str, f64>> = Lazy::new(|| {
    HashMap::from([
        ("gpt-4o-audio-preview", 2.0),
        ("gpt-4o-audio-preview-2024-10-01", 2.0),
        ("gpt-4o-audio-preview-2024-12-17", 2.0),
        ("gpt-4o-mini-audio-preview", 2.0),
        ("gpt-4o-realtime-preview", 2.0),
        ("gpt-4o-mini-realtime-preview", 2.0),
    ])
});

pub const DEFAULT_AUDIO_RATIO: f64 = 16.0;
pub const DEFAULT_AUDIO_COMPLETION_RATIO: f64 = 2.0;

/// Ratio of input audio tokens: the model's audio multiplier times its text ratio.
pub fn audio_prompt_ratio(model: &str, text_ratio: f64) -> f64 {
    AUDIO_RATIO.get(model).copied().unwrap_or(DEFAULT_AUDIO_RATIO) * text_ratio
}

pub fn audio_completion_ratio(model: &str) -> f64 {
    AUDIO_COMPLETION_RATIO
        .get(model)
        .copied()
        .unwrap_or(DEFAULT_AUDIO_COMPLETION_RATIO)
}
