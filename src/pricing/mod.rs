//! 计费模块：价格表加载、全局合并注册表与三层倍率解析。
//!
//! # Pricing
//!
//! Every price is a pair of ratios in the canonical quota unit
//! (1 USD = [`QUOTA_PER_USD`] quota):
//!
//! - `ratio`: quota per prompt token (or per image, or per 1/[`TOKENS_PER_SEC`] second)
//! - `completion_ratio`: extra multiplier on `ratio` for completion tokens
//!
//! Adaptor price lists live in `data/pricing/*.yaml` and are compiled into the
//! binary. Lookups go through three layers, see [`resolve`]:
//!
//! | Layer | Source |
//! |-------|--------|
//! | 1 | Channel override ([`ChannelPricing`](crate::meta::ChannelPricing)) |
//! | 2 | The adaptor's own price list |
//! | 3 | [`GlobalPricingManager`], merged from the contributing adaptors |
//! | 4 | [`DEFAULT_MODEL_RATIO`] / [`DEFAULT_COMPLETION_RATIO`] with a warning |
//!
//! ## Example
//!
//! ```rust
//! use ai_relay_rust::pricing::{compute_quota, MILLI_TOKENS_USD};
//! use ai_relay_rust::types::Usage;
//!
//! // gpt-4 at $30/M in, $60/M out
//! let quota = compute_quota(&Usage::new(1000, 500), 30.0 * MILLI_TOKENS_USD, 2.0);
//! assert_eq!(quota, 30_000);
//! ```

mod global;
mod resolver;
mod table;

pub use global::{GlobalPricingManager, PricingStats};
pub use resolver::{
    audio_completion_ratio, audio_prompt_ratio, compute_quota, resolve, resolve_completion_ratio,
    resolve_model_ratio, resolve_with, PriceResolution, PriceSource,
};
pub use table::{parse_table, table, table_names, Currency, PricingMap};

use serde::{Deserialize, Serialize};

/// 1 USD in quota.
pub const QUOTA_PER_USD: f64 = 500_000.0;
/// Ratio of a model priced at 1 USD per million tokens.
pub const MILLI_TOKENS_USD: f64 = 0.5;
/// Ratio of a model priced at 1 RMB per million tokens.
pub const MILLI_TOKENS_RMB: f64 = 3.5;
/// Ratio of an image priced at 1 USD.
pub const IMAGE_USD_PER_PIC: f64 = QUOTA_PER_USD;
/// Ratio of an image priced at 1 RMB.
pub const IMAGE_RMB_PER_PIC: f64 = QUOTA_PER_USD / 7.0;
/// Billing granularity of video models: one second is this many tokens.
pub const TOKENS_PER_SEC: u64 = 1000;

pub const DEFAULT_MODEL_RATIO: f64 = 2.5 * MILLI_TOKENS_USD;
pub const DEFAULT_COMPLETION_RATIO: f64 = 1.0;

/// Price of one model.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    pub ratio: f64,
    pub completion_ratio: f64,
}

impl ModelConfig {
    pub fn new(ratio: f64, completion_ratio: f64) -> Self {
        Self {
            ratio,
            completion_ratio,
        }
    }

    /// Converts a per-million-token price pair.
    pub fn per_million(input: f64, output: f64, currency: Currency) -> Self {
        let unit = match currency {
            Currency::Usd => MILLI_TOKENS_USD,
            Currency::Rmb => MILLI_TOKENS_RMB,
        };
        let completion_ratio = if input == 0.0 { 1.0 } else { output / input };
        Self::new(input * unit, completion_ratio)
    }

    pub fn per_image(price: f64, currency: Currency) -> Self {
        let unit = match currency {
            Currency::Usd => IMAGE_USD_PER_PIC,
            Currency::Rmb => IMAGE_RMB_PER_PIC,
        };
        Self::new(price * unit, 1.0)
    }

    /// Video price per second, billed as `duration * TOKENS_PER_SEC` completion tokens.
    pub fn per_second(price_usd: f64) -> Self {
        Self::new(price_usd * QUOTA_PER_USD / TOKENS_PER_SEC as f64, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_per_million_conversion() {
        let c = ModelConfig::per_million(30.0, 60.0, Currency::Usd);
        assert_eq!(c.ratio, 15.0);
        assert_eq!(c.completion_ratio, 2.0);
        let free = ModelConfig::per_million(0.0, 3.0, Currency::Rmb);
        assert_eq!(free.completion_ratio, 1.0);
    }

    #[test]
    fn test_video_second_costs_its_price() {
        let c = ModelConfig::per_second(0.5);
        let quota = c.ratio * TOKENS_PER_SEC as f64;
        assert!((quota / QUOTA_PER_USD - 0.5).abs() < 1e-9);
    }
}
