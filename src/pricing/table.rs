//! Embedded price lists.

use super::ModelConfig;
use crate::{Error, ErrorContext, Result};
use once_cell::sync::Lazy;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

pub type PricingMap = HashMap<String, ModelConfig>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Currency {
    Usd,
    Rmb,
}

#[derive(Debug, Deserialize)]
struct PricingFile {
    currency: Currency,
    #[serde(default)]
    models: BTreeMap<String, PriceEntry>,
}

/// One model line. Exactly one pricing style is expected per entry.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct PriceEntry {
    input: Option<f64>,
    output: Option<f64>,
    per_image: Option<f64>,
    per_second: Option<f64>,
    ratio: Option<f64>,
    completion_ratio: Option<f64>,
}

impl PriceEntry {
    fn into_config(self, currency: Currency) -> Option<ModelConfig> {
        if let Some(ratio) = self.ratio {
            return Some(ModelConfig::new(ratio, self.completion_ratio.unwrap_or(1.0)));
        }
        if let Some(price) = self.per_image {
            return Some(ModelConfig::per_image(price, currency));
        }
        if let Some(price) = self.per_second {
            return Some(ModelConfig::per_second(price));
        }
        let input = self.input?;
        Some(ModelConfig::per_million(input, self.output.unwrap_or(input), currency))
    }
}

/// Parses one price list document.
pub fn parse_table(yaml: &str) -> Result<PricingMap> {
    let file: PricingFile = serde_yaml::from_str(yaml).map_err(|e| {
        Error::unmarshal_with_context(e.to_string(), ErrorContext::new().with_source("pricing table"))
    })?;
    let currency = file.currency;
    let mut out = PricingMap::with_capacity(file.models.len());
    for (model, entry) in file.models {
        match entry.into_config(currency) {
            Some(config) => {
                out.insert(model, config);
            }
            None => tracing::warn!(model = %model, "pricing entry has no price, skipped"),
        }
    }
    Ok(out)
}

macro_rules! embedded_tables {
    ($($name:literal),* $(,)?) => {
        const EMBEDDED: &[(&str, &str)] = &[
            $( ($name, include_str!(concat!("../../data/pricing/", $name, ".yaml"))), )*
        ];
    };
}

embedded_tables!(
    "ai360",
    "aiproxy",
    "ali",
    "anthropic",
    "aws",
    "baichuan",
    "baidu",
    "cloudflare",
    "cohere",
    "coze",
    "deepl",
    "deepseek",
    "doubao",
    "gemini",
    "groq",
    "lingyiwanwu",
    "minimax",
    "mistral",
    "moonshot",
    "novita",
    "ollama",
    "openai",
    "openrouter",
    "palm",
    "proxy",
    "replicate",
    "siliconflow",
    "stepfun",
    "tencent",
    "togetherai",
    "vertexai",
    "xai",
    "xunfei",
    "zhipu",
);

static TABLES: Lazy<HashMap<&'static str, Arc<PricingMap>>> = Lazy::new(|| {
    EMBEDDED
        .iter()
        .map(|(name, yaml)| {
            let map = parse_table(yaml).unwrap_or_else(|e| {
                tracing::error!(table = *name, error = %e, "failed to load pricing table");
                PricingMap::new()
            });
            (*name, Arc::new(map))
        })
        .collect()
});

static EMPTY: Lazy<Arc<PricingMap>> = Lazy::new(|| Arc::new(PricingMap::new()));

/// Price list by name (`openai`, `anthropic`, ...). Unknown names yield an empty map.
pub fn table(name: &str) -> Arc<PricingMap> {
    TABLES.get(name).cloned().unwrap_or_else(|| EMPTY.clone())
}

pub fn table_names() -> Vec<&'static str> {
    EMBEDDED.iter().map(|(name, _)| *name).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pricing::{IMAGE_USD_PER_PIC, MILLI_TOKENS_RMB, MILLI_TOKENS_USD};

    #[test]
    fn test_all_embedded_tables_parse() {
        for (name, yaml) in EMBEDDED {
            assert!(parse_table(yaml).is_ok(), "table {} failed to parse", name);
        }
    }

    #[test]
    fn test_known_prices() {
        let openai = table("openai");
        assert_eq!(openai["gpt-4"].ratio, 30.0 * MILLI_TOKENS_USD);
        assert_eq!(openai["gpt-4"].completion_ratio, 2.0);
        assert_eq!(openai["dall-e-3"].ratio, 0.04 * IMAGE_USD_PER_PIC);
        assert_eq!(table("anthropic")["claude-3-opus"].ratio, 15.0 * MILLI_TOKENS_USD);
        assert_eq!(table("deepseek")["deepseek-chat"].ratio, 2.0 * MILLI_TOKENS_RMB);
    }

    #[test]
    fn test_styles_and_errors() {
        let map = parse_table(
            "currency: usd\nmodels:\n  a: { ratio: 2, completion_ratio: 3 }\n  b: { input: 4 }\n  c: {}\n",
        )
        .unwrap();
        assert_eq!(map["a"], ModelConfig::new(2.0, 3.0));
        assert_eq!(map["b"].completion_ratio, 1.0);
        assert!(!map.contains_key("c"));
        assert!(parse_table("currency: eur\nmodels: {}").is_err());
        assert!(table("nope").is_empty());
    }
}
