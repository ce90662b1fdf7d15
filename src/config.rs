//! 运行时配置：环境变量优先，可由构建器或 YAML 覆盖。
//!
//! Runtime configuration for the relay core.
//!
//! | Variable | Field | Default |
//! |----------|-------|---------|
//! | `RELAY_PROXY_URL` | `proxy_url` | none |
//! | `RELAY_CONNECT_TIMEOUT_SECS` | `connect_timeout_secs` | 10 |
//! | `RELAY_POOL_MAX_IDLE_PER_HOST` | `pool_max_idle_per_host` | 32 |
//! | `RELAY_POOL_IDLE_TIMEOUT_SECS` | `pool_idle_timeout_secs` | 90 |
//! | `RELAY_MAX_LINE_BYTES` | `max_line_bytes` | 16 MiB (floor 1 MiB) |
//! | `RELAY_SIGNATURE_TTL_SECS` | `signature_ttl_secs` | 86400 |
//! | `RELAY_SIGNATURE_SWEEP_SECS` | `signature_sweep_interval_secs` | 3600 |
//! | `RELAY_VIDEO_POLL_SECS` | `video_poll_interval_secs` | 5 |
//! | `RELAY_PRICING_ADAPTORS` | `contributing_adaptors` | openai,anthropic,gemini,... |
//! | `RELAY_ANTHROPIC_VERSION` | `anthropic_version` | `2023-06-01` |
//!
//! The process-wide instance is read with [`RelayConfig::global`] and replaced
//! with [`RelayConfig::install`]. Replacing it does not rebuild clients or
//! caches that were already created from the previous value.

use crate::adaptor::ApiType;
use crate::{Error, ErrorContext, Result};
use arc_swap::ArcSwap;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::env;
use std::sync::Arc;
use std::time::Duration;

pub const MIN_LINE_BYTES: usize = 1024 * 1024;
pub const DEFAULT_LINE_BYTES: usize = 16 * 1024 * 1024;
pub const DEFAULT_ANTHROPIC_VERSION: &str = "2023-06-01";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub proxy_url: Option<String>,
    pub connect_timeout_secs: u64,
    pub pool_max_idle_per_host: usize,
    pub pool_idle_timeout_secs: u64,
    pub max_line_bytes: usize,
    pub signature_ttl_secs: u64,
    pub signature_sweep_interval_secs: u64,
    pub video_poll_interval_secs: u64,
    /// Adaptors whose price lists feed the global registry, in priority order.
    pub contributing_adaptors: Vec<ApiType>,
    pub anthropic_version: String,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            proxy_url: None,
            connect_timeout_secs: 10,
            pool_max_idle_per_host: 32,
            pool_idle_timeout_secs: 90,
            max_line_bytes: DEFAULT_LINE_BYTES,
            signature_ttl_secs: 24 * 60 * 60,
            signature_sweep_interval_secs: 60 * 60,
            video_poll_interval_secs: 5,
            contributing_adaptors: default_contributors(),
            anthropic_version: DEFAULT_ANTHROPIC_VERSION.to_string(),
        }
    }
}

fn default_contributors() -> Vec<ApiType> {
    vec![
        ApiType::OpenAI,
        ApiType::Anthropic,
        ApiType::Gemini,
        ApiType::Ali,
        ApiType::Baidu,
        ApiType::Zhipu,
        ApiType::Tencent,
        ApiType::Xunfei,
        ApiType::DeepSeek,
        ApiType::Moonshot,
    ]
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    env::var(name).ok().and_then(|s| s.trim().parse::<T>().ok())
}

static GLOBAL: Lazy<ArcSwap<RelayConfig>> =
    Lazy::new(|| ArcSwap::from_pointee(RelayConfig::from_env()));

impl RelayConfig {
    /// Defaults overlaid with `RELAY_*` environment variables.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Ok(url) = env::var("RELAY_PROXY_URL") {
            if !url.trim().is_empty() {
                cfg.proxy_url = Some(url);
            }
        }
        if let Some(v) = env_parse("RELAY_CONNECT_TIMEOUT_SECS") {
            cfg.connect_timeout_secs = v;
        }
        if let Some(v) = env_parse("RELAY_POOL_MAX_IDLE_PER_HOST") {
            cfg.pool_max_idle_per_host = v;
        }
        if let Some(v) = env_parse("RELAY_POOL_IDLE_TIMEOUT_SECS") {
            cfg.pool_idle_timeout_secs = v;
        }
        if let Some(v) = env_parse::<usize>("RELAY_MAX_LINE_BYTES") {
            cfg.max_line_bytes = v;
        }
        if let Some(v) = env_parse("RELAY_SIGNATURE_TTL_SECS") {
            cfg.signature_ttl_secs = v;
        }
        if let Some(v) = env_parse("RELAY_SIGNATURE_SWEEP_SECS") {
            cfg.signature_sweep_interval_secs = v;
        }
        if let Some(v) = env_parse("RELAY_VIDEO_POLL_SECS") {
            cfg.video_poll_interval_secs = v;
        }
        if let Ok(list) = env::var("RELAY_PRICING_ADAPTORS") {
            let parsed: Vec<ApiType> = list
                .split(',')
                .filter_map(|s| {
                    let name = s.trim();
                    let api = ApiType::from_name(name);
                    if api.is_none() && !name.is_empty() {
                        tracing::warn!(adaptor = name, "unknown adaptor in RELAY_PRICING_ADAPTORS");
                    }
                    api
                })
                .collect();
            if !parsed.is_empty() {
                cfg.contributing_adaptors = parsed;
            }
        }
        if let Ok(v) = env::var("RELAY_ANTHROPIC_VERSION") {
            if !v.trim().is_empty() {
                cfg.anthropic_version = v;
            }
        }
        cfg.normalized()
    }

    /// Parses a YAML document; missing fields keep their defaults.
    pub fn from_yaml(text: &str) -> Result<Self> {
        let cfg: RelayConfig = serde_yaml::from_str(text).map_err(|e| {
            Error::invalid_request_with_context(
                format!("invalid relay config: {}", e),
                ErrorContext::new().with_source("config.from_yaml"),
            )
        })?;
        Ok(cfg.normalized())
    }

    fn normalized(mut self) -> Self {
        self.max_line_bytes = self.max_line_bytes.max(MIN_LINE_BYTES);
        if self.signature_sweep_interval_secs == 0 {
            self.signature_sweep_interval_secs = 60 * 60;
        }
        if self.video_poll_interval_secs == 0 {
            self.video_poll_interval_secs = 5;
        }
        self
    }

    pub fn with_proxy_url(mut self, url: impl Into<String>) -> Self {
        self.proxy_url = Some(url.into());
        self
    }

    pub fn with_max_line_bytes(mut self, n: usize) -> Self {
        self.max_line_bytes = n.max(MIN_LINE_BYTES);
        self
    }

    pub fn with_signature_ttl(mut self, ttl: Duration) -> Self {
        self.signature_ttl_secs = ttl.as_secs();
        self
    }

    pub fn with_video_poll_interval(mut self, interval: Duration) -> Self {
        self.video_poll_interval_secs = interval.as_secs().max(1);
        self
    }

    pub fn with_contributing_adaptors(mut self, adaptors: Vec<ApiType>) -> Self {
        self.contributing_adaptors = adaptors;
        self
    }

    pub fn with_anthropic_version(mut self, v: impl Into<String>) -> Self {
        self.anthropic_version = v.into();
        self
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn pool_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.pool_idle_timeout_secs)
    }

    pub fn signature_ttl(&self) -> Duration {
        Duration::from_secs(self.signature_ttl_secs)
    }

    pub fn signature_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.signature_sweep_interval_secs)
    }

    pub fn video_poll_interval(&self) -> Duration {
        Duration::from_secs(self.video_poll_interval_secs)
    }

    /// Current process-wide configuration.
    pub fn global() -> Arc<RelayConfig> {
        GLOBAL.load_full()
    }

    /// Replaces the process-wide configuration.
    pub fn install(self) {
        GLOBAL.store(Arc::new(self.normalized()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_yaml_overrides_and_floor() {
        let cfg = RelayConfig::from_yaml(
            "max_line_bytes: 1024\nvideo_poll_interval_secs: 2\ncontributing_adaptors: [Anthropic, OpenAI]\n",
        )
        .unwrap();
        assert_eq!(cfg.max_line_bytes, MIN_LINE_BYTES);
        assert_eq!(cfg.video_poll_interval(), Duration::from_secs(2));
        assert_eq!(cfg.contributing_adaptors, vec![ApiType::Anthropic, ApiType::OpenAI]);
        assert_eq!(cfg.anthropic_version, DEFAULT_ANTHROPIC_VERSION);
    }

    #[test]
    fn test_defaults() {
        let cfg = RelayConfig::default();
        assert_eq!(cfg.max_line_bytes, DEFAULT_LINE_BYTES);
        assert_eq!(cfg.signature_ttl(), Duration::from_secs(86_400));
        assert_eq!(cfg.contributing_adaptors[0], ApiType::OpenAI);
    }
}
