//! Process-wide merged price registry.

use super::{ModelConfig, PricingMap};
use crate::adaptor::{get_adaptor, ApiType};
use crate::config::RelayConfig;
use arc_swap::ArcSwapOption;
use once_cell::sync::Lazy;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

#[derive(Debug, Default)]
struct Snapshot {
    models: PricingMap,
    /// Adaptor whose entry won for each model.
    sources: HashMap<String, ApiType>,
    contributors: Vec<ApiType>,
    conflicts: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct PricingStats {
    pub loaded: bool,
    pub models: usize,
    pub contributors: Vec<ApiType>,
    pub conflicts: usize,
}

/// Merges the price lists of the contributing adaptors. The first adaptor to
/// list a model wins; later disagreeing entries are logged and ignored.
///
/// The merged map is built on first use and then read without locking.
pub struct GlobalPricingManager {
    snapshot: ArcSwapOption<Snapshot>,
    init: Mutex<()>,
    contributors: Mutex<Option<Vec<ApiType>>>,
}

static GLOBAL: Lazy<GlobalPricingManager> = Lazy::new(GlobalPricingManager::new);

impl Default for GlobalPricingManager {
    fn default() -> Self {
        Self::new()
    }
}

impl GlobalPricingManager {
    /// Manager reading its contributor list from [`RelayConfig::global`].
    pub fn new() -> Self {
        Self {
            snapshot: ArcSwapOption::empty(),
            init: Mutex::new(()),
            contributors: Mutex::new(None),
        }
    }

    pub fn with_contributors(contributors: Vec<ApiType>) -> Self {
        let m = Self::new();
        *m.contributors.lock().unwrap_or_else(PoisonError::into_inner) = Some(contributors);
        m
    }

    pub fn global() -> &'static GlobalPricingManager {
        &GLOBAL
    }

    fn contributor_list(&self) -> Vec<ApiType> {
        self.contributors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .unwrap_or_else(|| RelayConfig::global().contributing_adaptors.clone())
    }

    fn build(contributors: Vec<ApiType>) -> Snapshot {
        let mut snap = Snapshot {
            contributors: contributors.clone(),
            ..Default::default()
        };
        for api_type in contributors {
            let Some(adaptor) = get_adaptor(api_type) else {
                tracing::warn!(api_type = ?api_type, "contributing adaptor not registered");
                continue;
            };
            for (model, config) in adaptor.default_model_pricing().iter() {
                match snap.sources.get(model) {
                    Some(owner) => {
                        let kept = snap.models[model];
                        if kept != *config {
                            snap.conflicts += 1;
                            tracing::warn!(
                                model = %model,
                                kept_from = ?owner,
                                ignored_from = ?api_type,
                                kept_ratio = kept.ratio,
                                ignored_ratio = config.ratio,
                                "pricing conflict in global registry"
                            );
                        }
                    }
                    None => {
                        snap.models.insert(model.clone(), *config);
                        snap.sources.insert(model.clone(), api_type);
                    }
                }
            }
        }
        tracing::info!(
            models = snap.models.len(),
            contributors = snap.contributors.len(),
            conflicts = snap.conflicts,
            "global pricing registry built"
        );
        snap
    }

    fn loaded(&self) -> Arc<Snapshot> {
        if let Some(snap) = self.snapshot.load_full() {
            return snap;
        }
        let _guard = self.init.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(snap) = self.snapshot.load_full() {
            return snap;
        }
        let snap = Arc::new(Self::build(self.contributor_list()));
        self.snapshot.store(Some(snap.clone()));
        snap
    }

    pub fn lookup(&self, model: &str) -> Option<ModelConfig> {
        self.loaded().models.get(model).copied()
    }

    pub fn model_ratio(&self, model: &str) -> Option<f64> {
        self.lookup(model).map(|c| c.ratio)
    }

    pub fn completion_ratio(&self, model: &str) -> Option<f64> {
        self.lookup(model).map(|c| c.completion_ratio)
    }

    /// Adaptor that supplied `model`'s price.
    pub fn source_of(&self, model: &str) -> Option<ApiType> {
        self.loaded().sources.get(model).copied()
    }

    /// Copy of the merged map.
    pub fn all(&self) -> PricingMap {
        self.loaded().models.clone()
    }

    /// Rebuilds the registry from the current contributor list.
    pub fn reload(&self) {
        let _guard = self.init.lock().unwrap_or_else(PoisonError::into_inner);
        let snap = Arc::new(Self::build(self.contributor_list()));
        self.snapshot.store(Some(snap));
    }

    /// Replaces the contributor list and rebuilds.
    pub fn set_contributors(&self, contributors: Vec<ApiType>) {
        *self.contributors.lock().unwrap_or_else(PoisonError::into_inner) = Some(contributors);
        self.reload();
    }

    pub fn stats(&self) -> PricingStats {
        match self.snapshot.load_full() {
            Some(snap) => PricingStats {
                loaded: true,
                models: snap.models.len(),
                contributors: snap.contributors.clone(),
                conflicts: snap.conflicts,
            },
            None => PricingStats {
                loaded: false,
                models: 0,
                contributors: self.contributor_list(),
                conflicts: 0,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pricing::{table, MILLI_TOKENS_USD};

    #[test]
    fn test_first_contributor_wins() {
        let m = GlobalPricingManager::with_contributors(vec![ApiType::OpenAI, ApiType::AIProxyLibrary]);
        assert!(!m.stats().loaded);
        assert_eq!(m.model_ratio("gpt-4"), Some(30.0 * MILLI_TOKENS_USD));
        assert_eq!(m.source_of("gpt-4"), Some(ApiType::OpenAI));
        assert!(m.stats().loaded);
    }

    #[test]
    fn test_conflicts_counted_and_order_matters() {
        let a = GlobalPricingManager::with_contributors(vec![ApiType::Anthropic, ApiType::AwsClaude]);
        let b = GlobalPricingManager::with_contributors(vec![ApiType::AwsClaude, ApiType::Anthropic]);
        assert_eq!(a.source_of("claude-2.1"), Some(ApiType::Anthropic));
        assert_eq!(b.source_of("claude-2.1"), Some(ApiType::AwsClaude));
        assert_eq!(a.lookup("claude-3-opus"), table("anthropic").get("claude-3-opus").copied());
    }

    #[test]
    fn test_reload_picks_up_new_contributors() {
        let m = GlobalPricingManager::with_contributors(vec![ApiType::OpenAI]);
        assert!(m.lookup("claude-3-opus").is_none());
        m.set_contributors(vec![ApiType::OpenAI, ApiType::Anthropic]);
        assert!(m.lookup("claude-3-opus").is_some());
        assert_eq!(m.stats().contributors.len(), 2);
    }
}
