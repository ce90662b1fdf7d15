//! Thinking-signature cache.
//!
//! Writes go to the external backend when one is registered and fall back to
//! memory if it fails. Reads ask the backend first; a miss or an error falls
//! through to memory.

use super::backend::{MemoryStore, SignatureBackend};
use super::key::SignatureKey;
use crate::config::RelayConfig;
use once_cell::sync::Lazy;
use std::sync::{Arc, PoisonError, RwLock, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;

pub struct SignatureCache {
    memory: MemoryStore,
    backend: RwLock<Option<Arc<dyn SignatureBackend>>>,
    ttl: Duration,
}

impl SignatureCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            memory: MemoryStore::new(),
            backend: RwLock::new(None),
            ttl,
        }
    }

    pub fn with_backend(self, backend: Arc<dyn SignatureBackend>) -> Self {
        self.set_backend(Some(backend));
        self
    }

    /// Registers or clears the external backend.
    pub fn set_backend(&self, backend: Option<Arc<dyn SignatureBackend>>) {
        *self.backend.write().unwrap_or_else(PoisonError::into_inner) = backend;
    }

    fn backend(&self) -> Option<Arc<dyn SignatureBackend>> {
        self.backend
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub async fn store(&self, key: &SignatureKey, signature: &str) {
        let key = key.to_string();
        if let Some(backend) = self.backend() {
            match backend.set(&key, signature, self.ttl).await {
                Ok(()) => return,
                Err(e) => tracing::warn!(
                    backend = backend.name(),
                    error = %e,
                    "signature backend write failed, keeping it in memory"
                ),
            }
        }
        self.memory.set(&key, signature, self.ttl);
    }

    pub async fn get(&self, key: &SignatureKey) -> Option<String> {
        let key = key.to_string();
        if let Some(backend) = self.backend() {
            match backend.get(&key).await {
                Ok(Some(sig)) => return Some(sig),
                Ok(None) => {}
                Err(e) => tracing::debug!(backend = backend.name(), error = %e, "signature backend read failed"),
            }
        }
        self.memory.get(&key)
    }

    pub async fn delete(&self, key: &SignatureKey) {
        let key = key.to_string();
        if let Some(backend) = self.backend() {
            if let Err(e) = backend.delete(&key).await {
                tracing::debug!(backend = backend.name(), error = %e, "signature backend delete failed");
            }
        }
        self.memory.delete(&key);
    }

    /// Drops expired in-memory entries.
    pub fn sweep_expired(&self) -> usize {
        self.memory.sweep()
    }

    /// Number of in-memory entries, expired ones included until swept.
    pub fn len(&self) -> usize {
        self.memory.len()
    }

    pub fn is_empty(&self) -> bool {
        self.memory.is_empty()
    }

    /// Spawns the periodic sweeper. It stops once the cache is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(cache) = weak.upgrade() else {
                    break;
                };
                let removed = cache.sweep_expired();
                if removed > 0 {
                    tracing::debug!(removed, remaining = cache.len(), "swept expired signatures");
                }
            }
        })
    }
}

static GLOBAL: Lazy<Arc<SignatureCache>> = Lazy::new(|| {
    let cfg = RelayConfig::global();
    let cache = Arc::new(SignatureCache::new(cfg.signature_ttl()));
    // Only start the sweeper when a runtime is around; callers without one
    // still get lazy eviction on read.
    if tokio::runtime::Handle::try_current().is_ok() {
        cache.spawn_sweeper(cfg.signature_sweep_interval());
    }
    cache
});

/// Process-wide cache shared by every request.
pub fn global_signature_cache() -> Arc<SignatureCache> {
    GLOBAL.clone()
}
