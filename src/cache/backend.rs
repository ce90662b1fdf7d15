//! Signature cache storage: the pluggable external backend trait and the
//! in-memory TTL store.

use crate::Result;
use async_trait::async_trait;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::{PoisonError, RwLock};
use std::time::{Duration, Instant};

/// External cache the host may slot in (Redis, memcached, ...).
#[async_trait]
pub trait SignatureBackend: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;
    async fn delete(&self, key: &str) -> Result<()>;
    fn name(&self) -> &'static str;
}

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Instant,
}

#[derive(Default)]
struct Inner {
    entries: HashMap<String, Entry>,
    // Min-heap of (expiry, key). Stale pairs (key rewritten or deleted) are
    // skipped when popped.
    expiry: BinaryHeap<Reverse<(Instant, String)>>,
}

/// In-memory TTL map with a min-heap of expiry times.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<String> {
        {
            let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
            match inner.entries.get(key) {
                None => return None,
                Some(e) if e.expires_at > Instant::now() => return Some(e.value.clone()),
                Some(_) => {}
            }
        }
        // Expired: evict lazily under the write lock.
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        if inner
            .entries
            .get(key)
            .map_or(false, |e| e.expires_at <= Instant::now())
        {
            inner.entries.remove(key);
        }
        None
    }

    pub fn set(&self, key: &str, value: &str, ttl: Duration) {
        let expires_at = Instant::now() + ttl;
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        inner.entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at,
            },
        );
        inner.expiry.push(Reverse((expires_at, key.to_string())));
    }

    pub fn delete(&self, key: &str) -> bool {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        inner.entries.remove(key).is_some()
    }

    /// Removes every expired entry; returns how many were dropped.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let mut removed = 0;
        while let Some(Reverse((at, _))) = inner.expiry.peek() {
            if *at > now {
                break;
            }
            let Some(Reverse((at, key))) = inner.expiry.pop() else {
                break;
            };
            if inner.entries.get(&key).map_or(false, |e| e.expires_at == at) {
                inner.entries.remove(&key);
                removed += 1;
            }
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rewrite_survives_stale_heap_entry() {
        let store = MemoryStore::new();
        store.set("k", "old", Duration::from_millis(0));
        store.set("k", "new", Duration::from_secs(60));
        assert_eq!(store.sweep(), 0);
        assert_eq!(store.get("k").as_deref(), Some("new"));
    }

    #[test]
    fn test_sweep_drops_expired() {
        let store = MemoryStore::new();
        store.set("a", "1", Duration::from_millis(0));
        store.set("b", "2", Duration::from_secs(60));
        std::thread::sleep(Duration::from_millis(2));
        assert_eq!(store.sweep(), 1);
        assert_eq!(store.len(), 1);
    }
}
