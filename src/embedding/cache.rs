//! Fixed-capacity LRU cache for embedding vectors.
//!
//! Keys are SHA-256 digests of the embedded text. The cache remembers the
//! model that produced its entries and empties itself the first time it
//! is used with a different model id.

use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;
use std::sync::{Mutex, PoisonError};

use serde::Serialize;
use sha2::{Digest, Sha256};

/// Least-recently-used map with a hard entry limit.
///
/// Recency is a monotonically increasing tick; `order` maps tick to key so
/// the oldest entry is the first in the tree.
#[derive(Debug)]
pub struct LruCache<K, V> {
    capacity: usize,
    tick: u64,
    entries: HashMap<K, (V, u64)>,
    order: BTreeMap<u64, K>,
}

impl<K: Hash + Eq + Clone, V: Clone> LruCache<K, V> {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            tick: 0,
            entries: HashMap::new(),
            order: BTreeMap::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Look up and mark as most recently used.
    pub fn get(&mut self, key: &K) -> Option<V> {
        self.tick += 1;
        let tick = self.tick;
        let (value, used) = self.entries.get_mut(key)?;
        self.order.remove(used);
        *used = tick;
        self.order.insert(tick, key.clone());
        Some(value.clone())
    }

    /// Insert or refresh, evicting the least recently used entry when full.
    pub fn put(&mut self, key: K, value: V) {
        self.tick += 1;
        if let Some((_, used)) = self.entries.remove(&key) {
            self.order.remove(&used);
        }
        while self.entries.len() >= self.capacity {
            match self.order.pop_first() {
                Some((_, oldest)) => {
                    self.entries.remove(&oldest);
                }
                None => break,
            }
        }
        self.order.insert(self.tick, key.clone());
        self.entries.insert(key, (value, self.tick));
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        let (value, used) = self.entries.remove(key)?;
        self.order.remove(&used);
        Some(value)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
    }
}

/// Counters reported by [`EmbeddingCache::stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
    pub capacity: usize,
}

#[derive(Debug)]
struct CacheState {
    model_id: Option<String>,
    lru: LruCache<String, Vec<f32>>,
    hits: u64,
    misses: u64,
}

impl CacheState {
    fn switch_model(&mut self, model_id: &str) {
        if self.model_id.as_deref() != Some(model_id) {
            if self.model_id.is_some() {
                tracing::debug!(model = model_id, "embedding model changed, clearing cache");
            }
            self.lru.clear();
            self.model_id = Some(model_id.to_string());
        }
    }
}

/// Thread-safe embedding cache shared by all pipeline workers.
#[derive(Debug)]
pub struct EmbeddingCache {
    state: Mutex<CacheState>,
}

impl EmbeddingCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(CacheState {
                model_id: None,
                lru: LruCache::new(capacity),
                hits: 0,
                misses: 0,
            }),
        }
    }

    /// Cache key for a text.
    pub fn key(text: &str) -> String {
        format!("{:x}", Sha256::digest(text.as_bytes()))
    }

    pub fn get(&self, model_id: &str, key: &str) -> Option<Vec<f32>> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.switch_model(model_id);
        let found = state.lru.get(&key.to_string());
        if found.is_some() {
            state.hits += 1;
        } else {
            state.misses += 1;
        }
        found
    }

    pub fn put(&self, model_id: &str, key: String, vector: Vec<f32>) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.switch_model(model_id);
        state.lru.put(key, vector);
    }

    pub fn clear(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.lru.clear();
    }

    pub fn stats(&self) -> CacheStats {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        CacheStats {
            hits: state.hits,
            misses: state.misses,
            entries: state.lru.len(),
            capacity: state.lru.capacity(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn evicts_least_recently_used() {
        let mut lru = LruCache::new(2);
        lru.put("a", 1);
        lru.put("b", 2);
        assert_eq!(lru.get(&"a"), Some(1));
        lru.put("c", 3);
        assert_eq!(lru.get(&"b"), None);
        assert_eq!(lru.get(&"a"), Some(1));
        assert_eq!(lru.get(&"c"), Some(3));
        assert_eq!(lru.len(), 2);
    }

    #[test]
    fn reinserting_refreshes_without_growth() {
        let mut lru = LruCache::new(2);
        lru.put("a", 1);
        lru.put("a", 10);
        lru.put("b", 2);
        assert_eq!(lru.len(), 2);
        assert_eq!(lru.get(&"a"), Some(10));
        assert_eq!(lru.remove(&"a"), Some(10));
        assert_eq!(lru.remove(&"a"), None);
        assert_eq!(lru.len(), 1);
    }

    #[test]
    fn model_change_invalidates() {
        let cache = EmbeddingCache::new(8);
        let key = EmbeddingCache::key("hello");
        cache.put("model-a", key.clone(), vec![1.0, 0.0]);
        assert_eq!(cache.get("model-a", &key), Some(vec![1.0, 0.0]));
        assert_eq!(cache.get("model-b", &key), None);
        assert_eq!(cache.get("model-a", &key), None);

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 2);
        assert_eq!(stats.capacity, 8);
    }

    #[test]
    fn keys_are_sha256_hex() {
        let key = EmbeddingCache::key("abc");
        assert_eq!(
            key,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
