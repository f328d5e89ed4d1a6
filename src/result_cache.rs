//! Bounded, time-limited cache of hybrid search results.
//!
//! Entries are tagged with the [`IndexStore`](crate::store::IndexStore)
//! generation they were computed at. Seeing a newer generation empties the
//! cache, and results computed against an older one are never stored, so a
//! commit is never hidden behind a cached result set.

use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::embedding::cache::LruCache;
use crate::models::SearchResult;

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ResultCacheStats {
    pub size: usize,
    pub max_size: usize,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    pub ttl_secs: u64,
}

#[derive(Debug)]
struct State {
    generation: u64,
    lru: LruCache<String, (Vec<SearchResult>, Instant)>,
    hits: u64,
    misses: u64,
}

impl State {
    fn observe(&mut self, generation: u64) {
        if generation > self.generation {
            if !self.lru.is_empty() {
                tracing::debug!(generation, "index changed, clearing result cache");
            }
            self.lru.clear();
            self.generation = generation;
        }
    }
}

#[derive(Debug)]
pub struct ResultCache {
    state: Mutex<State>,
    max_size: usize,
    ttl: Duration,
}

impl ResultCache {
    /// `max_size == 0` or a zero `ttl` disables caching.
    pub fn new(max_size: usize, ttl: Duration) -> Self {
        Self {
            state: Mutex::new(State {
                generation: 0,
                lru: LruCache::new(max_size),
                hits: 0,
                misses: 0,
            }),
            max_size,
            ttl,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.max_size > 0 && !self.ttl.is_zero()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Results stored under `key`, unless they expired or the index moved
    /// past them.
    pub fn get(&self, key: &str, generation: u64) -> Option<Vec<SearchResult>> {
        if !self.is_enabled() {
            return None;
        }
        let mut state = self.state();
        state.observe(generation);
        let key = key.to_string();
        match state.lru.get(&key) {
            Some((results, stored_at)) if stored_at.elapsed() < self.ttl => {
                state.hits += 1;
                Some(results)
            }
            Some(_) => {
                state.lru.remove(&key);
                state.misses += 1;
                None
            }
            None => {
                state.misses += 1;
                None
            }
        }
    }

    /// Store results computed at `generation`. Stale generations are
    /// dropped.
    pub fn put(&self, key: String, generation: u64, results: Vec<SearchResult>) {
        if !self.is_enabled() {
            return;
        }
        let mut state = self.state();
        if generation < state.generation {
            return;
        }
        state.observe(generation);
        state.lru.put(key, (results, Instant::now()));
    }

    pub fn clear(&self) {
        let mut state = self.state();
        state.lru.clear();
        state.hits = 0;
        state.misses = 0;
    }

    pub fn stats(&self) -> ResultCacheStats {
        let state = self.state();
        let total = state.hits + state.misses;
        ResultCacheStats {
            size: state.lru.len(),
            max_size: self.max_size,
            hits: state.hits,
            misses: state.misses,
            hit_rate: if total > 0 {
                state.hits as f64 / total as f64
            } else {
                0.0
            },
            ttl_secs: self.ttl.as_secs(),
        }
    }
}
