// Operation result cache
//
// LRU cache of fetch outputs with TTL expiry. Keys include the contract
// version the fetch was validated against, so a schema change never serves a
// result shaped by the old contract.

use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use crate::config::CacheConfig;
use crate::models::{OperationOutput, QueryPayload};

#[derive(Debug, Clone)]
struct CachedOutput {
    output: OperationOutput,
    cached_at: Instant,
    ttl: Duration,
    /// Logical clock value of the last access; lowest is evicted first.
    last_access: u64,
    hit_count: u64,
}

impl CachedOutput {
    fn is_expired(&self) -> bool {
        self.cached_at.elapsed() > self.ttl
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,
}

impl CacheStats {
    /// Hit ratio in [0.0, 1.0]
    pub fn hit_ratio(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[derive(Debug, Default)]
struct CacheState {
    entries: HashMap<String, CachedOutput>,
    clock: u64,
    stats: CacheStats,
}

impl CacheState {
    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn evict_lru(&mut self) {
        let oldest = self
            .entries
            .iter()
            .min_by_key(|(_, cached)| cached.last_access)
            .map(|(key, _)| key.clone());
        if let Some(key) = oldest {
            self.entries.remove(&key);
            self.stats.evictions += 1;
            tracing::debug!(key = %key, "evicted cache entry");
        }
    }
}

pub struct ResultCache {
    state: Mutex<CacheState>,
    max_entries: usize,
    default_ttl: Duration,
}

impl ResultCache {
    pub fn new(max_entries: usize, default_ttl: Duration) -> Self {
        Self {
            state: Mutex::new(CacheState::default()),
            max_entries: max_entries.max(1),
            default_ttl,
        }
    }

    /// `None` when caching is disabled.
    pub fn from_config(config: &CacheConfig) -> Option<Self> {
        config
            .enabled
            .then(|| Self::new(config.max_entries, Duration::from_secs(config.ttl_secs)))
    }

    /// Key over (source, payload, contract hash).
    pub fn key(source_id: &str, payload: &QueryPayload, contract_hash: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(source_id.as_bytes());
        hasher.update([0u8]);
        hasher.update(payload.fingerprint().as_bytes());
        hasher.update([0u8]);
        hasher.update(contract_hash.as_bytes());
        format!("{}:{:x}", source_id, hasher.finalize())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Cached output marked `from_cache`, or `None` on miss or expiry.
    pub fn get(&self, key: &str) -> Option<OperationOutput> {
        let mut guard = self.lock();
        let state = &mut *guard;
        let now = state.tick();

        let expired = match state.entries.get_mut(key) {
            None => {
                state.stats.misses += 1;
                return None;
            }
            Some(cached) if cached.is_expired() => true,
            Some(cached) => {
                cached.last_access = now;
                cached.hit_count += 1;
                let mut output = cached.output.clone();
                output.from_cache = true;
                state.stats.hits += 1;
                tracing::debug!(key, hits = cached.hit_count, "cache hit");
                return Some(output);
            }
        };

        if expired {
            state.entries.remove(key);
            state.stats.misses += 1;
            state.stats.expirations += 1;
            tracing::debug!(key, "cache entry expired");
        }
        None
    }

    pub fn put(&self, key: String, output: OperationOutput, ttl: Option<Duration>) {
        let mut state = self.lock();
        if state.entries.len() >= self.max_entries && !state.entries.contains_key(&key) {
            state.evict_lru();
        }
        let now = state.tick();
        state.entries.insert(
            key,
            CachedOutput {
                output,
                cached_at: Instant::now(),
                ttl: ttl.unwrap_or(self.default_ttl),
                last_access: now,
                hit_count: 0,
            },
        );
    }

    pub fn clear(&self) {
        let mut state = self.lock();
        let count = state.entries.len();
        state.entries.clear();
        tracing::info!(count, "cleared result cache");
    }

    /// Drop expired entries; returns how many were removed.
    pub fn cleanup_expired(&self) -> usize {
        let mut state = self.lock();
        let before = state.entries.len();
        state.entries.retain(|_, cached| !cached.is_expired());
        let removed = before - state.entries.len();
        state.stats.expirations += removed as u64;
        removed
    }

    pub fn stats(&self) -> CacheStats {
        self.lock().stats.clone()
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
