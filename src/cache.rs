//! Bounded LRU cache with per-entry expiration.
//!
//! Substrate for health-verdict caching and adapter-level memoization.
//! Single-threaded by design: share it across tasks behind a mutex, and
//! never hold that mutex across a suspension point.
//!
//! Callback failures are captured, counted and logged; they never abort
//! the cache operation that triggered them.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use crate::clock::{Clock, MonotonicClock};
use crate::error::{CallbackError, RpcError};

/// Invoked with the key and value of an entry leaving the cache.
pub type RemovalCallback<V> = Arc<dyn Fn(&str, &V) -> Result<(), CallbackError> + Send + Sync>;

#[derive(Debug)]
struct CacheEntry<V> {
    value: V,
    expires_at: u64,
    last_accessed: u64,
    access_count: u64,
}

/// Point-in-time counters reported by [`TtlCache::stats`].
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct CacheStats {
    pub size: usize,
    pub max_entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,
    pub callback_errors: u64,
    /// hits / (hits + misses), 0.0 before any lookup.
    pub hit_rate: f64,
    /// Mean access count over the currently live entries.
    pub avg_access_count: f64,
}

/// Bounded string-keyed mapping with least-recently-used eviction and
/// per-entry TTL.
pub struct TtlCache<V> {
    entries: HashMap<String, CacheEntry<V>>,
    /// Access order, least-recently-used at the front. Always holds exactly
    /// the key set of `entries`.
    order: VecDeque<String>,
    max_entries: usize,
    default_ttl: Duration,
    clock: Arc<dyn Clock>,
    on_evict: Option<RemovalCallback<V>>,
    on_expire: Option<RemovalCallback<V>>,
    hits: u64,
    misses: u64,
    evictions: u64,
    expirations: u64,
    callback_errors: u64,
}

impl<V> std::fmt::Debug for TtlCache<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TtlCache")
            .field("size", &self.entries.len())
            .field("max_entries", &self.max_entries)
            .field("default_ttl", &self.default_ttl)
            .finish_non_exhaustive()
    }
}

impl<V> TtlCache<V> {
    /// Create a cache holding at most `max_entries`, each expiring
    /// `default_ttl` after its last write.
    pub fn new(max_entries: usize, default_ttl: Duration) -> Result<Self, RpcError> {
        if max_entries == 0 {
            return Err(RpcError::validation("cache max_entries must be > 0"));
        }
        if default_ttl.is_zero() {
            return Err(RpcError::validation("cache default_ttl must be > 0"));
        }
        Ok(Self {
            entries: HashMap::new(),
            order: VecDeque::new(),
            max_entries,
            default_ttl,
            clock: Arc::new(MonotonicClock::default()),
            on_evict: None,
            on_expire: None,
            hits: 0,
            misses: 0,
            evictions: 0,
            expirations: 0,
            callback_errors: 0,
        })
    }

    /// Override the clock (useful for deterministic tests).
    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Observe entries removed by capacity eviction or explicit delete.
    pub fn with_eviction_callback(mut self, callback: RemovalCallback<V>) -> Self {
        self.on_evict = Some(callback);
        self
    }

    /// Observe entries removed because their TTL elapsed.
    pub fn with_expiration_callback(mut self, callback: RemovalCallback<V>) -> Self {
        self.on_expire = Some(callback);
        self
    }

    fn now(&self) -> u64 {
        self.clock.now_millis()
    }

    fn is_expired(&self, entry: &CacheEntry<V>, now: u64) -> bool {
        now >= entry.expires_at
    }

    fn touch_order(&mut self, key: &str) {
        self.order.retain(|k| k != key);
        self.order.push_back(key.to_string());
    }

    fn run_callback(
        callback: &Option<RemovalCallback<V>>,
        key: &str,
        value: &V,
        errors: &mut u64,
        what: &str,
    ) {
        if let Some(cb) = callback {
            if let Err(e) = cb(key, value) {
                *errors += 1;
                tracing::warn!(key, error = %e, "cache {} callback failed", what);
            }
        }
    }

    /// Look up `key`, refreshing its recency on a hit.
    ///
    /// An expired entry is removed, reported to the expiration callback and
    /// counted as a miss.
    pub fn get(&mut self, key: &str) -> Option<&V> {
        let now = self.now();
        let expired = match self.entries.get(key) {
            None => {
                self.misses += 1;
                return None;
            }
            Some(entry) => self.is_expired(entry, now),
        };
        if expired {
            self.remove_expired(key);
            self.misses += 1;
            return None;
        }

        self.hits += 1;
        self.touch_order(key);
        let entry = self.entries.get_mut(key)?;
        entry.last_accessed = now;
        entry.access_count += 1;
        Some(&entry.value)
    }

    /// Insert or overwrite `key`. `ttl` overrides the default expiration.
    ///
    /// When the cache is full, the least-recently-used entry is evicted
    /// first. An eviction-callback failure does not abort the insert.
    pub fn set(&mut self, key: impl Into<String>, value: V, ttl: Option<Duration>) {
        let key = key.into();
        let now = self.now();
        let expires_at = now + ttl.unwrap_or(self.default_ttl).as_millis() as u64;

        if let Some(entry) = self.entries.get_mut(&key) {
            entry.value = value;
            entry.expires_at = expires_at;
            entry.last_accessed = now;
            self.touch_order(&key);
            return;
        }

        if self.entries.len() >= self.max_entries {
            if let Some(lru_key) = self.order.pop_front() {
                if let Some(evicted) = self.entries.remove(&lru_key) {
                    self.evictions += 1;
                    Self::run_callback(
                        &self.on_evict,
                        &lru_key,
                        &evicted.value,
                        &mut self.callback_errors,
                        "eviction",
                    );
                }
            }
        }

        self.entries.insert(
            key.clone(),
            CacheEntry { value, expires_at, last_accessed: now, access_count: 0 },
        );
        self.order.push_back(key);
    }

    /// Presence check without refreshing recency. Expiration is still
    /// observed: an expired entry is removed and reported.
    pub fn has(&mut self, key: &str) -> bool {
        let now = self.now();
        let expired = match self.entries.get(key) {
            None => return false,
            Some(entry) => self.is_expired(entry, now),
        };
        if expired {
            self.remove_expired(key);
            return false;
        }
        true
    }

    /// Remove `key`, reporting it to the eviction callback if present.
    pub fn delete(&mut self, key: &str) -> bool {
        match self.entries.remove(key) {
            None => false,
            Some(entry) => {
                self.order.retain(|k| k != key);
                Self::run_callback(
                    &self.on_evict,
                    key,
                    &entry.value,
                    &mut self.callback_errors,
                    "eviction",
                );
                true
            }
        }
    }

    fn remove_expired(&mut self, key: &str) {
        if let Some(entry) = self.entries.remove(key) {
            self.order.retain(|k| k != key);
            self.expirations += 1;
            Self::run_callback(
                &self.on_expire,
                key,
                &entry.value,
                &mut self.callback_errors,
                "expiration",
            );
        }
    }

    /// Sweep every expired entry; returns the number removed.
    pub fn cleanup(&mut self) -> usize {
        let now = self.now();
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, entry)| now >= entry.expires_at)
            .map(|(k, _)| k.clone())
            .collect();
        for key in &expired {
            self.remove_expired(key);
        }
        expired.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every entry without firing callbacks.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
    }

    pub fn stats(&self) -> CacheStats {
        let lookups = self.hits + self.misses;
        let hit_rate =
            if lookups == 0 { 0.0 } else { self.hits as f64 / lookups as f64 };
        let avg_access_count = if self.entries.is_empty() {
            0.0
        } else {
            let total: u64 = self.entries.values().map(|e| e.access_count).sum();
            total as f64 / self.entries.len() as f64
        };
        CacheStats {
            size: self.entries.len(),
            max_entries: self.max_entries,
            hits: self.hits,
            misses: self.misses,
            evictions: self.evictions,
            expirations: self.expirations,
            callback_errors: self.callback_errors,
            hit_rate,
            avg_access_count,
        }
    }

    #[cfg(test)]
    fn order_matches_entries(&self) -> bool {
        use std::collections::HashSet;
        let order: HashSet<&String> = self.order.iter().collect();
        let keys: HashSet<&String> = self.entries.keys().collect();
        self.order.len() == self.entries.len() && order == keys
    }
}
