//! Process-wide TTL cache for external values
//!
//! Entries expire independently, after an absolute TTL or, when a sliding
//! window is set, after going that long without a lookup. Expired entries are
//! dropped lazily by the next lookup that finds them, or eagerly by prefix
//! invalidation. Time comes
//! from `tokio::time` so tests can drive it with a paused clock.

use crate::fingerprint::CacheKey;
use dashmap::DashMap;
use formcalc_types::Value;
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;

/// Cache lifetime of a fetched value
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Expiry {
    /// Absolute lifetime; the orchestrator's default when `None`
    pub ttl: Option<Duration>,
    /// Idle window after which the entry is dropped early
    pub sliding: Option<Duration>,
}

impl Expiry {
    pub fn ttl(ttl: Duration) -> Self {
        Self {
            ttl: Some(ttl),
            sliding: None,
        }
    }

    pub fn with_sliding(mut self, window: Duration) -> Self {
        self.sliding = Some(window);
        self
    }
}

#[derive(Debug, Clone)]
struct CacheEntry {
    value: Value,
    fetched_at: Instant,
    expires_at: Instant,
    sliding: Option<Duration>,
    last_access: Instant,
    provenance: String,
}

impl CacheEntry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at > now
            && self
                .sliding
                .map_or(true, |window| self.last_access + window > now)
    }
}

/// A live cache entry returned by lookups
#[derive(Debug, Clone, PartialEq)]
pub struct CachedValue {
    pub value: Value,
    /// How long ago the value was fetched
    pub age: Duration,
    pub provenance: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

impl fmt::Display for CacheStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "External Data Cache:")?;
        writeln!(
            f,
            "  Hits: {} | Misses: {} | Hit Rate: {:.1}%",
            self.hits,
            self.misses,
            self.hit_rate() * 100.0
        )?;
        write!(f, "  Entries: {}", self.entries)
    }
}

#[derive(Debug, Default)]
pub struct TtlCache {
    entries: DashMap<CacheKey, CacheEntry>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl TtlCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a live entry, evicting it if it has expired
    pub fn get(&self, key: &CacheKey) -> Option<CachedValue> {
        let found = self.lookup(key);
        let counter = if found.is_some() { &self.hits } else { &self.misses };
        counter.fetch_add(1, Ordering::Relaxed);
        found
    }

    /// Like [`TtlCache::get`] but leaves the hit and miss counters alone
    pub fn peek(&self, key: &CacheKey) -> Option<CachedValue> {
        self.lookup(key)
    }

    fn lookup(&self, key: &CacheKey) -> Option<CachedValue> {
        let now = Instant::now();
        match self.entries.get_mut(key) {
            Some(mut entry) if entry.is_live(now) => {
                entry.last_access = now;
                return Some(CachedValue {
                    value: entry.value.clone(),
                    age: now.duration_since(entry.fetched_at),
                    provenance: entry.provenance.clone(),
                });
            }
            Some(_) => {}
            None => return None,
        }

        self.entries.remove_if(key, |_, entry| !entry.is_live(now));
        tracing::debug!(key = %key, "evicted expired cache entry");
        None
    }

    /// Store a value for `ttl`; a zero TTL stores nothing
    pub fn insert(&self, key: CacheKey, value: Value, ttl: Duration, provenance: String) {
        self.insert_with(key, value, Expiry::ttl(ttl), provenance);
    }

    /// Store a value with an optional sliding window; without a TTL nothing
    /// is stored
    pub fn insert_with(&self, key: CacheKey, value: Value, expiry: Expiry, provenance: String) {
        let Some(ttl) = expiry.ttl.filter(|ttl| !ttl.is_zero()) else {
            return;
        };
        let now = Instant::now();
        self.entries.insert(
            key,
            CacheEntry {
                value,
                fetched_at: now,
                expires_at: now + ttl,
                sliding: expiry.sliding.filter(|window| !window.is_zero()),
                last_access: now,
                provenance,
            },
        );
    }

    /// Remove every entry whose key starts with `prefix`
    pub fn invalidate_prefix(&self, prefix: &str) -> usize {
        let keys: Vec<CacheKey> = self
            .entries
            .iter()
            .filter(|entry| entry.key().as_str().starts_with(prefix))
            .map(|entry| entry.key().clone())
            .collect();

        keys.iter()
            .filter(|key| self.entries.remove(*key).is_some())
            .count()
    }

    pub fn clear(&self) {
        self.entries.clear();
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: self.entries.len(),
        }
    }
}
