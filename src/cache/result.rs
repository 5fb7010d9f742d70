//! Result cache for completed checks.
//!
//! [`ResultCache`] maps a [`Fingerprint`] of (exact text, pipeline key) to the result the engine produced for it. Checking is
//! deterministic for a given pipeline configuration, so identical requests
//! (a client re-sending an unchanged document, an editor re-checking on
//! every keystroke burst) are answered without touching the pool.
//!
//! # Keying
//!
//! The pipeline key carries language, mother tongue, rule options and the
//! user-configuration hash. Two callers sending the same text with
//! different personal dictionaries therefore never share an entry.
//!
//! Keys use `DefaultHasher` (SipHash). The hash is stable within a process
//! lifetime only, which is all an in-memory cache needs.
//!
//! # Bounds
//!
//! Entries are evicted least-recently-used once `max_entries` is reached,
//! and are never returned after `ttl`. Inserts cannot fail: moka applies
//! size pressure by evicting, not by rejecting the write.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::time::Duration;

use moka::future::Cache;
use moka::policy::EvictionPolicy;
use tokio::time::Instant;
use tracing::debug;

use crate::telemetry;
use crate::types::{CheckResult, PipelineKey};

/// Configuration for the result cache.
///
/// ```rust
/// # use skald::CacheConfig;
/// # use std::time::Duration;
/// let config = CacheConfig::new()
///     .max_entries(10_000)
///     .ttl(Duration::from_secs(3600));
/// ```
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Maximum number of cached results. Default: 10,000.
    pub max_entries: u64,
    /// Time-to-live for cached results. Default: 1 hour.
    pub ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 10_000,
            ttl: Duration::from_secs(3600),
        }
    }
}

impl CacheConfig {
    /// Create a new config with sensible defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the maximum number of cached results.
    pub fn max_entries(mut self, n: u64) -> Self {
        self.max_entries = n;
        self
    }

    /// Set the time-to-live for cached results.
    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }
}

/// Content hash identifying one cacheable check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint(u64);

impl Fingerprint {
    /// Fingerprint `text` as checked by a pipeline for `key`.
    ///
    /// The text is hashed byte for byte. Match offsets index into it, so
    /// even whitespace or line-ending differences get their own entry.
    pub fn compute(text: &str, key: &PipelineKey) -> Self {
        let mut hasher = DefaultHasher::new();
        text.hash(&mut hasher);
        key.hash(&mut hasher);
        Self(hasher.finish())
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

#[derive(Clone, Debug)]
struct CachedResult {
    result: CheckResult,
    inserted_at: Instant,
}

/// In-memory LRU + TTL cache of check results.
pub struct ResultCache {
    cache: Cache<u64, CachedResult>,
}

impl ResultCache {
    pub fn new(config: &CacheConfig) -> Self {
        let cache = Cache::builder()
            .max_capacity(config.max_entries)
            .time_to_live(config.ttl)
            .eviction_policy(EvictionPolicy::lru())
            .build();
        Self { cache }
    }

    /// Look up a cached result. Emits cache hit/miss metrics.
    pub async fn get(&self, fingerprint: &Fingerprint) -> Option<CheckResult> {
        match self.cache.get(&fingerprint.0).await {
            Some(entry) => {
                metrics::counter!(telemetry::CACHE_HITS_TOTAL).increment(1);
                debug!(
                    fingerprint = fingerprint.0,
                    age_ms = entry.inserted_at.elapsed().as_millis() as u64,
                    "result cache hit"
                );
                Some(entry.result)
            }
            None => {
                metrics::counter!(telemetry::CACHE_MISSES_TOTAL).increment(1);
                None
            }
        }
    }

    /// Store a result, replacing any previous entry for the fingerprint.
    pub async fn put(&self, fingerprint: Fingerprint, result: CheckResult) {
        let entry = CachedResult {
            result,
            inserted_at: Instant::now(),
        };
        self.cache.insert(fingerprint.0, entry).await;
    }

    /// Number of entries, after applying pending evictions.
    pub async fn len(&self) -> u64 {
        self.cache.run_pending_tasks().await;
        self.cache.entry_count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub fn clear(&self) {
        self.cache.invalidate_all();
    }
}

impl std::fmt::Debug for ResultCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultCache")
            .field("entries", &self.cache.entry_count())
            .finish()
    }
}
