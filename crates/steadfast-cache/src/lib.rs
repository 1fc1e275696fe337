//! Fingerprint-keyed TTL cache for responses and function results.
//!
//! Entries expire on read and evict FIFO (oldest insertion first) when the
//! cache is at capacity; LRU is available behind the same policy enum.
//! Writes go through a policy: excluded verbs never write, status codes
//! outside the whitelist never write, and `Cache-Control` response
//! directives are honoured when configured.
//!
//! # Example
//!
//! ```
//! use steadfast_cache::Cache;
//!
//! let cache: Cache<String> = Cache::for_functions("lookups").build().unwrap();
//! cache.insert("fn:abc", "value".to_string());
//! assert_eq!(cache.get("fn:abc"), Some("value".to_string()));
//! ```

mod config;
mod eviction;
mod key;

pub use config::{
    CacheBuilder, CacheConfig, KeyGenerator, WriteContext, WriteDecision,
    DEFAULT_CACHEABLE_STATUS_CODES, DEFAULT_EXCLUDED_METHODS,
};
pub use eviction::EvictionPolicy;
pub use key::{function_fingerprint, request_fingerprint, KeyMaterial};

use eviction::{EvictionStore, FifoStore, LruStore};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use steadfast_core::{Debouncer, SnapshotStore};

#[cfg(feature = "metrics")]
use metrics::{counter, describe_counter};

#[derive(Clone)]
struct CacheEntry<T> {
    payload: T,
    inserted_at: Instant,
    ttl: Duration,
}

impl<T> CacheEntry<T> {
    fn is_expired(&self) -> bool {
        self.inserted_at.elapsed() > self.ttl
    }
}

/// Cumulative cache counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,
    pub inserts: u64,
    pub skipped_writes: u64,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let lookups = self.hits + self.misses;
        if lookups == 0 {
            0.0
        } else {
            self.hits as f64 / lookups as f64
        }
    }

    /// Transport calls avoided by serving from cache.
    pub fn saved_network_requests(&self) -> u64 {
        self.hits
    }
}

/// Point-in-time cache metrics.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheMetrics {
    pub stats: CacheStats,
    pub size: usize,
    pub max_size: usize,
}

impl CacheMetrics {
    pub fn utilization(&self) -> f64 {
        if self.max_size == 0 {
            0.0
        } else {
            self.size as f64 / self.max_size as f64
        }
    }
}

/// Serialisable cache snapshot: live entries plus counters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheSnapshot<T> {
    pub entries: Vec<PersistedEntry<T>>,
    pub stats: CacheStats,
}

/// One persisted entry with its remaining lifetime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedEntry<T> {
    pub key: String,
    pub payload: T,
    pub remaining_ttl_ms: u64,
}

struct CacheInner<T> {
    store: Box<dyn EvictionStore<String, CacheEntry<T>>>,
    stats: CacheStats,
}

/// A shareable cache instance.
pub struct Cache<T> {
    config: CacheConfig,
    inner: Mutex<CacheInner<T>>,
    persistence: Option<PersistenceBinding>,
}

struct PersistenceBinding {
    store: Arc<dyn SnapshotStore>,
    key: String,
    debouncer: Debouncer,
}

impl<T: Clone + Send + 'static> Cache<T> {
    /// Builder with response-cache defaults (capacity 100).
    pub fn for_requests(name: impl Into<String>) -> CacheBuilder {
        CacheBuilder::for_requests(name)
    }

    /// Builder with function-cache defaults (capacity 1000).
    pub fn for_functions(name: impl Into<String>) -> CacheBuilder {
        CacheBuilder::for_functions(name)
    }

    fn from_config(
        config: CacheConfig,
        store_binding: Option<(Arc<dyn SnapshotStore>, String)>,
    ) -> Self {
        #[cfg(feature = "metrics")]
        describe_counter!("steadfast_cache_lookups_total", "Cache lookups by outcome");

        let store: Box<dyn EvictionStore<String, CacheEntry<T>>> = match config.policy {
            EvictionPolicy::Fifo => Box::new(FifoStore::new(config.max_size)),
            EvictionPolicy::Lru => Box::new(LruStore::new(config.max_size)),
        };
        let persistence = store_binding.map(|(store, key)| PersistenceBinding {
            store,
            key,
            debouncer: Debouncer::new(config.persistence_debounce),
        });
        Self {
            config,
            inner: Mutex::new(CacheInner {
                store,
                stats: CacheStats::default(),
            }),
            persistence,
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Look up a fingerprint. Expired entries are removed and reported as
    /// misses.
    pub fn get(&self, fingerprint: &str) -> Option<T> {
        let key = fingerprint.to_string();
        let mut inner = self.inner.lock().unwrap();

        let expired = match inner.store.get(&key) {
            Some(entry) if entry.is_expired() => true,
            Some(entry) => {
                let payload = entry.payload.clone();
                inner.stats.hits += 1;
                self.count_lookup("hit");
                return Some(payload);
            }
            None => {
                inner.stats.misses += 1;
                self.count_lookup("miss");
                return None;
            }
        };

        if expired {
            inner.store.remove(&key);
            inner.stats.expirations += 1;
            inner.stats.misses += 1;
            self.count_lookup("expired");
        }
        None
    }

    /// Insert with the default TTL, bypassing the write policy.
    pub fn insert(&self, fingerprint: impl Into<String>, payload: T) {
        self.insert_with_ttl(fingerprint, payload, self.config.ttl);
    }

    /// Insert with an explicit TTL, bypassing the write policy.
    pub fn insert_with_ttl(&self, fingerprint: impl Into<String>, payload: T, ttl: Duration) {
        let key: String = fingerprint.into();
        let mut inner = self.inner.lock().unwrap();
        let displaced = inner.store.insert(
            key.clone(),
            CacheEntry {
                payload,
                inserted_at: Instant::now(),
                ttl,
            },
        );
        inner.stats.inserts += 1;
        // insert() also reports a same-key update as displaced; only a
        // different key counts as an eviction.
        if let Some((displaced_key, _)) = displaced {
            if displaced_key != key {
                inner.stats.evictions += 1;
            }
        }
    }

    /// Store a payload if the write policy admits it. Returns whether it
    /// was stored.
    pub fn store_if_admitted(
        &self,
        fingerprint: impl Into<String>,
        payload: T,
        ctx: &WriteContext<'_>,
    ) -> bool {
        match self.config.admit(ctx) {
            WriteDecision::Store { ttl } => {
                self.insert_with_ttl(fingerprint, payload, ttl);
                true
            }
            WriteDecision::Skip { reason } => {
                self.inner.lock().unwrap().stats.skipped_writes += 1;
                tracing::debug!(cache = %self.config.name, reason, "cache write skipped");
                false
            }
        }
    }

    /// Evaluate the write policy without storing anything.
    pub fn admit(&self, ctx: &WriteContext<'_>) -> WriteDecision {
        self.config.admit(ctx)
    }

    /// Fingerprint a request through this cache's header whitelist and
    /// optional key-generator override.
    pub fn request_key(&self, material: &KeyMaterial) -> String {
        let mut filtered = KeyMaterial {
            method: material.method.clone(),
            url: material.url.clone(),
            body: material.body.clone(),
            headers: material
                .headers
                .iter()
                .filter(|(name, _)| {
                    self.config
                        .fingerprint_headers
                        .contains(&name.to_ascii_lowercase())
                })
                .map(|(name, value)| (name.to_ascii_lowercase(), value.clone()))
                .collect(),
        };
        filtered.headers.sort();

        match &self.config.key_generator {
            Some(generator) => generator(&filtered),
            None => request_fingerprint(&filtered),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.inner.lock().unwrap().store.clear();
    }

    /// Point-in-time metrics snapshot.
    pub fn metrics(&self) -> CacheMetrics {
        let inner = self.inner.lock().unwrap();
        CacheMetrics {
            stats: inner.stats,
            size: inner.store.len(),
            max_size: self.config.max_size,
        }
    }

    #[allow(unused_variables)]
    fn count_lookup(&self, outcome: &'static str) {
        #[cfg(feature = "metrics")]
        counter!(
            "steadfast_cache_lookups_total",
            "cache" => self.config.name.clone(),
            "outcome" => outcome
        )
        .increment(1);
    }
}

impl<T> Cache<T>
where
    T: Clone + Send + Serialize + DeserializeOwned + 'static,
{
    /// Serialisable snapshot of live (unexpired) entries and counters.
    pub fn snapshot(&self) -> CacheSnapshot<T> {
        let inner = self.inner.lock().unwrap();
        let entries = inner
            .store
            .dump()
            .into_iter()
            .filter(|(_, entry)| !entry.is_expired())
            .map(|(key, entry)| PersistedEntry {
                key,
                payload: entry.payload,
                remaining_ttl_ms: entry
                    .ttl
                    .saturating_sub(entry.inserted_at.elapsed())
                    .as_millis() as u64,
            })
            .collect();
        CacheSnapshot {
            entries,
            stats: inner.stats,
        }
    }

    /// Apply a snapshot: entries re-enter with their remaining TTL.
    pub fn apply_snapshot(&self, snapshot: CacheSnapshot<T>) {
        {
            let mut inner = self.inner.lock().unwrap();
            inner.store.clear();
            inner.stats = snapshot.stats;
        }
        for entry in snapshot.entries {
            self.insert_with_ttl(
                entry.key,
                entry.payload,
                Duration::from_millis(entry.remaining_ttl_ms),
            );
        }
    }

    /// Load persisted state, if a store is bound.
    pub async fn initialize(&self) {
        let Some(persistence) = &self.persistence else {
            return;
        };
        if let Some(value) = persistence.store.load(&persistence.key).await {
            match serde_json::from_value::<CacheSnapshot<T>>(value) {
                Ok(snapshot) => self.apply_snapshot(snapshot),
                Err(error) => tracing::warn!(
                    cache = %self.config.name,
                    %error,
                    "ignoring malformed cache snapshot"
                ),
            }
        }
    }

    /// Re-read persisted state. Used by schedulers after `restore_state`.
    pub async fn reload_from_persistence(&self) {
        self.initialize().await;
    }

    /// Persist the current snapshot immediately.
    pub async fn persist_now(&self) {
        let Some(persistence) = &self.persistence else {
            return;
        };
        if let Ok(value) = serde_json::to_value(self.snapshot()) {
            persistence.store.store(&persistence.key, value).await;
        }
    }

    /// Persist in the background, honouring the configured debounce.
    pub fn persist_debounced(&self) {
        let Some(persistence) = &self.persistence else {
            return;
        };
        if !persistence.debouncer.should_fire() {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let Ok(value) = serde_json::to_value(self.snapshot()) else {
            return;
        };
        let store = Arc::clone(&persistence.store);
        let key = persistence.key.clone();
        handle.spawn(async move {
            store.store(&key, value).await;
        });
    }
}

impl CacheBuilder {
    /// Validate and build a cache for payload type `T`.
    pub fn build<T: Clone + Send + 'static>(self) -> Result<Cache<T>, steadfast_core::ConfigError> {
        let (config, store) = self.into_config()?;
        Ok(Cache::from_config(config, store))
    }
}

impl<T> std::fmt::Debug for Cache<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cache")
            .field("name", &self.config.name)
            .field("max_size", &self.config.max_size)
            .finish()
    }
}
