//! Cache configuration and builder.

use crate::eviction::EvictionPolicy;
use crate::key::KeyMaterial;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use steadfast_core::{ConfigError, SnapshotStore};

/// Replaces the default fingerprint function for one cache.
pub type KeyGenerator = Arc<dyn Fn(&KeyMaterial) -> String + Send + Sync>;

/// Status codes a shared cache may store, per RFC 9110's
/// heuristically-cacheable set.
pub const DEFAULT_CACHEABLE_STATUS_CODES: [u16; 11] =
    [200, 203, 204, 206, 300, 301, 404, 405, 410, 414, 501];

/// Verbs whose responses are never written to the cache.
pub const DEFAULT_EXCLUDED_METHODS: [&str; 4] = ["POST", "PUT", "PATCH", "DELETE"];

/// Why a write was admitted or skipped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteDecision {
    /// Store the payload with this TTL.
    Store { ttl: Duration },
    /// Do not store.
    Skip { reason: &'static str },
}

/// Transport facts consulted by the write policy. Function results pass
/// all-`None` and are always admitted.
#[derive(Debug, Clone, Copy, Default)]
pub struct WriteContext<'a> {
    pub method: Option<&'a str>,
    pub status: Option<u16>,
    pub cache_control: Option<&'a str>,
}

/// Validated cache configuration.
#[derive(Clone)]
pub struct CacheConfig {
    pub(crate) name: String,
    pub(crate) ttl: Duration,
    pub(crate) max_size: usize,
    pub(crate) policy: EvictionPolicy,
    pub(crate) respect_cache_control: bool,
    pub(crate) cacheable_status_codes: HashSet<u16>,
    pub(crate) exclude_methods: HashSet<String>,
    pub(crate) fingerprint_headers: Vec<String>,
    pub(crate) key_generator: Option<KeyGenerator>,
    pub(crate) persistence_debounce: Duration,
}

impl CacheConfig {
    /// Evaluate the write policy for a payload about to be cached.
    pub fn admit(&self, ctx: &WriteContext<'_>) -> WriteDecision {
        if let Some(method) = ctx.method {
            if self.exclude_methods.contains(&method.to_ascii_uppercase()) {
                return WriteDecision::Skip {
                    reason: "method excluded",
                };
            }
        }
        if let Some(status) = ctx.status {
            if !self.cacheable_status_codes.contains(&status) {
                return WriteDecision::Skip {
                    reason: "status not cacheable",
                };
            }
        }

        let mut ttl = self.ttl;
        if self.respect_cache_control {
            if let Some(directives) = ctx.cache_control {
                let directives = directives.to_ascii_lowercase();
                if directives.contains("no-store") || directives.contains("no-cache") {
                    return WriteDecision::Skip {
                        reason: "cache-control forbids storage",
                    };
                }
                if let Some(max_age) = parse_max_age(&directives) {
                    ttl = max_age.min(self.ttl);
                }
            }
        }

        WriteDecision::Store { ttl }
    }
}

fn parse_max_age(directives: &str) -> Option<Duration> {
    directives.split(',').find_map(|directive| {
        let directive = directive.trim();
        let seconds = directive.strip_prefix("max-age=")?;
        seconds.parse::<u64>().ok().map(Duration::from_secs)
    })
}

/// Builder for [`CacheConfig`].
///
/// Use [`for_requests`](CacheBuilder::for_requests) or
/// [`for_functions`](CacheBuilder::for_functions) to pick the variant
/// defaults (capacity 100 vs 1000).
pub struct CacheBuilder {
    name: String,
    ttl: Duration,
    max_size: usize,
    policy: EvictionPolicy,
    respect_cache_control: bool,
    cacheable_status_codes: HashSet<u16>,
    exclude_methods: HashSet<String>,
    fingerprint_headers: Vec<String>,
    key_generator: Option<KeyGenerator>,
    persistence_debounce: Duration,
    pub(crate) store: Option<(Arc<dyn SnapshotStore>, String)>,
}

impl CacheBuilder {
    fn new(name: impl Into<String>, max_size: usize) -> Self {
        Self {
            name: name.into(),
            ttl: Duration::from_secs(300),
            max_size,
            policy: EvictionPolicy::Fifo,
            respect_cache_control: true,
            cacheable_status_codes: DEFAULT_CACHEABLE_STATUS_CODES.into_iter().collect(),
            exclude_methods: DEFAULT_EXCLUDED_METHODS
                .iter()
                .map(|m| m.to_string())
                .collect(),
            fingerprint_headers: Vec::new(),
            key_generator: None,
            persistence_debounce: Duration::from_secs(1),
            store: None,
        }
    }

    /// Response cache defaults: 100 entries.
    pub fn for_requests(name: impl Into<String>) -> Self {
        Self::new(name, 100)
    }

    /// Function-result cache defaults: 1000 entries.
    pub fn for_functions(name: impl Into<String>) -> Self {
        Self::new(name, 1000)
    }

    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn max_size(mut self, max_size: usize) -> Self {
        self.max_size = max_size;
        self
    }

    pub fn eviction_policy(mut self, policy: EvictionPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Honour `Cache-Control` response directives. Default true.
    pub fn respect_cache_control(mut self, respect: bool) -> Self {
        self.respect_cache_control = respect;
        self
    }

    /// Replace the cacheable status whitelist.
    pub fn cacheable_status_codes(mut self, codes: impl IntoIterator<Item = u16>) -> Self {
        self.cacheable_status_codes = codes.into_iter().collect();
        self
    }

    /// Replace the excluded-method set.
    pub fn exclude_methods<I, S>(mut self, methods: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.exclude_methods = methods
            .into_iter()
            .map(|m| m.into().to_ascii_uppercase())
            .collect();
        self
    }

    /// Headers folded into the request fingerprint (matched
    /// case-insensitively). Default: none.
    pub fn fingerprint_headers<I, S>(mut self, headers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.fingerprint_headers = headers
            .into_iter()
            .map(|h| h.into().to_ascii_lowercase())
            .collect();
        self
    }

    /// Override the fingerprint function.
    pub fn key_generator<F>(mut self, f: F) -> Self
    where
        F: Fn(&KeyMaterial) -> String + Send + Sync + 'static,
    {
        self.key_generator = Some(Arc::new(f));
        self
    }

    /// Persist snapshots through a store, debounced.
    pub fn persistence(mut self, store: Arc<dyn SnapshotStore>, key: impl Into<String>) -> Self {
        self.store = Some((store, key.into()));
        self
    }

    pub fn persistence_debounce(mut self, interval: Duration) -> Self {
        self.persistence_debounce = interval;
        self
    }

    pub(crate) fn into_config(self) -> Result<(CacheConfig, Option<(Arc<dyn SnapshotStore>, String)>), ConfigError> {
        if self.max_size == 0 {
            return Err(ConfigError::new(self.name, "max_size must be at least 1"));
        }
        if self.ttl.is_zero() {
            return Err(ConfigError::new(self.name, "ttl must be non-zero"));
        }
        let store = self.store;
        Ok((
            CacheConfig {
                name: self.name,
                ttl: self.ttl,
                max_size: self.max_size,
                policy: self.policy,
                respect_cache_control: self.respect_cache_control,
                cacheable_status_codes: self.cacheable_status_codes,
                exclude_methods: self.exclude_methods,
                fingerprint_headers: self.fingerprint_headers,
                key_generator: self.key_generator,
                persistence_debounce: self.persistence_debounce,
            },
            store,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> CacheConfig {
        CacheBuilder::for_requests("policy-test").into_config().unwrap().0
    }

    #[test]
    fn excluded_methods_never_write() {
        let cfg = config();
        let decision = cfg.admit(&WriteContext {
            method: Some("post"),
            status: Some(200),
            cache_control: None,
        });
        assert!(matches!(decision, WriteDecision::Skip { .. }));
    }

    #[test]
    fn status_whitelist_gates_writes() {
        let cfg = config();
        let stored = cfg.admit(&WriteContext {
            method: Some("GET"),
            status: Some(200),
            cache_control: None,
        });
        assert!(matches!(stored, WriteDecision::Store { .. }));

        let skipped = cfg.admit(&WriteContext {
            method: Some("GET"),
            status: Some(500),
            cache_control: None,
        });
        assert!(matches!(skipped, WriteDecision::Skip { .. }));
    }

    #[test]
    fn cache_control_no_store_wins() {
        let cfg = config();
        let decision = cfg.admit(&WriteContext {
            method: Some("GET"),
            status: Some(200),
            cache_control: Some("no-store"),
        });
        assert!(matches!(decision, WriteDecision::Skip { .. }));
    }

    #[test]
    fn max_age_shortens_the_ttl() {
        let cfg = config();
        let decision = cfg.admit(&WriteContext {
            method: Some("GET"),
            status: Some(200),
            cache_control: Some("public, max-age=60"),
        });
        assert_eq!(
            decision,
            WriteDecision::Store {
                ttl: Duration::from_secs(60)
            }
        );
    }

    #[test]
    fn cache_control_ignored_when_disabled() {
        let (cfg, _) = CacheBuilder::for_requests("no-cc")
            .respect_cache_control(false)
            .into_config()
            .unwrap();
        let decision = cfg.admit(&WriteContext {
            method: Some("GET"),
            status: Some(200),
            cache_control: Some("no-store"),
        });
        assert!(matches!(decision, WriteDecision::Store { .. }));
    }

    #[test]
    fn functions_are_always_admitted() {
        let cfg = config();
        let decision = cfg.admit(&WriteContext::default());
        assert_eq!(
            decision,
            WriteDecision::Store {
                ttl: Duration::from_secs(300)
            }
        );
    }
}
