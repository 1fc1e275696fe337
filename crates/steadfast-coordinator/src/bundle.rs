//! Bundle factory: one namespace, one backend, any subset of primitives.

use crate::{Coordinator, CoordinatorStore};
use std::sync::Arc;
use std::time::Duration;
use steadfast_bulkhead::{Bulkhead, BulkheadBuilder};
use steadfast_circuitbreaker::{CircuitBreaker, CircuitBreakerBuilder};
use steadfast_core::{ConfigError, SnapshotStore};
use steadfast_ratelimiter::{RateLimiter, RateLimiterBuilder};

/// A coordinator plus the primitives bound to its namespace.
///
/// Every included primitive persists through the same
/// [`CoordinatorStore`], so a second process building the same bundle
/// against the same backend shares its state.
pub struct InfraBundle {
    pub coordinator: Arc<dyn Coordinator>,
    pub store: Arc<dyn SnapshotStore>,
    pub circuit_breaker: Option<Arc<CircuitBreaker>>,
    pub rate_limiter: Option<Arc<RateLimiter>>,
    pub bulkhead: Option<Arc<Bulkhead>>,
}

impl InfraBundle {
    pub fn builder(
        coordinator: Arc<dyn Coordinator>,
        namespace: impl Into<String>,
    ) -> InfraBundleBuilder {
        InfraBundleBuilder {
            coordinator,
            namespace: namespace.into(),
            circuit_breaker: None,
            rate_limiter: None,
            bulkhead: None,
            persistence_debounce: Duration::from_secs(1),
        }
    }

    /// Load persisted state into every included primitive. Call once at
    /// startup, before traffic.
    pub async fn initialize(&self) {
        if let Some(breaker) = &self.circuit_breaker {
            breaker.initialize().await;
        }
        if let Some(limiter) = &self.rate_limiter {
            limiter.initialize().await;
        }
        if let Some(bulkhead) = &self.bulkhead {
            bulkhead.initialize().await;
        }
    }
}

/// Builder for [`InfraBundle`].
pub struct InfraBundleBuilder {
    coordinator: Arc<dyn Coordinator>,
    namespace: String,
    circuit_breaker: Option<CircuitBreakerBuilder>,
    rate_limiter: Option<RateLimiterBuilder>,
    bulkhead: Option<BulkheadBuilder>,
    persistence_debounce: Duration,
}

impl InfraBundleBuilder {
    /// Include a circuit breaker; its persistence is wired automatically.
    pub fn circuit_breaker(mut self, builder: CircuitBreakerBuilder) -> Self {
        self.circuit_breaker = Some(builder);
        self
    }

    /// Include a rate limiter; its persistence is wired automatically.
    pub fn rate_limiter(mut self, builder: RateLimiterBuilder) -> Self {
        self.rate_limiter = Some(builder);
        self
    }

    /// Include a bulkhead; its persistence is wired automatically.
    pub fn bulkhead(mut self, builder: BulkheadBuilder) -> Self {
        self.bulkhead = Some(builder);
        self
    }

    /// Minimum interval between persisted snapshots for every primitive.
    pub fn persistence_debounce(mut self, interval: Duration) -> Self {
        self.persistence_debounce = interval;
        self
    }

    pub fn build(self) -> Result<InfraBundle, ConfigError> {
        let store: Arc<dyn SnapshotStore> = Arc::new(CoordinatorStore::new(
            Arc::clone(&self.coordinator),
            self.namespace.clone(),
        ));

        let circuit_breaker = self
            .circuit_breaker
            .map(|builder| {
                builder
                    .persistence(Arc::clone(&store), "circuit-breaker")
                    .persistence_debounce(self.persistence_debounce)
                    .build()
                    .map(Arc::new)
            })
            .transpose()?;
        let rate_limiter = self
            .rate_limiter
            .map(|builder| {
                builder
                    .persistence(Arc::clone(&store), "rate-limiter")
                    .persistence_debounce(self.persistence_debounce)
                    .build()
                    .map(Arc::new)
            })
            .transpose()?;
        let bulkhead = self
            .bulkhead
            .map(|builder| {
                builder
                    .persistence(Arc::clone(&store), "bulkhead")
                    .persistence_debounce(self.persistence_debounce)
                    .build()
                    .map(Arc::new)
            })
            .transpose()?;

        Ok(InfraBundle {
            coordinator: self.coordinator,
            store,
            circuit_breaker,
            rate_limiter,
            bulkhead,
        })
    }
}
