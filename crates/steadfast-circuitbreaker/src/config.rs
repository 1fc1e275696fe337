//! Breaker configuration and builder.

use crate::events::CircuitBreakerEvent;
use crate::state::{CircuitState, ConfigEcho};
use crate::CircuitBreaker;
use std::sync::Arc;
use std::time::Duration;
use steadfast_core::{ConfigError, EventListeners, FnListener, SnapshotStore};

/// Validated breaker configuration.
pub struct CircuitBreakerConfig {
    pub(crate) name: String,
    pub(crate) failure_threshold_percentage: f64,
    pub(crate) minimum_requests: u64,
    pub(crate) recovery_timeout: Duration,
    pub(crate) success_threshold_percentage: f64,
    pub(crate) half_open_max_requests: u64,
    pub(crate) track_individual_attempts: bool,
    pub(crate) persistence_debounce: Duration,
    pub(crate) events: EventListeners<CircuitBreakerEvent>,
}

impl CircuitBreakerConfig {
    pub(crate) fn echo(&self) -> ConfigEcho {
        ConfigEcho {
            failure_threshold_percentage: self.failure_threshold_percentage,
            minimum_requests: self.minimum_requests,
            recovery_timeout_ms: self.recovery_timeout.as_millis() as u64,
            success_threshold_percentage: self.success_threshold_percentage,
            half_open_max_requests: self.half_open_max_requests,
            track_individual_attempts: self.track_individual_attempts,
        }
    }
}

/// Builder for [`CircuitBreaker`].
///
/// Thresholds are validated at [`build`](CircuitBreakerBuilder::build);
/// a breaker with an impossible configuration never gets to run.
pub struct CircuitBreakerBuilder {
    name: String,
    failure_threshold_percentage: f64,
    minimum_requests: u64,
    recovery_timeout: Duration,
    success_threshold_percentage: f64,
    half_open_max_requests: u64,
    track_individual_attempts: bool,
    persistence_debounce: Duration,
    events: EventListeners<CircuitBreakerEvent>,
    store: Option<(Arc<dyn SnapshotStore>, String)>,
}

impl CircuitBreakerBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            failure_threshold_percentage: 50.0,
            minimum_requests: 5,
            recovery_timeout: Duration::from_secs(30),
            success_threshold_percentage: 50.0,
            half_open_max_requests: 5,
            track_individual_attempts: false,
            persistence_debounce: Duration::from_secs(1),
            events: EventListeners::new(),
            store: None,
        }
    }

    /// Failure percentage at which the circuit opens, in (0, 100].
    pub fn failure_threshold_percentage(mut self, percentage: f64) -> Self {
        self.failure_threshold_percentage = percentage;
        self
    }

    /// Outcomes that must be recorded before the threshold is evaluated.
    pub fn minimum_requests(mut self, minimum: u64) -> Self {
        self.minimum_requests = minimum;
        self
    }

    /// How long the circuit stays open before the first half-open probe.
    pub fn recovery_timeout(mut self, timeout: Duration) -> Self {
        self.recovery_timeout = timeout;
        self
    }

    /// Trial success percentage required to close again. Default 50.
    pub fn success_threshold_percentage(mut self, percentage: f64) -> Self {
        self.success_threshold_percentage = percentage;
        self
    }

    /// Trial operations admitted while half-open. Default 5.
    pub fn half_open_max_requests(mut self, max: u64) -> Self {
        self.half_open_max_requests = max;
        self
    }

    /// Record every retry attempt as an independent outcome.
    ///
    /// Off by default: composite executors record one outcome per
    /// operation so retries do not double-count.
    pub fn track_individual_attempts(mut self, track: bool) -> Self {
        self.track_individual_attempts = track;
        self
    }

    /// Persist snapshots through a store, debounced. The key should be
    /// unique to this breaker within the store's namespace.
    pub fn persistence(mut self, store: Arc<dyn SnapshotStore>, key: impl Into<String>) -> Self {
        self.store = Some((store, key.into()));
        self
    }

    /// Minimum interval between persisted snapshots. Default 1 s.
    pub fn persistence_debounce(mut self, interval: Duration) -> Self {
        self.persistence_debounce = interval;
        self
    }

    /// Observe state transitions.
    pub fn on_transition<F>(mut self, f: F) -> Self
    where
        F: Fn(CircuitState, CircuitState) + Send + Sync + 'static,
    {
        self.events.add(FnListener::new(move |event: &CircuitBreakerEvent| {
            if let CircuitBreakerEvent::StateTransition { from, to, .. } = event {
                f(*from, *to);
            }
        }));
        self
    }

    /// Observe rejected admissions.
    pub fn on_rejected<F>(mut self, f: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.events.add(FnListener::new(move |event: &CircuitBreakerEvent| {
            if let CircuitBreakerEvent::CallRejected { .. } = event {
                f();
            }
        }));
        self
    }

    /// Register a raw event listener.
    pub fn on_event<F>(mut self, f: F) -> Self
    where
        F: Fn(&CircuitBreakerEvent) + Send + Sync + 'static,
    {
        self.events.add(FnListener::new(f));
        self
    }

    pub(crate) fn into_config(self) -> Result<CircuitBreakerConfig, ConfigError> {
        let reject = |message: &str| Err(ConfigError::new(self.name.clone(), message));

        if !(0.0..=100.0).contains(&self.failure_threshold_percentage)
            || self.failure_threshold_percentage == 0.0
        {
            return reject("failure_threshold_percentage must be in (0, 100]");
        }
        if !(0.0..=100.0).contains(&self.success_threshold_percentage)
            || self.success_threshold_percentage == 0.0
        {
            return reject("success_threshold_percentage must be in (0, 100]");
        }
        if self.minimum_requests == 0 {
            return reject("minimum_requests must be at least 1");
        }
        if self.half_open_max_requests == 0 {
            return reject("half_open_max_requests must be at least 1");
        }
        if self.recovery_timeout.is_zero() {
            return reject("recovery_timeout must be non-zero");
        }

        Ok(CircuitBreakerConfig {
            name: self.name,
            failure_threshold_percentage: self.failure_threshold_percentage,
            minimum_requests: self.minimum_requests,
            recovery_timeout: self.recovery_timeout,
            success_threshold_percentage: self.success_threshold_percentage,
            half_open_max_requests: self.half_open_max_requests,
            track_individual_attempts: self.track_individual_attempts,
            persistence_debounce: self.persistence_debounce,
            events: self.events,
        })
    }

    /// Validate and build the breaker.
    pub fn build(mut self) -> Result<CircuitBreaker, ConfigError> {
        let store = self.store.take();
        let config = self.into_config()?;
        Ok(CircuitBreaker::from_parts(config, store))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_out_of_range_thresholds() {
        assert!(CircuitBreakerBuilder::new("bad")
            .failure_threshold_percentage(0.0)
            .build()
            .is_err());
        assert!(CircuitBreakerBuilder::new("bad")
            .failure_threshold_percentage(101.0)
            .build()
            .is_err());
        assert!(CircuitBreakerBuilder::new("bad")
            .success_threshold_percentage(-1.0)
            .build()
            .is_err());
    }

    #[test]
    fn rejects_zero_counts_and_timeouts() {
        assert!(CircuitBreakerBuilder::new("bad")
            .minimum_requests(0)
            .build()
            .is_err());
        assert!(CircuitBreakerBuilder::new("bad")
            .half_open_max_requests(0)
            .build()
            .is_err());
        assert!(CircuitBreakerBuilder::new("bad")
            .recovery_timeout(Duration::ZERO)
            .build()
            .is_err());
    }

    #[test]
    fn defaults_build_cleanly() {
        let breaker = CircuitBreakerBuilder::new("defaults").build().unwrap();
        assert_eq!(breaker.name(), "defaults");
        assert!(!breaker.records_individual_attempts());
    }
}
