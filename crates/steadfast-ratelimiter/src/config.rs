//! Limiter configuration and builder.

use crate::events::RateLimiterEvent;
use crate::RateLimiter;
use std::sync::Arc;
use std::time::Duration;
use steadfast_core::{ConfigError, EventListeners, FnListener, SnapshotStore};

/// Validated limiter configuration.
pub struct RateLimiterConfig {
    pub(crate) name: String,
    pub(crate) capacity: u64,
    pub(crate) window: Duration,
    pub(crate) max_wait: Option<Duration>,
    pub(crate) persistence_debounce: Duration,
    pub(crate) events: EventListeners<RateLimiterEvent>,
}

/// Builder for [`RateLimiter`].
pub struct RateLimiterBuilder {
    name: String,
    capacity: u64,
    window: Duration,
    max_wait: Option<Duration>,
    persistence_debounce: Duration,
    events: EventListeners<RateLimiterEvent>,
    store: Option<(Arc<dyn SnapshotStore>, String)>,
}

impl RateLimiterBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            capacity: 10,
            window: Duration::from_secs(1),
            max_wait: None,
            persistence_debounce: Duration::from_secs(1),
            events: EventListeners::new(),
            store: None,
        }
    }

    /// Admissions allowed per window. Must be at least 1.
    pub fn capacity(mut self, capacity: u64) -> Self {
        self.capacity = capacity;
        self
    }

    /// Window length. Must be non-zero.
    pub fn window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }

    /// Reject instead of queueing when the projected wait exceeds this.
    /// Unset means queue indefinitely.
    pub fn max_wait(mut self, max_wait: Duration) -> Self {
        self.max_wait = Some(max_wait);
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

    /// Observe throttled admissions.
    pub fn on_queued<F>(mut self, f: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.events.add(FnListener::new(move |event: &RateLimiterEvent| {
            if let RateLimiterEvent::Queued { .. } = event {
                f();
            }
        }));
        self
    }

    /// Register a raw event listener.
    pub fn on_event<F>(mut self, f: F) -> Self
    where
        F: Fn(&RateLimiterEvent) + Send + Sync + 'static,
    {
        self.events.add(FnListener::new(f));
        self
    }

    pub(crate) fn into_config(self) -> Result<RateLimiterConfig, ConfigError> {
        if self.capacity == 0 {
            return Err(ConfigError::new(self.name, "capacity must be at least 1"));
        }
        if self.window.is_zero() {
            return Err(ConfigError::new(self.name, "window must be non-zero"));
        }
        Ok(RateLimiterConfig {
            name: self.name,
            capacity: self.capacity,
            window: self.window,
            max_wait: self.max_wait,
            persistence_debounce: self.persistence_debounce,
            events: self.events,
        })
    }

    /// Validate and build the limiter.
    pub fn build(mut self) -> Result<RateLimiter, ConfigError> {
        let store = self.store.take();
        let config = self.into_config()?;
        Ok(RateLimiter::from_parts(config, store))
    }
}
