//! Bulkhead configuration and builder.

use crate::events::BulkheadEvent;
use crate::Bulkhead;
use std::sync::Arc;
use std::time::Duration;
use steadfast_core::{ConfigError, EventListeners, FnListener, SnapshotStore};

/// Validated bulkhead configuration.
pub struct BulkheadConfig {
    pub(crate) name: String,
    pub(crate) capacity: u64,
    pub(crate) max_wait: Option<Duration>,
    pub(crate) persistence_debounce: Duration,
    pub(crate) events: EventListeners<BulkheadEvent>,
}

/// Builder for [`Bulkhead`].
pub struct BulkheadBuilder {
    name: String,
    capacity: u64,
    max_wait: Option<Duration>,
    persistence_debounce: Duration,
    events: EventListeners<BulkheadEvent>,
    store: Option<(Arc<dyn SnapshotStore>, String)>,
}

impl BulkheadBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            capacity: 16,
            max_wait: None,
            persistence_debounce: Duration::from_secs(1),
            events: EventListeners::new(),
            store: None,
        }
    }

    /// Maximum in-flight operations. Must be at least 1.
    pub fn capacity(mut self, capacity: u64) -> Self {
        self.capacity = capacity;
        self
    }

    /// Fail queued callers after this wait instead of queueing forever.
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

    /// Observe calls that had to queue.
    pub fn on_queued<F>(mut self, f: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.events.add(FnListener::new(move |event: &BulkheadEvent| {
            if let BulkheadEvent::CallQueued { .. } = event {
                f();
            }
        }));
        self
    }

    /// Register a raw event listener.
    pub fn on_event<F>(mut self, f: F) -> Self
    where
        F: Fn(&BulkheadEvent) + Send + Sync + 'static,
    {
        self.events.add(FnListener::new(f));
        self
    }

    /// Validate and build the bulkhead.
    pub fn build(self) -> Result<Bulkhead, ConfigError> {
        if self.capacity == 0 {
            return Err(ConfigError::new(self.name, "capacity must be at least 1"));
        }
        let store = self.store;
        let config = BulkheadConfig {
            name: self.name,
            capacity: self.capacity,
            max_wait: self.max_wait,
            persistence_debounce: self.persistence_debounce,
            events: self.events,
        };
        Ok(Bulkhead::from_parts(config, store))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_zero_capacity() {
        assert!(BulkheadBuilder::new("bad").capacity(0).build().is_err());
    }

    #[test]
    fn defaults_build_cleanly() {
        let bulkhead = BulkheadBuilder::new("defaults").build().unwrap();
        assert_eq!(bulkhead.capacity(), 16);
    }
}
