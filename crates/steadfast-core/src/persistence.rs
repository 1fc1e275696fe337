//! Persistence seam for infrastructure state.
//!
//! Primitives persist *semantic* snapshots (counts, states, config echoes)
//! as JSON documents through a [`SnapshotStore`]. The coordinator crate
//! provides the store implementation; in-process use needs none. Stores are
//! fire-and-forget from the primitive's point of view: a failed store is
//! logged, never surfaced to callers.

use async_trait::async_trait;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Key/value snapshot storage for primitive state.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Load a previously stored snapshot, if any.
    async fn load(&self, key: &str) -> Option<serde_json::Value>;

    /// Store a snapshot under the key, replacing any prior value.
    async fn store(&self, key: &str, snapshot: serde_json::Value);
}

/// Rate-limits snapshot stores so every counter bump does not become a
/// round-trip to the backend.
#[derive(Debug)]
pub struct Debouncer {
    interval: Duration,
    last: Mutex<Option<Instant>>,
}

impl Debouncer {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: Mutex::new(None),
        }
    }

    /// True when enough time has passed since the last accepted fire.
    /// Accepting advances the window.
    pub fn should_fire(&self) -> bool {
        let mut last = self.last.lock().unwrap();
        let now = Instant::now();
        match *last {
            Some(at) if now.duration_since(at) < self.interval => false,
            _ => {
                *last = Some(now);
                true
            }
        }
    }

    /// Forget the last fire so the next call is accepted immediately.
    pub fn reset(&self) {
        *self.last.lock().unwrap() = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_fire_is_accepted_then_throttled() {
        let debouncer = Debouncer::new(Duration::from_secs(60));
        assert!(debouncer.should_fire());
        assert!(!debouncer.should_fire());
        assert!(!debouncer.should_fire());
    }

    #[test]
    fn reset_reopens_the_window() {
        let debouncer = Debouncer::new(Duration::from_secs(60));
        assert!(debouncer.should_fire());
        debouncer.reset();
        assert!(debouncer.should_fire());
    }

    #[test]
    fn zero_interval_never_throttles() {
        let debouncer = Debouncer::new(Duration::ZERO);
        assert!(debouncer.should_fire());
        assert!(debouncer.should_fire());
    }
}
