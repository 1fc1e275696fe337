//! Rate limiter: at most N admissions per window of W milliseconds.
//!
//! `acquire()` either takes a token from the current window and returns
//! immediately, or joins a FIFO queue. Queued callers are assigned the
//! first window with spare capacity at enqueue time and suspend until that
//! window opens; because assignment happens under the state lock, lock
//! order is admission order and the queue drains FIFO.
//!
//! # Example
//!
//! ```
//! use steadfast_ratelimiter::RateLimiter;
//! use std::time::Duration;
//!
//! # async fn example() {
//! let limiter = RateLimiter::builder("search-api")
//!     .capacity(2)
//!     .window(Duration::from_millis(500))
//!     .build()
//!     .unwrap();
//!
//! limiter.acquire().await.unwrap(); // immediate
//! limiter.acquire().await.unwrap(); // immediate
//! limiter.acquire().await.unwrap(); // waits for the next window
//! # }
//! ```

mod config;
mod events;
mod limiter;

pub use config::{RateLimiterBuilder, RateLimiterConfig};
pub use events::RateLimiterEvent;
pub use limiter::{RateLimiterMetrics, RateLimiterSnapshot};

use limiter::LimiterState;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use steadfast_core::{CancelToken, Debouncer, OperationError, SnapshotStore};

#[cfg(feature = "metrics")]
use metrics::{counter, describe_counter, histogram};

/// A shareable rate limiter.
pub struct RateLimiter {
    config: RateLimiterConfig,
    state: Mutex<LimiterState>,
    persistence: Option<PersistenceBinding>,
}

struct PersistenceBinding {
    store: Arc<dyn SnapshotStore>,
    key: String,
    debouncer: Debouncer,
}

impl RateLimiter {
    pub fn builder(name: impl Into<String>) -> RateLimiterBuilder {
        RateLimiterBuilder::new(name)
    }

    pub(crate) fn from_parts(
        config: RateLimiterConfig,
        store: Option<(Arc<dyn SnapshotStore>, String)>,
    ) -> Self {
        #[cfg(feature = "metrics")]
        {
            describe_counter!(
                "steadfast_ratelimiter_admissions_total",
                "Rate limiter admissions by disposition"
            );
        }

        let persistence = store.map(|(store, key)| PersistenceBinding {
            store,
            key,
            debouncer: Debouncer::new(config.persistence_debounce),
        });
        Self {
            state: Mutex::new(LimiterState::new()),
            config,
            persistence,
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Acquire an admission, suspending in FIFO order if the current
    /// window is spent. Returns the time spent queued.
    ///
    /// Fails with a `rate-limited` error when the projected wait exceeds
    /// the configured `max_wait`.
    pub async fn acquire(&self) -> Result<Duration, OperationError> {
        self.acquire_inner(None).await
    }

    /// [`acquire`](Self::acquire), but abandons the queue slot when the
    /// token is cancelled, failing with a `cancelled` error.
    pub async fn acquire_cancellable(
        &self,
        token: &CancelToken,
    ) -> Result<Duration, OperationError> {
        self.acquire_inner(Some(token)).await
    }

    async fn acquire_inner(&self, token: Option<&CancelToken>) -> Result<Duration, OperationError> {
        let enqueued_at = Instant::now();
        let target = {
            let mut state = self.state.lock().unwrap();
            match state.admit(&self.config, enqueued_at) {
                Ok(None) => {
                    drop(state);
                    self.emit(RateLimiterEvent::Admitted {
                        pattern_name: self.config.name.clone(),
                        timestamp: Instant::now(),
                        waited: Duration::ZERO,
                    });
                    self.count_admission("immediate");
                    self.maybe_persist();
                    return Ok(Duration::ZERO);
                }
                Ok(Some(target)) => target,
                Err(projected) => {
                    drop(state);
                    self.emit(RateLimiterEvent::Rejected {
                        pattern_name: self.config.name.clone(),
                        timestamp: Instant::now(),
                        projected_wait: projected,
                    });
                    self.count_admission("rejected");
                    return Err(OperationError::rate_limited(format!(
                        "rate limiter '{}': projected wait {:?} exceeds cap",
                        self.config.name, projected
                    )));
                }
            }
        };

        self.emit(RateLimiterEvent::Queued {
            pattern_name: self.config.name.clone(),
            timestamp: Instant::now(),
            wake_at: target,
        });
        tracing::debug!(
            ratelimiter = %self.config.name,
            wait_ms = target.saturating_duration_since(enqueued_at).as_millis() as u64,
            "admission queued"
        );

        let outcome = match token {
            Some(token) => {
                tokio::select! {
                    _ = tokio::time::sleep_until(tokio::time::Instant::from_std(target)) => Ok(()),
                    _ = token.cancelled() => Err(()),
                }
            }
            None => {
                tokio::time::sleep_until(tokio::time::Instant::from_std(target)).await;
                Ok(())
            }
        };

        let waited = enqueued_at.elapsed();
        {
            let mut state = self.state.lock().unwrap();
            state.dequeue(waited, outcome.is_ok());
        }

        match outcome {
            Ok(()) => {
                self.emit(RateLimiterEvent::Admitted {
                    pattern_name: self.config.name.clone(),
                    timestamp: Instant::now(),
                    waited,
                });
                self.count_admission("queued");
                #[cfg(feature = "metrics")]
                histogram!(
                    "steadfast_ratelimiter_queue_wait_seconds",
                    "ratelimiter" => self.config.name.clone()
                )
                .record(waited.as_secs_f64());
                self.maybe_persist();
                Ok(waited)
            }
            Err(()) => Err(OperationError::cancelled(format!(
                "rate limiter '{}': admission cancelled while queued",
                self.config.name
            ))),
        }
    }

    /// Point-in-time metrics snapshot.
    pub fn metrics(&self) -> RateLimiterMetrics {
        self.state.lock().unwrap().metrics(&self.config)
    }

    /// Serialisable snapshot for persistence.
    pub fn snapshot(&self) -> RateLimiterSnapshot {
        self.state.lock().unwrap().snapshot(&self.config)
    }

    /// Apply persisted counters to this limiter. Window timing restarts.
    pub fn apply_snapshot(&self, snapshot: &RateLimiterSnapshot) {
        self.state.lock().unwrap().restore(snapshot);
    }

    /// Load persisted state, if a store is bound.
    pub async fn initialize(&self) {
        let Some(persistence) = &self.persistence else {
            return;
        };
        if let Some(value) = persistence.store.load(&persistence.key).await {
            match serde_json::from_value::<RateLimiterSnapshot>(value) {
                Ok(snapshot) => self.apply_snapshot(&snapshot),
                Err(error) => tracing::warn!(
                    ratelimiter = %self.config.name,
                    %error,
                    "ignoring malformed rate limiter snapshot"
                ),
            }
        }
    }

    /// Re-read persisted state. Used by schedulers after `restore_state`.
    pub async fn reload_from_persistence(&self) {
        self.initialize().await;
    }

    fn emit(&self, event: RateLimiterEvent) {
        self.config.events.emit(&event);
    }

    #[allow(unused_variables)]
    fn count_admission(&self, disposition: &'static str) {
        #[cfg(feature = "metrics")]
        counter!(
            "steadfast_ratelimiter_admissions_total",
            "ratelimiter" => self.config.name.clone(),
            "disposition" => disposition
        )
        .increment(1);
    }

    fn maybe_persist(&self) {
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

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("name", &self.config.name)
            .field("capacity", &self.config.capacity)
            .field("window", &self.config.window)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn limiter(capacity: u64, window_ms: u64) -> Arc<RateLimiter> {
        Arc::new(
            RateLimiter::builder("test")
                .capacity(capacity)
                .window(Duration::from_millis(window_ms))
                .build()
                .unwrap(),
        )
    }

    #[tokio::test]
    async fn admits_capacity_immediately() {
        let limiter = limiter(3, 500);
        for _ in 0..3 {
            assert_eq!(limiter.acquire().await.unwrap(), Duration::ZERO);
        }
        assert_eq!(limiter.metrics().throttled, 0);
    }

    #[tokio::test]
    async fn queues_beyond_capacity() {
        let limiter = limiter(2, 100);
        limiter.acquire().await.unwrap();
        limiter.acquire().await.unwrap();

        let start = Instant::now();
        let waited = limiter.acquire().await.unwrap();
        assert!(waited >= Duration::from_millis(50));
        assert!(start.elapsed() < Duration::from_millis(500));
        assert_eq!(limiter.metrics().throttled, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_batch_spreads_across_windows() {
        let limiter = limiter(2, 200);
        let start = Instant::now();

        let mut handles = Vec::new();
        for _ in 0..5 {
            let limiter = Arc::clone(&limiter);
            handles.push(tokio::spawn(async move {
                limiter.acquire().await.unwrap();
                start.elapsed()
            }));
        }

        let mut elapsed: Vec<Duration> = Vec::new();
        for handle in handles {
            elapsed.push(handle.await.unwrap());
        }
        elapsed.sort();

        // 2 immediate, 2 in the second window, 1 in the third.
        assert!(elapsed[1] < Duration::from_millis(150));
        assert!(elapsed[2] >= Duration::from_millis(150));
        assert!(elapsed[4] >= Duration::from_millis(350));

        let metrics = limiter.metrics();
        assert_eq!(metrics.total_requests, 5);
        assert_eq!(metrics.throttled, 3);
        assert!(metrics.peak_queue_length >= 3);
    }

    #[tokio::test]
    async fn max_wait_rejects_instead_of_queueing_forever() {
        let limiter = Arc::new(
            RateLimiter::builder("capped")
                .capacity(1)
                .window(Duration::from_secs(60))
                .max_wait(Duration::from_millis(10))
                .build()
                .unwrap(),
        );

        limiter.acquire().await.unwrap();
        let err = limiter.acquire().await.unwrap_err();
        assert_eq!(err.kind, steadfast_core::ErrorKind::RateLimited);
    }

    #[tokio::test]
    async fn cancellation_abandons_the_queue_slot() {
        let limiter = limiter(1, 60_000);
        limiter.acquire().await.unwrap();

        let token = CancelToken::new();
        let waiter = {
            let limiter = Arc::clone(&limiter);
            let token = token.clone();
            tokio::spawn(async move { limiter.acquire_cancellable(&token).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        token.cancel();
        let err = waiter.await.unwrap().unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(limiter.metrics().queue_length, 0);
    }

    #[tokio::test]
    async fn average_queue_wait_tracks_queued_admissions() {
        let limiter = limiter(1, 50);
        limiter.acquire().await.unwrap();
        limiter.acquire().await.unwrap();

        let metrics = limiter.metrics();
        assert!(metrics.average_queue_wait > Duration::ZERO);
    }
}
