//! Bulkhead: bound the number of in-flight operations.
//!
//! `execute(fut)` runs the future if fewer than `capacity` operations are
//! in flight, otherwise the caller joins a FIFO queue (tokio's semaphore
//! queues waiters fairly). Slots are released on success and failure
//! alike.
//!
//! # Example
//!
//! ```
//! use steadfast_bulkhead::Bulkhead;
//! use steadfast_core::OperationError;
//!
//! # async fn example() {
//! let bulkhead = Bulkhead::builder("db").capacity(8).build().unwrap();
//!
//! let value = bulkhead
//!     .execute(async { Ok::<_, OperationError>(42) })
//!     .await
//!     .unwrap();
//! assert_eq!(value, 42);
//! # }
//! ```

mod config;
mod events;

pub use config::{BulkheadBuilder, BulkheadConfig};
pub use events::BulkheadEvent;

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use steadfast_core::{CancelToken, Debouncer, OperationError, SnapshotStore};
use tokio::sync::Semaphore;

#[cfg(feature = "metrics")]
use metrics::{counter, describe_counter, gauge, histogram};

/// A shareable concurrency limiter.
pub struct Bulkhead {
    config: BulkheadConfig,
    semaphore: Arc<Semaphore>,
    stats: Mutex<BulkheadStats>,
    persistence: Option<PersistenceBinding>,
}

struct PersistenceBinding {
    store: Arc<dyn SnapshotStore>,
    key: String,
    debouncer: Debouncer,
}

#[derive(Default)]
struct BulkheadStats {
    running: u64,
    peak_running: u64,
    queued_now: u64,
    total: u64,
    completed: u64,
    failed: u64,
    queued: u64,
    queue_wait_total: Duration,
    queued_served: u64,
    execution_total: Duration,
    executions: u64,
}

/// Point-in-time bulkhead metrics.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BulkheadMetrics {
    pub capacity: u64,
    pub running: u64,
    pub queue_length: u64,
    pub total_requests: u64,
    pub completed_requests: u64,
    pub failed_requests: u64,
    /// Requests that had to wait for a slot.
    pub queued_requests: u64,
    pub peak_running: u64,
    #[serde(skip)]
    pub average_queue_wait: Duration,
    #[serde(skip)]
    pub average_execution_time: Duration,
}

impl BulkheadMetrics {
    /// Fraction of capacity currently in use.
    pub fn utilization(&self) -> f64 {
        if self.capacity == 0 {
            0.0
        } else {
            self.running as f64 / self.capacity as f64
        }
    }
}

/// Serialisable snapshot for persistence. In-flight state is process-local;
/// counters carry over.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BulkheadSnapshot {
    pub capacity: u64,
    pub total_requests: u64,
    pub completed_requests: u64,
    pub failed_requests: u64,
    pub queued_requests: u64,
    pub peak_running: u64,
    pub average_queue_wait_ms: u64,
    pub average_execution_ms: u64,
}

impl Bulkhead {
    pub fn builder(name: impl Into<String>) -> BulkheadBuilder {
        BulkheadBuilder::new(name)
    }

    pub(crate) fn from_parts(
        config: BulkheadConfig,
        store: Option<(Arc<dyn SnapshotStore>, String)>,
    ) -> Self {
        #[cfg(feature = "metrics")]
        describe_counter!(
            "steadfast_bulkhead_calls_total",
            "Bulkhead executions by outcome"
        );

        let persistence = store.map(|(store, key)| PersistenceBinding {
            store,
            key,
            debouncer: Debouncer::new(config.persistence_debounce),
        });
        Self {
            semaphore: Arc::new(Semaphore::new(config.capacity as usize)),
            stats: Mutex::new(BulkheadStats::default()),
            config,
            persistence,
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn capacity(&self) -> u64 {
        self.config.capacity
    }

    /// Run the future inside a slot, queueing FIFO when none is free.
    pub async fn execute<F, T>(&self, fut: F) -> Result<T, OperationError>
    where
        F: Future<Output = Result<T, OperationError>>,
    {
        self.execute_inner(fut, None).await
    }

    /// [`execute`](Self::execute), bailing out with a `cancelled` error if
    /// the token fires while waiting for a slot.
    pub async fn execute_cancellable<F, T>(
        &self,
        fut: F,
        token: &CancelToken,
    ) -> Result<T, OperationError>
    where
        F: Future<Output = Result<T, OperationError>>,
    {
        self.execute_inner(fut, Some(token)).await
    }

    async fn execute_inner<F, T>(
        &self,
        fut: F,
        token: Option<&CancelToken>,
    ) -> Result<T, OperationError>
    where
        F: Future<Output = Result<T, OperationError>>,
    {
        let enqueued_at = Instant::now();
        let immediate = match self.semaphore.try_acquire() {
            Ok(permit) => {
                permit.forget();
                true
            }
            Err(_) => false,
        };

        let _permit = if immediate {
            self.stats.lock().unwrap().total += 1;
            permit_guard(&self.semaphore)
        } else {
            {
                let mut stats = self.stats.lock().unwrap();
                stats.total += 1;
                stats.queued += 1;
                stats.queued_now += 1;
            }
            self.config.events.emit(&BulkheadEvent::CallQueued {
                pattern_name: self.config.name.clone(),
                timestamp: Instant::now(),
                capacity: self.config.capacity,
            });

            let acquired = match (token, self.config.max_wait) {
                (Some(token), Some(max_wait)) => tokio::select! {
                    permit = tokio::time::timeout(max_wait, self.semaphore.acquire()) => {
                        permit.map_err(|_| wait_timeout(&self.config))
                            .map(|p| p.expect("bulkhead semaphore never closes"))
                    }
                    _ = token.cancelled() => Err(queue_cancelled(&self.config)),
                },
                (Some(token), None) => tokio::select! {
                    permit = self.semaphore.acquire() => {
                        Ok(permit.expect("bulkhead semaphore never closes"))
                    }
                    _ = token.cancelled() => Err(queue_cancelled(&self.config)),
                },
                (None, Some(max_wait)) => {
                    tokio::time::timeout(max_wait, self.semaphore.acquire())
                        .await
                        .map_err(|_| wait_timeout(&self.config))
                        .map(|p| p.expect("bulkhead semaphore never closes"))
                }
                (None, None) => Ok(self
                    .semaphore
                    .acquire()
                    .await
                    .expect("bulkhead semaphore never closes")),
            };

            let waited = enqueued_at.elapsed();
            let mut stats = self.stats.lock().unwrap();
            stats.queued_now = stats.queued_now.saturating_sub(1);
            match acquired {
                Ok(permit) => {
                    stats.queued_served += 1;
                    stats.queue_wait_total += waited;
                    drop(stats);
                    permit.forget();
                    permit_guard(&self.semaphore)
                }
                Err(error) => {
                    stats.failed += 1;
                    drop(stats);
                    self.count_call("rejected");
                    self.config.events.emit(&BulkheadEvent::CallRejected {
                        pattern_name: self.config.name.clone(),
                        timestamp: Instant::now(),
                        capacity: self.config.capacity,
                    });
                    return Err(error);
                }
            }
        };

        {
            let mut stats = self.stats.lock().unwrap();
            stats.running += 1;
            stats.peak_running = stats.peak_running.max(stats.running);
            #[cfg(feature = "metrics")]
            gauge!("steadfast_bulkhead_running", "bulkhead" => self.config.name.clone())
                .set(stats.running as f64);
        }

        let started = Instant::now();
        let result = fut.await;
        let elapsed = started.elapsed();

        {
            let mut stats = self.stats.lock().unwrap();
            stats.running = stats.running.saturating_sub(1);
            stats.executions += 1;
            stats.execution_total += elapsed;
            match &result {
                Ok(_) => stats.completed += 1,
                Err(_) => stats.failed += 1,
            }
            #[cfg(feature = "metrics")]
            gauge!("steadfast_bulkhead_running", "bulkhead" => self.config.name.clone())
                .set(stats.running as f64);
        }

        #[cfg(feature = "metrics")]
        histogram!("steadfast_bulkhead_execution_seconds", "bulkhead" => self.config.name.clone())
            .record(elapsed.as_secs_f64());
        self.count_call(if result.is_ok() { "completed" } else { "failed" });
        self.maybe_persist();
        result
    }

    /// Point-in-time metrics snapshot.
    pub fn metrics(&self) -> BulkheadMetrics {
        let stats = self.stats.lock().unwrap();
        BulkheadMetrics {
            capacity: self.config.capacity,
            running: stats.running,
            queue_length: stats.queued_now,
            total_requests: stats.total,
            completed_requests: stats.completed,
            failed_requests: stats.failed,
            queued_requests: stats.queued,
            peak_running: stats.peak_running,
            average_queue_wait: if stats.queued_served == 0 {
                Duration::ZERO
            } else {
                stats.queue_wait_total / stats.queued_served as u32
            },
            average_execution_time: if stats.executions == 0 {
                Duration::ZERO
            } else {
                stats.execution_total / stats.executions as u32
            },
        }
    }

    /// Serialisable snapshot for persistence.
    pub fn snapshot(&self) -> BulkheadSnapshot {
        let metrics = self.metrics();
        BulkheadSnapshot {
            capacity: metrics.capacity,
            total_requests: metrics.total_requests,
            completed_requests: metrics.completed_requests,
            failed_requests: metrics.failed_requests,
            queued_requests: metrics.queued_requests,
            peak_running: metrics.peak_running,
            average_queue_wait_ms: metrics.average_queue_wait.as_millis() as u64,
            average_execution_ms: metrics.average_execution_time.as_millis() as u64,
        }
    }

    /// Apply persisted counters. In-flight state restarts empty.
    pub fn apply_snapshot(&self, snapshot: &BulkheadSnapshot) {
        let mut stats = self.stats.lock().unwrap();
        stats.total = snapshot.total_requests;
        stats.completed = snapshot.completed_requests;
        stats.failed = snapshot.failed_requests;
        stats.queued = snapshot.queued_requests;
        stats.peak_running = snapshot.peak_running;
    }

    /// Load persisted state, if a store is bound.
    pub async fn initialize(&self) {
        let Some(persistence) = &self.persistence else {
            return;
        };
        if let Some(value) = persistence.store.load(&persistence.key).await {
            match serde_json::from_value::<BulkheadSnapshot>(value) {
                Ok(snapshot) => self.apply_snapshot(&snapshot),
                Err(error) => tracing::warn!(
                    bulkhead = %self.config.name,
                    %error,
                    "ignoring malformed bulkhead snapshot"
                ),
            }
        }
    }

    /// Re-read persisted state. Used by schedulers after `restore_state`.
    pub async fn reload_from_persistence(&self) {
        self.initialize().await;
    }

    #[allow(unused_variables)]
    fn count_call(&self, outcome: &'static str) {
        #[cfg(feature = "metrics")]
        counter!(
            "steadfast_bulkhead_calls_total",
            "bulkhead" => self.config.name.clone(),
            "outcome" => outcome
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

fn wait_timeout(config: &BulkheadConfig) -> OperationError {
    OperationError::timeout(format!(
        "bulkhead '{}': timed out waiting for a slot",
        config.name
    ))
}

fn queue_cancelled(config: &BulkheadConfig) -> OperationError {
    OperationError::cancelled(format!(
        "bulkhead '{}': cancelled while waiting for a slot",
        config.name
    ))
}

/// Releases one permit on drop. The semaphore's permit type borrows the
/// semaphore, which fights the borrow of `self` across the execution await;
/// an explicit add-on-drop guard sidesteps that.
struct PermitGuard<'a> {
    semaphore: &'a Semaphore,
}

impl Drop for PermitGuard<'_> {
    fn drop(&mut self) {
        self.semaphore.add_permits(1);
    }
}

fn permit_guard(semaphore: &Semaphore) -> PermitGuard<'_> {
    PermitGuard { semaphore }
}

impl std::fmt::Debug for Bulkhead {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bulkhead")
            .field("name", &self.config.name)
            .field("capacity", &self.config.capacity)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    fn bulkhead(capacity: u64) -> Arc<Bulkhead> {
        Arc::new(Bulkhead::builder("test").capacity(capacity).build().unwrap())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn running_never_exceeds_capacity() {
        let bulkhead = bulkhead(2);
        let running = Arc::new(AtomicU64::new(0));
        let peak = Arc::new(AtomicU64::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let bulkhead = Arc::clone(&bulkhead);
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            handles.push(tokio::spawn(async move {
                bulkhead
                    .execute(async {
                        let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        running.fetch_sub(1, Ordering::SeqCst);
                        Ok::<_, OperationError>(())
                    })
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert!(peak.load(Ordering::SeqCst) <= 2);
        let metrics = bulkhead.metrics();
        assert_eq!(metrics.total_requests, 8);
        assert_eq!(metrics.completed_requests, 8);
        assert!(metrics.peak_running <= 2);
        assert!(metrics.queued_requests >= 6);
    }

    #[tokio::test]
    async fn failures_release_the_slot() {
        let bulkhead = bulkhead(1);
        let err = bulkhead
            .execute(async { Err::<(), _>(OperationError::transport("boom")) })
            .await
            .unwrap_err();
        assert_eq!(err.kind, steadfast_core::ErrorKind::TransportFailure);

        // Slot must be free again.
        bulkhead
            .execute(async { Ok::<_, OperationError>(()) })
            .await
            .unwrap();
        assert_eq!(bulkhead.metrics().failed_requests, 1);
    }

    #[tokio::test]
    async fn max_wait_times_out_queued_callers() {
        let bulkhead = Arc::new(
            Bulkhead::builder("capped")
                .capacity(1)
                .max_wait(Duration::from_millis(20))
                .build()
                .unwrap(),
        );

        let holder = {
            let bulkhead = Arc::clone(&bulkhead);
            tokio::spawn(async move {
                bulkhead
                    .execute(async {
                        tokio::time::sleep(Duration::from_millis(200)).await;
                        Ok::<_, OperationError>(())
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;

        let err = bulkhead
            .execute(async { Ok::<_, OperationError>(()) })
            .await
            .unwrap_err();
        assert!(err.is_timeout());
        holder.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn cancellation_while_queued_fails_with_cancelled() {
        let bulkhead = bulkhead(1);
        let holder = {
            let bulkhead = Arc::clone(&bulkhead);
            tokio::spawn(async move {
                bulkhead
                    .execute(async {
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        Ok::<_, OperationError>(())
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;

        let token = CancelToken::new();
        let waiter = {
            let bulkhead = Arc::clone(&bulkhead);
            let token = token.clone();
            tokio::spawn(async move {
                bulkhead
                    .execute_cancellable(async { Ok::<_, OperationError>(()) }, &token)
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;
        token.cancel();

        let err = waiter.await.unwrap().unwrap_err();
        assert!(err.is_cancelled());
        holder.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn average_execution_time_is_tracked() {
        let bulkhead = bulkhead(1);
        bulkhead
            .execute(async {
                tokio::time::sleep(Duration::from_millis(10)).await;
                Ok::<_, OperationError>(())
            })
            .await
            .unwrap();
        assert!(bulkhead.metrics().average_execution_time >= Duration::from_millis(5));
    }
}
