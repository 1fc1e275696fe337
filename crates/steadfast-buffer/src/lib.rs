//! Stable buffer: serialised transactional mutation of shared state.
//!
//! A [`StableBuffer`] wraps a plain state object. [`transaction`]
//! callbacks queue on a fair async mutex; each one receives its own clone
//! of the committed state and, on success, replaces it atomically. A
//! failing or timed-out callback commits nothing. [`read`] hands out a
//! clone of the most recently committed state, so the shared object can
//! never be mutated outside a transaction.
//!
//! [`transaction`]: StableBuffer::transaction
//! [`read`]: StableBuffer::read
//!
//! # Example
//!
//! ```
//! use steadfast_buffer::StableBuffer;
//! use steadfast_core::OperationError;
//!
//! # async fn example() {
//! let buffer = StableBuffer::new("tally", 0u64);
//! buffer
//!     .transaction(|mut n| async move {
//!         n += 1;
//!         Ok::<_, OperationError>(n)
//!     })
//!     .await
//!     .unwrap();
//! assert_eq!(buffer.read(), 1);
//! # }
//! ```

use std::future::Future;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use steadfast_core::OperationError;

/// User-overridable deep clone.
pub type CloneFn<S> = Arc<dyn Fn(&S) -> S + Send + Sync>;

/// Observer called once per transaction, after it commits or fails.
pub type TransactionLogger<S> = Arc<dyn Fn(&TransactionRecord<S>) + Send + Sync>;

/// What one transaction did.
pub struct TransactionRecord<S> {
    /// State the callback started from.
    pub before: S,
    /// Committed state; `None` when the callback failed or timed out.
    pub after: Option<S>,
    pub duration: Duration,
    pub queue_wait: Duration,
    pub error: Option<OperationError>,
}

/// Cumulative buffer counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BufferMetrics {
    pub total_transactions: u64,
    pub committed: u64,
    pub failed: u64,
    pub timed_out: u64,
    pub average_queue_wait: Duration,
}

#[derive(Default)]
struct BufferStats {
    total: u64,
    committed: u64,
    failed: u64,
    timed_out: u64,
    queue_wait_total: Duration,
}

/// Shared state with serialised transactional mutation.
pub struct StableBuffer<S> {
    name: String,
    committed: RwLock<S>,
    /// Fair mutex: transaction callbacks run one at a time, FIFO.
    serializer: tokio::sync::Mutex<()>,
    clone_fn: CloneFn<S>,
    logger: Option<TransactionLogger<S>>,
    timeout: Option<Duration>,
    stats: Mutex<BufferStats>,
}

impl<S: Clone + Send + Sync + 'static> StableBuffer<S> {
    /// Wrap a state object, cloning with `S::clone`.
    pub fn new(name: impl Into<String>, state: S) -> Self {
        Self::with_clone_fn(name, state, Arc::new(S::clone))
    }
}

impl<S: Send + Sync> StableBuffer<S> {
    /// Wrap a state object with a custom deep-clone function.
    pub fn with_clone_fn(name: impl Into<String>, state: S, clone_fn: CloneFn<S>) -> Self {
        Self {
            name: name.into(),
            committed: RwLock::new(state),
            serializer: tokio::sync::Mutex::new(()),
            clone_fn,
            logger: None,
            timeout: None,
            stats: Mutex::new(BufferStats::default()),
        }
    }

    /// Observe every transaction with before/after snapshots.
    pub fn log_transactions<F>(mut self, f: F) -> Self
    where
        F: Fn(&TransactionRecord<S>) + Send + Sync + 'static,
    {
        self.logger = Some(Arc::new(f));
        self
    }

    /// Abort callbacks that outrun this budget, leaving the prior state
    /// untouched.
    pub fn transaction_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// A clone of the most recently committed state.
    ///
    /// Sees every transaction that completed before this call began;
    /// never sees a partial one.
    pub fn read(&self) -> S {
        let guard = self.committed.read().unwrap();
        (self.clone_fn)(&guard)
    }

    /// Queue a transaction. The callback receives an owned clone of the
    /// committed state and returns the state to commit.
    ///
    /// At most one callback runs at a time; callbacks run in queue order.
    pub async fn transaction<F, Fut>(&self, f: F) -> Result<(), OperationError>
    where
        F: FnOnce(S) -> Fut,
        Fut: Future<Output = Result<S, OperationError>>,
    {
        let enqueued_at = Instant::now();
        let _serial = self.serializer.lock().await;
        let queue_wait = enqueued_at.elapsed();

        let working = self.read();
        let before = self.logger.as_ref().map(|_| (self.clone_fn)(&working));

        let started = Instant::now();
        let outcome = match self.timeout {
            Some(timeout) => match tokio::time::timeout(timeout, f(working)).await {
                Ok(result) => result,
                Err(_) => Err(OperationError::timeout(format!(
                    "buffer '{}': transaction exceeded {:?}",
                    self.name, timeout
                ))),
            },
            None => f(working).await,
        };
        let duration = started.elapsed();

        let committed_state = match &outcome {
            Ok(new_state) => {
                let snapshot = self.logger.as_ref().map(|_| (self.clone_fn)(new_state));
                snapshot
            }
            Err(_) => None,
        };

        match outcome {
            Ok(new_state) => {
                *self.committed.write().unwrap() = new_state;
                self.record(queue_wait, TransactionOutcome::Committed);
                if let (Some(logger), Some(before)) = (&self.logger, before) {
                    logger(&TransactionRecord {
                        before,
                        after: committed_state,
                        duration,
                        queue_wait,
                        error: None,
                    });
                }
                Ok(())
            }
            Err(error) => {
                let timed_out = error.is_timeout();
                self.record(
                    queue_wait,
                    if timed_out {
                        TransactionOutcome::TimedOut
                    } else {
                        TransactionOutcome::Failed
                    },
                );
                tracing::warn!(
                    buffer = %self.name,
                    error = %error,
                    "transaction did not commit"
                );
                if let (Some(logger), Some(before)) = (&self.logger, before) {
                    logger(&TransactionRecord {
                        before,
                        after: None,
                        duration,
                        queue_wait,
                        error: Some(error.clone()),
                    });
                }
                Err(error)
            }
        }
    }

    /// Queue a synchronous in-place mutation.
    pub async fn mutate<F>(&self, f: F) -> Result<(), OperationError>
    where
        F: FnOnce(&mut S) + Send,
    {
        self.transaction(move |mut state| async move {
            f(&mut state);
            Ok(state)
        })
        .await
    }

    /// Cumulative transaction metrics.
    pub fn metrics(&self) -> BufferMetrics {
        let stats = self.stats.lock().unwrap();
        BufferMetrics {
            total_transactions: stats.total,
            committed: stats.committed,
            failed: stats.failed,
            timed_out: stats.timed_out,
            average_queue_wait: if stats.total == 0 {
                Duration::ZERO
            } else {
                stats.queue_wait_total / stats.total as u32
            },
        }
    }

    fn record(&self, queue_wait: Duration, outcome: TransactionOutcome) {
        let mut stats = self.stats.lock().unwrap();
        stats.total += 1;
        stats.queue_wait_total += queue_wait;
        match outcome {
            TransactionOutcome::Committed => stats.committed += 1,
            TransactionOutcome::Failed => stats.failed += 1,
            TransactionOutcome::TimedOut => {
                stats.failed += 1;
                stats.timed_out += 1;
            }
        }
    }
}

enum TransactionOutcome {
    Committed,
    Failed,
    TimedOut,
}

impl<S> std::fmt::Debug for StableBuffer<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StableBuffer")
            .field("name", &self.name)
            .finish()
    }
}
