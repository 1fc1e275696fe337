//! Gateway: run a batch of operations with group-aware profiles.
//!
//! Profiles resolve by layering patches, later wins: defaults ←
//! batch-common ← group-specific ← per-descriptor. Batches run
//! sequentially (optionally stopping on the first failure) or
//! concurrently; concurrent batches can race, completing on the first
//! success and cancelling the losers through their tokens.
//!
//! Individual operation failures never surface as errors; every item
//! produces an [`OperationResult`]. The gateway itself fails only on
//! invariant violations such as duplicate ids.

use std::collections::HashMap;
use std::time::Instant;
use steadfast_core::{CancelToken, OperationError};
use steadfast_executor::{
    Operation, OperationResult, ProfilePatch, RunOptions, Runner, SharedBuffer,
};
use tokio::task::JoinSet;

/// How a batch dispatches its operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchMode {
    /// One at a time, in input order.
    Sequential { stop_on_first_error: bool },
    /// All in flight at once. With `racing`, the batch completes on the
    /// first success and cancels the rest.
    Concurrent { racing: bool },
}

impl Default for BatchMode {
    fn default() -> Self {
        BatchMode::Sequential {
            stop_on_first_error: false,
        }
    }
}

/// Batch-level configuration.
pub struct BatchConfig<T> {
    pub mode: BatchMode,
    /// Applied to every operation in the batch.
    pub common_profile: Option<ProfilePatch<T>>,
    /// Applied to operations carrying the matching group id.
    pub group_profiles: HashMap<String, ProfilePatch<T>>,
    /// Shared buffer threaded into every hook of every operation.
    pub buffer: Option<SharedBuffer>,
}

impl<T> Default for BatchConfig<T> {
    fn default() -> Self {
        Self {
            mode: BatchMode::default(),
            common_profile: None,
            group_profiles: HashMap::new(),
            buffer: None,
        }
    }
}

impl<T> BatchConfig<T> {
    pub fn sequential() -> Self {
        Self::default()
    }

    pub fn sequential_stop_on_first_error() -> Self {
        Self {
            mode: BatchMode::Sequential {
                stop_on_first_error: true,
            },
            ..Self::default()
        }
    }

    pub fn concurrent() -> Self {
        Self {
            mode: BatchMode::Concurrent { racing: false },
            ..Self::default()
        }
    }

    pub fn racing() -> Self {
        Self {
            mode: BatchMode::Concurrent { racing: true },
            ..Self::default()
        }
    }

    pub fn with_common_profile(mut self, profile: ProfilePatch<T>) -> Self {
        self.common_profile = Some(profile);
        self
    }

    pub fn with_group_profile(mut self, group: impl Into<String>, profile: ProfilePatch<T>) -> Self {
        self.group_profiles.insert(group.into(), profile);
        self
    }

    pub fn with_buffer(mut self, buffer: SharedBuffer) -> Self {
        self.buffer = Some(buffer);
        self
    }
}

/// Aggregate counters for one batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchMetrics {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub duration: std::time::Duration,
}

/// Per-item results plus the aggregate view.
#[derive(Debug, Clone)]
pub struct BatchResult<T> {
    /// One result per input operation, in input order.
    pub results: Vec<OperationResult<T>>,
    /// All operations succeeded (or had their failures suppressed); for a
    /// racing batch, at least one succeeded.
    pub success: bool,
    /// A sequential batch stopped before running every operation.
    pub stopped_early: bool,
    pub metrics: BatchMetrics,
}

impl<T> BatchResult<T> {
    fn assemble(results: Vec<OperationResult<T>>, racing: bool, stopped_early: bool, duration: std::time::Duration) -> Self {
        let succeeded = results.iter().filter(|r| r.success).count();
        let cancelled = results.iter().filter(|r| r.is_cancelled()).count();
        let failed = results.len() - succeeded;
        let success = if racing {
            succeeded > 0
        } else {
            results
                .iter()
                .all(|r| r.success || r.error_suppressed)
        };
        Self {
            metrics: BatchMetrics {
                total: results.len(),
                succeeded,
                failed,
                cancelled,
                duration,
            },
            success,
            stopped_early,
            results,
        }
    }

    /// The result for a given operation id.
    pub fn result(&self, id: &str) -> Option<&OperationResult<T>> {
        self.results.iter().find(|r| r.id == id)
    }
}

/// Batch runner over a shared [`Runner`].
pub struct Gateway<T> {
    runner: Runner<T>,
}

impl<T> Clone for Gateway<T> {
    fn clone(&self) -> Self {
        Self {
            runner: self.runner.clone(),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> Default for Gateway<T> {
    fn default() -> Self {
        Self::new(Runner::new())
    }
}

impl<T: Clone + Send + Sync + 'static> Gateway<T> {
    pub fn new(runner: Runner<T>) -> Self {
        Self { runner }
    }

    /// Execute a batch with default run options.
    pub async fn execute(
        &self,
        ops: Vec<Operation<T>>,
        config: &BatchConfig<T>,
    ) -> Result<BatchResult<T>, OperationError> {
        self.run(ops, config, &RunOptions::default()).await
    }

    /// Execute a batch under a cancellation token and optional deadline.
    pub async fn run(
        &self,
        ops: Vec<Operation<T>>,
        config: &BatchConfig<T>,
        opts: &RunOptions,
    ) -> Result<BatchResult<T>, OperationError> {
        let started = Instant::now();
        validate_unique_ids(&ops)?;
        let ops: Vec<Operation<T>> = ops
            .into_iter()
            .map(|op| self.prepare(op, config))
            .collect();

        match config.mode {
            BatchMode::Sequential {
                stop_on_first_error,
            } => {
                let mut results = Vec::with_capacity(ops.len());
                let mut stopped = false;
                let mut iter = ops.into_iter();
                for op in iter.by_ref() {
                    let result = self.runner.run(&op, opts).await;
                    let failed = !result.success && !result.error_suppressed;
                    results.push(result);
                    if stop_on_first_error && failed {
                        stopped = true;
                        break;
                    }
                }
                if stopped {
                    for op in iter {
                        results.push(skipped_result(op));
                    }
                }
                Ok(BatchResult::assemble(results, false, stopped, started.elapsed()))
            }
            BatchMode::Concurrent { racing } => {
                self.run_concurrent(ops, racing, opts)
                    .await
                    .map(|(results, _)| {
                        BatchResult::assemble(results, racing, false, started.elapsed())
                    })
            }
        }
    }

    async fn run_concurrent(
        &self,
        ops: Vec<Operation<T>>,
        racing: bool,
        opts: &RunOptions,
    ) -> Result<(Vec<OperationResult<T>>, Option<usize>), OperationError> {
        let race_token = CancelToken::new();
        if opts.token.is_cancelled() {
            race_token.cancel();
        }

        let mut join_set = JoinSet::new();
        let total = ops.len();
        for (index, op) in ops.into_iter().enumerate() {
            let runner = self.runner.clone();
            let child_opts = RunOptions {
                token: race_token.clone(),
                deadline: opts.deadline,
            };
            join_set.spawn(async move {
                let result = runner.run(&op, &child_opts).await;
                (index, result)
            });
        }

        let mut slots: Vec<Option<OperationResult<T>>> = Vec::with_capacity(total);
        slots.resize_with(total, || None);
        let mut winner: Option<usize> = None;

        loop {
            let joined = tokio::select! {
                joined = join_set.join_next() => joined,
                _ = opts.token.cancelled() => {
                    race_token.cancel();
                    join_set.join_next().await
                }
            };
            let Some(joined) = joined else { break };
            let (index, result) = joined.expect("batch task never panics");

            if racing && result.success && winner.is_none() {
                winner = Some(index);
                tracing::debug!(winner = index, "race decided; cancelling the rest");
                race_token.cancel();
            }
            slots[index] = Some(result);
        }

        let mut results: Vec<OperationResult<T>> = slots
            .into_iter()
            .map(|slot| slot.expect("every spawned operation reports"))
            .collect();

        // A loser may have finished successfully before the cancellation
        // landed; the race still has exactly one winner.
        if let Some(winner) = winner {
            for (index, result) in results.iter_mut().enumerate() {
                if index != winner && result.success {
                    result.success = false;
                    result.data = None;
                    result.error = Some(
                        OperationError::cancelled(format!(
                            "Cancelled: operation '{}' lost the race",
                            result.id
                        ))
                        .with_context(result.context.clone()),
                    );
                }
            }
        }

        Ok((results, winner))
    }

    fn prepare(&self, mut op: Operation<T>, config: &BatchConfig<T>) -> Operation<T> {
        let mut effective = config.common_profile.clone().unwrap_or_default();
        if let Some(group) = &op.group {
            if let Some(group_patch) = config.group_profiles.get(group) {
                effective.overlay(group_patch);
            }
        }
        effective.overlay(&op.profile);
        op.profile = effective;

        if op.buffer.is_none() {
            op.buffer = config.buffer.clone();
        }
        if op.context.request_id.is_none() {
            op.context = op.context.clone().with_request(op.id.clone());
        }
        op
    }
}

fn validate_unique_ids<T>(ops: &[Operation<T>]) -> Result<(), OperationError> {
    let mut seen = std::collections::HashSet::new();
    for op in ops {
        if !seen.insert(op.id.as_str()) {
            return Err(OperationError::validation(format!(
                "duplicate operation id '{}' in batch",
                op.id
            )));
        }
    }
    Ok(())
}

fn skipped_result<T>(op: Operation<T>) -> OperationResult<T> {
    OperationResult::from_error(
        op.id.clone(),
        op.group.clone(),
        op.context.clone(),
        OperationError::cancelled(format!(
            "Cancelled: operation '{}' skipped after an earlier failure",
            op.id
        )),
    )
}
