//! Attempt records and operation results.

use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime};
use steadfast_core::{ExecutionContext, OperationError};

/// What the response analyzer said about an attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Verdict {
    Pass,
    Fail,
    NotRun,
}

/// Outcome of one attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AttemptOutcome {
    Success,
    Failure,
}

/// One entry in an operation's append-only attempt log.
#[derive(Debug, Clone)]
pub struct AttemptRecord<T> {
    /// 1-based attempt number.
    pub number: u32,
    pub started_at: SystemTime,
    pub duration: Duration,
    pub outcome: AttemptOutcome,
    pub payload: Option<T>,
    pub error: Option<OperationError>,
    pub verdict: Verdict,
    /// Served from cache without invoking the operation.
    pub from_cache: bool,
    /// Injected by trial mode rather than observed.
    pub synthetic: bool,
}

impl<T> AttemptRecord<T> {
    pub fn succeeded(&self) -> bool {
        self.outcome == AttemptOutcome::Success
    }
}

/// Aggregated attempt counters for one operation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationMetrics {
    pub attempts: u32,
    pub successes: u32,
    pub failures: u32,
    /// Attempts beyond the first.
    pub retries: u32,
    pub total_duration: Duration,
    pub average_attempt_duration: Duration,
}

/// The structured result every execution produces, success or not.
#[derive(Debug, Clone)]
pub struct OperationResult<T> {
    pub id: String,
    pub group: Option<String>,
    pub success: bool,
    /// Payload of the last successful attempt.
    pub data: Option<T>,
    /// Aggregated error when no attempt succeeded.
    pub error: Option<OperationError>,
    /// A final-error analyzer downgraded the failure; composite executors
    /// carry on with siblings.
    pub error_suppressed: bool,
    pub from_cache: bool,
    pub attempts: Vec<AttemptRecord<T>>,
    pub metrics: OperationMetrics,
    pub context: ExecutionContext,
}

impl<T> OperationResult<T> {
    pub(crate) fn assemble(
        id: String,
        group: Option<String>,
        context: ExecutionContext,
        attempts: Vec<AttemptRecord<T>>,
        data: Option<T>,
        error: Option<OperationError>,
        error_suppressed: bool,
        wall_time: Duration,
    ) -> Self {
        let successes = attempts.iter().filter(|a| a.succeeded()).count() as u32;
        let failures = attempts.len() as u32 - successes;
        let attempt_count = attempts.len() as u32;
        let attempt_time: Duration = attempts.iter().map(|a| a.duration).sum();
        let from_cache = attempts.iter().any(|a| a.from_cache);

        let metrics = OperationMetrics {
            attempts: attempt_count,
            successes,
            failures,
            retries: attempt_count.saturating_sub(1),
            total_duration: wall_time,
            average_attempt_duration: if attempt_count == 0 {
                Duration::ZERO
            } else {
                attempt_time / attempt_count
            },
        };

        Self {
            id,
            group,
            success: data.is_some() && error.is_none(),
            data,
            error,
            error_suppressed,
            from_cache,
            attempts,
            metrics,
            context,
        }
    }

    /// A zero-attempt failure result, for work that was never dispatched.
    pub fn from_error(
        id: String,
        group: Option<String>,
        context: ExecutionContext,
        error: OperationError,
    ) -> Self {
        Self::assemble(id, group, context, Vec::new(), None, Some(error), false, Duration::ZERO)
    }

    /// The error, unless it was suppressed by a final-error analyzer.
    pub fn effective_error(&self) -> Option<&OperationError> {
        if self.error_suppressed {
            None
        } else {
            self.error.as_ref()
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.error
            .as_ref()
            .map(|e| e.is_cancelled())
            .unwrap_or(false)
    }
}

/// Truncate serialised payload text for log output.
pub(crate) fn clip_for_log(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        text.to_string()
    } else {
        let clipped: String = text.chars().take(max_chars).collect();
        format!("{clipped}… ({} chars total)", text.chars().count())
    }
}
