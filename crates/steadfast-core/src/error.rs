//! Kind-classified errors.
//!
//! Errors in steadfast are classified by [`ErrorKind`], not by type: every
//! failure that crosses a component boundary carries the same
//! `{kind, message, context, retryable}` shape, so the retry loop, the
//! composite executors and user code can all route on the kind without
//! downcasting.

use crate::context::ExecutionContext;
use serde::{Deserialize, Serialize};
use std::fmt;

/// The user-observable classification of a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    /// An attempt (or a whole workflow) exceeded its deadline.
    Timeout,
    /// Rejected by an open circuit breaker. Never retried within a call.
    CircuitOpen,
    /// Cancelled by a racing winner, a stop flag or a dropped caller.
    Cancelled,
    /// Rejected by a rate limiter whose projected wait exceeded the cap.
    RateLimited,
    /// Invalid input detected before dispatch. Never retried.
    Validation,
    /// A response or final-error analyzer failed or vetoed the outcome.
    AnalyzerFailure,
    /// The transport or user function itself failed.
    TransportFailure,
    /// A pre-execution hook failed.
    PreHookFailure,
    /// A cache lookup was required to succeed but missed.
    CachedMiss,
    /// A phase exceeded its replay allowance.
    ReplayExhausted,
    /// A workflow exceeded its global iteration cap.
    LoopExceeded,
    /// A jump/skip target or graph route named a phase that does not exist.
    PhaseNotFound,
}

impl ErrorKind {
    /// The wire name of this kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Timeout => "timeout",
            ErrorKind::CircuitOpen => "circuit-open",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::RateLimited => "rate-limited",
            ErrorKind::Validation => "validation",
            ErrorKind::AnalyzerFailure => "analyzer-failure",
            ErrorKind::TransportFailure => "transport-failure",
            ErrorKind::PreHookFailure => "pre-hook-failure",
            ErrorKind::CachedMiss => "cached-miss",
            ErrorKind::ReplayExhausted => "replay-exhausted",
            ErrorKind::LoopExceeded => "loop-exceeded",
            ErrorKind::PhaseNotFound => "phase-not-found",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failure observed while executing an operation.
///
/// `retryable` is the retry loop's routing bit: validation errors,
/// circuit-open rejections and analyzer-vetoed outcomes arrive with it
/// cleared, everything else defaults to retryable until an analyzer or the
/// attempt budget says otherwise.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct OperationError {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(default)]
    pub context: ExecutionContext,
    pub retryable: bool,
}

impl OperationError {
    /// A retryable error of the given kind.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        let retryable = !matches!(
            kind,
            ErrorKind::Validation | ErrorKind::CircuitOpen | ErrorKind::Cancelled
        );
        Self {
            kind,
            message: message.into(),
            context: ExecutionContext::default(),
            retryable,
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    pub fn circuit_open(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::CircuitOpen, message)
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Cancelled, message)
    }

    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::RateLimited, message)
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::TransportFailure, message)
    }

    /// Attach the execution context this error was observed under.
    pub fn with_context(mut self, context: ExecutionContext) -> Self {
        self.context = context;
        self
    }

    /// Mark this error as not worth retrying.
    pub fn not_retryable(mut self) -> Self {
        self.retryable = false;
        self
    }

    pub fn is_timeout(&self) -> bool {
        self.kind == ErrorKind::Timeout
    }

    pub fn is_circuit_open(&self) -> bool {
        self.kind == ErrorKind::CircuitOpen
    }

    pub fn is_cancelled(&self) -> bool {
        self.kind == ErrorKind::Cancelled
    }

    pub fn is_validation(&self) -> bool {
        self.kind == ErrorKind::Validation
    }
}

/// A configuration violation detected at `build()` time.
///
/// Construction-time failures are fatal by design: a breaker with a
/// threshold of 0 %, a limiter with zero capacity or a cron expression with
/// four fields never gets a chance to run.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid configuration for {pattern}: {message}")]
pub struct ConfigError {
    /// Name of the pattern instance being configured.
    pub pattern: String,
    pub message: String,
}

impl ConfigError {
    pub fn new(pattern: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            message: message.into(),
        }
    }
}
