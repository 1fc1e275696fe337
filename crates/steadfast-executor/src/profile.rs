//! Resilience profiles.
//!
//! A profile is the complete set of knobs one operation runs under. Callers
//! and composite executors express partial intent as [`ProfilePatch`]es;
//! the effective profile is resolved by layering patches over the defaults
//! (defaults ← common ← group ← per-descriptor, later wins).

use crate::backoff::BackoffStrategy;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use steadfast_bulkhead::Bulkhead;
use steadfast_cache::Cache;
use steadfast_circuitbreaker::CircuitBreaker;
use steadfast_core::OperationError;
use steadfast_ratelimiter::RateLimiter;

/// Synthetic-failure injection for resilience rehearsal.
///
/// The first attempt of an operation fails with `req_failure_probability`;
/// subsequent attempts with `retry_failure_probability`. Synthetic failures
/// are recorded exactly like real ones. A fixed `seed` makes runs
/// reproducible.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrialMode {
    pub enabled: bool,
    pub req_failure_probability: f64,
    pub retry_failure_probability: f64,
    pub seed: Option<u64>,
}

impl Default for TrialMode {
    fn default() -> Self {
        Self {
            enabled: false,
            req_failure_probability: 0.0,
            retry_failure_probability: 0.0,
            seed: None,
        }
    }
}

impl TrialMode {
    /// Fail every first attempt and no retries. Useful in tests.
    pub fn always_fail_first() -> Self {
        Self {
            enabled: true,
            req_failure_probability: 1.0,
            retry_failure_probability: 0.0,
            seed: None,
        }
    }
}

/// The effective execution knobs of one operation.
pub struct ResilienceProfile<T> {
    /// Maximum attempts, at least 1.
    pub attempts: u32,
    /// Base wait between attempts.
    pub wait: Duration,
    /// Hard cap on a single backoff sleep.
    pub max_allowed_wait: Duration,
    pub strategy: BackoffStrategy,
    /// Uniform jitter added on top of the backoff curve.
    pub jitter: Duration,
    /// Run every attempt even after a success, to collect metrics.
    pub perform_all_attempts: bool,
    /// Surface analyzer errors as fatal instead of keeping the raw outcome.
    pub throw_on_failed_error_analysis: bool,
    /// Per-attempt deadline.
    pub timeout: Option<Duration>,
    pub trial: TrialMode,
    /// Cap on serialised payload text in log output.
    pub max_serializable_chars: usize,
    pub circuit_breaker: Option<Arc<CircuitBreaker>>,
    pub rate_limiter: Option<Arc<RateLimiter>>,
    pub bulkhead: Option<Arc<Bulkhead>>,
    pub cache: Option<Arc<Cache<T>>>,
}

impl<T> Clone for ResilienceProfile<T> {
    fn clone(&self) -> Self {
        Self {
            attempts: self.attempts,
            wait: self.wait,
            max_allowed_wait: self.max_allowed_wait,
            strategy: self.strategy,
            jitter: self.jitter,
            perform_all_attempts: self.perform_all_attempts,
            throw_on_failed_error_analysis: self.throw_on_failed_error_analysis,
            timeout: self.timeout,
            trial: self.trial,
            max_serializable_chars: self.max_serializable_chars,
            circuit_breaker: self.circuit_breaker.clone(),
            rate_limiter: self.rate_limiter.clone(),
            bulkhead: self.bulkhead.clone(),
            cache: self.cache.clone(),
        }
    }
}

impl<T> Default for ResilienceProfile<T> {
    fn default() -> Self {
        Self {
            attempts: 1,
            wait: Duration::from_millis(1000),
            max_allowed_wait: Duration::from_millis(60_000),
            strategy: BackoffStrategy::Fixed,
            jitter: Duration::ZERO,
            perform_all_attempts: false,
            throw_on_failed_error_analysis: false,
            timeout: None,
            trial: TrialMode::default(),
            max_serializable_chars: 1000,
            circuit_breaker: None,
            rate_limiter: None,
            bulkhead: None,
            cache: None,
        }
    }
}

impl<T> ResilienceProfile<T> {
    /// Layer a patch over this profile; set fields win.
    pub fn apply(&mut self, patch: &ProfilePatch<T>) {
        if let Some(attempts) = patch.attempts {
            self.attempts = attempts;
        }
        if let Some(wait) = patch.wait {
            self.wait = wait;
        }
        if let Some(max_allowed_wait) = patch.max_allowed_wait {
            self.max_allowed_wait = max_allowed_wait;
        }
        if let Some(strategy) = patch.strategy {
            self.strategy = strategy;
        }
        if let Some(jitter) = patch.jitter {
            self.jitter = jitter;
        }
        if let Some(perform_all_attempts) = patch.perform_all_attempts {
            self.perform_all_attempts = perform_all_attempts;
        }
        if let Some(throw) = patch.throw_on_failed_error_analysis {
            self.throw_on_failed_error_analysis = throw;
        }
        if let Some(timeout) = patch.timeout {
            self.timeout = Some(timeout);
        }
        if let Some(trial) = patch.trial {
            self.trial = trial;
        }
        if let Some(cap) = patch.max_serializable_chars {
            self.max_serializable_chars = cap;
        }
        if let Some(circuit_breaker) = &patch.circuit_breaker {
            self.circuit_breaker = Some(Arc::clone(circuit_breaker));
        }
        if let Some(rate_limiter) = &patch.rate_limiter {
            self.rate_limiter = Some(Arc::clone(rate_limiter));
        }
        if let Some(bulkhead) = &patch.bulkhead {
            self.bulkhead = Some(Arc::clone(bulkhead));
        }
        if let Some(cache) = &patch.cache {
            self.cache = Some(Arc::clone(cache));
        }
    }

    /// Resolve defaults plus an ordered patch chain into an effective
    /// profile, validating the result.
    pub fn resolve(patches: &[&ProfilePatch<T>]) -> Result<Self, OperationError> {
        let mut profile = Self::default();
        for patch in patches {
            profile.apply(patch);
        }

        if profile.attempts == 0 {
            return Err(OperationError::validation("attempts must be at least 1"));
        }
        for (label, p) in [
            ("req_failure_probability", profile.trial.req_failure_probability),
            (
                "retry_failure_probability",
                profile.trial.retry_failure_probability,
            ),
        ] {
            if !(0.0..=1.0).contains(&p) {
                return Err(OperationError::validation(format!(
                    "{label} must be within [0, 1], got {p}"
                )));
            }
        }
        Ok(profile)
    }
}

/// A partial profile: only the set fields apply.
pub struct ProfilePatch<T> {
    pub attempts: Option<u32>,
    pub wait: Option<Duration>,
    pub max_allowed_wait: Option<Duration>,
    pub strategy: Option<BackoffStrategy>,
    pub jitter: Option<Duration>,
    pub perform_all_attempts: Option<bool>,
    pub throw_on_failed_error_analysis: Option<bool>,
    pub timeout: Option<Duration>,
    pub trial: Option<TrialMode>,
    pub max_serializable_chars: Option<usize>,
    pub circuit_breaker: Option<Arc<CircuitBreaker>>,
    pub rate_limiter: Option<Arc<RateLimiter>>,
    pub bulkhead: Option<Arc<Bulkhead>>,
    pub cache: Option<Arc<Cache<T>>>,
}

impl<T> Default for ProfilePatch<T> {
    fn default() -> Self {
        Self {
            attempts: None,
            wait: None,
            max_allowed_wait: None,
            strategy: None,
            jitter: None,
            perform_all_attempts: None,
            throw_on_failed_error_analysis: None,
            timeout: None,
            trial: None,
            max_serializable_chars: None,
            circuit_breaker: None,
            rate_limiter: None,
            bulkhead: None,
            cache: None,
        }
    }
}

impl<T> Clone for ProfilePatch<T> {
    fn clone(&self) -> Self {
        Self {
            attempts: self.attempts,
            wait: self.wait,
            max_allowed_wait: self.max_allowed_wait,
            strategy: self.strategy,
            jitter: self.jitter,
            perform_all_attempts: self.perform_all_attempts,
            throw_on_failed_error_analysis: self.throw_on_failed_error_analysis,
            timeout: self.timeout,
            trial: self.trial,
            max_serializable_chars: self.max_serializable_chars,
            circuit_breaker: self.circuit_breaker.clone(),
            rate_limiter: self.rate_limiter.clone(),
            bulkhead: self.bulkhead.clone(),
            cache: self.cache.clone(),
        }
    }
}

impl<T> ProfilePatch<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold another patch over this one; the other patch's set fields win.
    pub fn overlay(&mut self, other: &ProfilePatch<T>) {
        macro_rules! take {
            ($($field:ident),+) => {
                $(if other.$field.is_some() {
                    self.$field = other.$field.clone();
                })+
            };
        }
        take!(
            attempts,
            wait,
            max_allowed_wait,
            strategy,
            jitter,
            perform_all_attempts,
            throw_on_failed_error_analysis,
            timeout,
            trial,
            max_serializable_chars,
            circuit_breaker,
            rate_limiter,
            bulkhead,
            cache
        );
    }

    pub fn attempts(mut self, attempts: u32) -> Self {
        self.attempts = Some(attempts);
        self
    }

    pub fn wait(mut self, wait: Duration) -> Self {
        self.wait = Some(wait);
        self
    }

    pub fn max_allowed_wait(mut self, cap: Duration) -> Self {
        self.max_allowed_wait = Some(cap);
        self
    }

    pub fn strategy(mut self, strategy: BackoffStrategy) -> Self {
        self.strategy = Some(strategy);
        self
    }

    pub fn jitter(mut self, jitter: Duration) -> Self {
        self.jitter = Some(jitter);
        self
    }

    pub fn perform_all_attempts(mut self, all: bool) -> Self {
        self.perform_all_attempts = Some(all);
        self
    }

    pub fn throw_on_failed_error_analysis(mut self, throw: bool) -> Self {
        self.throw_on_failed_error_analysis = Some(throw);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn trial(mut self, trial: TrialMode) -> Self {
        self.trial = Some(trial);
        self
    }

    pub fn max_serializable_chars(mut self, cap: usize) -> Self {
        self.max_serializable_chars = Some(cap);
        self
    }

    pub fn circuit_breaker(mut self, breaker: Arc<CircuitBreaker>) -> Self {
        self.circuit_breaker = Some(breaker);
        self
    }

    pub fn rate_limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.rate_limiter = Some(limiter);
        self
    }

    pub fn bulkhead(mut self, bulkhead: Arc<Bulkhead>) -> Self {
        self.bulkhead = Some(bulkhead);
        self
    }

    pub fn cache(mut self, cache: Arc<Cache<T>>) -> Self {
        self.cache = Some(cache);
        self
    }
}
