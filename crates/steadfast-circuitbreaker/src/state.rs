//! The breaker state machine.

use crate::config::CircuitBreakerConfig;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// Breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum CircuitState {
    /// Normal operation; every call is admitted.
    Closed = 0,
    /// Failing fast; every call is rejected until the recovery timeout.
    Open = 1,
    /// Trial window; a bounded number of calls probe the dependency.
    HalfOpen = 2,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "CLOSED",
            CircuitState::Open => "OPEN",
            CircuitState::HalfOpen => "HALF_OPEN",
        }
    }
}

/// Point-in-time view of breaker internals.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CircuitBreakerMetrics {
    pub state: CircuitState,
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    /// Rolling failure percentage, 0.0 when nothing has been recorded.
    pub failure_percentage: f64,
    pub state_transitions: u64,
    /// Times the breaker has entered `Open`.
    pub open_count: u64,
    #[serde(skip)]
    pub time_in_current_state: Duration,
    /// Remaining open time, `None` outside `Open`.
    #[serde(skip)]
    pub open_remaining: Option<Duration>,
    /// Cumulative time spent open, including the current stint.
    #[serde(skip)]
    pub total_open_duration: Duration,
    pub half_open_requests: u64,
    pub half_open_successes: u64,
    pub half_open_failures: u64,
    pub config: ConfigEcho,
}

/// The configuration the breaker was built with, echoed into metrics and
/// snapshots so dashboards need no second lookup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigEcho {
    pub failure_threshold_percentage: f64,
    pub minimum_requests: u64,
    pub recovery_timeout_ms: u64,
    pub success_threshold_percentage: f64,
    pub half_open_max_requests: u64,
    pub track_individual_attempts: bool,
}

/// Serialisable semantic state for persistence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerSnapshot {
    pub state: CircuitState,
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub state_transitions: u64,
    pub open_count: u64,
    /// Milliseconds of open time left when the snapshot was taken.
    pub open_remaining_ms: u64,
    pub total_open_duration_ms: u64,
    pub half_open_requests: u64,
    pub half_open_successes: u64,
    pub half_open_failures: u64,
    pub config: ConfigEcho,
}

pub(crate) struct CircuitCore {
    state: CircuitState,
    total_requests: u64,
    successful_requests: u64,
    failed_requests: u64,
    state_transitions: u64,
    open_count: u64,
    last_state_change: Instant,
    open_until: Option<Instant>,
    open_duration_accum: Duration,
    half_open_admitted: u64,
    half_open_completed: u64,
    half_open_successes: u64,
    half_open_failures: u64,
}

impl CircuitCore {
    pub(crate) fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            total_requests: 0,
            successful_requests: 0,
            failed_requests: 0,
            state_transitions: 0,
            open_count: 0,
            last_state_change: Instant::now(),
            open_until: None,
            open_duration_accum: Duration::ZERO,
            half_open_admitted: 0,
            half_open_completed: 0,
            half_open_successes: 0,
            half_open_failures: 0,
        }
    }

    pub(crate) fn state(&self) -> CircuitState {
        self.state
    }

    fn failure_percentage(&self) -> f64 {
        if self.total_requests == 0 {
            0.0
        } else {
            self.failed_requests as f64 / self.total_requests as f64 * 100.0
        }
    }

    /// Admission query. May transition Open→HalfOpen when the recovery
    /// deadline has passed.
    pub(crate) fn try_admit(&mut self, config: &CircuitBreakerConfig) -> bool {
        match self.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let expired = self
                    .open_until
                    .map(|until| Instant::now() >= until)
                    .unwrap_or(true);
                if expired {
                    self.transition_to(CircuitState::HalfOpen, config);
                    self.half_open_admitted = 1;
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => {
                if self.half_open_admitted < config.half_open_max_requests {
                    self.half_open_admitted += 1;
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Record one outcome. Returns the transition it caused, if any.
    pub(crate) fn record_outcome(
        &mut self,
        config: &CircuitBreakerConfig,
        success: bool,
    ) -> Option<(CircuitState, CircuitState)> {
        match self.state {
            CircuitState::Closed | CircuitState::Open => {
                self.total_requests += 1;
                if success {
                    self.successful_requests += 1;
                } else {
                    self.failed_requests += 1;
                }

                if self.state == CircuitState::Closed
                    && self.total_requests >= config.minimum_requests
                    && self.failure_percentage() >= config.failure_threshold_percentage
                {
                    return self.transition_to(CircuitState::Open, config);
                }
                None
            }
            CircuitState::HalfOpen => {
                self.half_open_completed += 1;
                if success {
                    self.half_open_successes += 1;
                } else {
                    self.half_open_failures += 1;
                }

                if self.half_open_completed >= config.half_open_max_requests {
                    let success_rate =
                        self.half_open_successes as f64 / self.half_open_completed as f64 * 100.0;
                    if success_rate >= config.success_threshold_percentage {
                        self.transition_to(CircuitState::Closed, config)
                    } else {
                        self.transition_to(CircuitState::Open, config)
                    }
                } else {
                    None
                }
            }
        }
    }

    pub(crate) fn force_state(
        &mut self,
        config: &CircuitBreakerConfig,
        state: CircuitState,
    ) -> Option<(CircuitState, CircuitState)> {
        self.transition_to(state, config)
    }

    fn transition_to(
        &mut self,
        to: CircuitState,
        config: &CircuitBreakerConfig,
    ) -> Option<(CircuitState, CircuitState)> {
        if self.state == to {
            return None;
        }
        let from = self.state;

        if from == CircuitState::Open {
            self.open_duration_accum += self.last_state_change.elapsed();
            self.open_until = None;
        }

        self.state = to;
        self.state_transitions += 1;
        self.last_state_change = Instant::now();

        match to {
            CircuitState::Open => {
                self.open_count += 1;
                self.open_until = Some(Instant::now() + config.recovery_timeout);
                self.reset_half_open();
            }
            CircuitState::HalfOpen => {
                self.reset_half_open();
            }
            CircuitState::Closed => {
                self.total_requests = 0;
                self.successful_requests = 0;
                self.failed_requests = 0;
                self.reset_half_open();
            }
        }

        Some((from, to))
    }

    fn reset_half_open(&mut self) {
        self.half_open_admitted = 0;
        self.half_open_completed = 0;
        self.half_open_successes = 0;
        self.half_open_failures = 0;
    }

    pub(crate) fn metrics(&self, config: &CircuitBreakerConfig) -> CircuitBreakerMetrics {
        let current_open = if self.state == CircuitState::Open {
            self.last_state_change.elapsed()
        } else {
            Duration::ZERO
        };

        CircuitBreakerMetrics {
            state: self.state,
            total_requests: self.total_requests,
            successful_requests: self.successful_requests,
            failed_requests: self.failed_requests,
            failure_percentage: self.failure_percentage(),
            state_transitions: self.state_transitions,
            open_count: self.open_count,
            time_in_current_state: self.last_state_change.elapsed(),
            open_remaining: self
                .open_until
                .map(|until| until.saturating_duration_since(Instant::now())),
            total_open_duration: self.open_duration_accum + current_open,
            half_open_requests: self.half_open_completed,
            half_open_successes: self.half_open_successes,
            half_open_failures: self.half_open_failures,
            config: config.echo(),
        }
    }

    pub(crate) fn snapshot(&self, config: &CircuitBreakerConfig) -> CircuitBreakerSnapshot {
        CircuitBreakerSnapshot {
            state: self.state,
            total_requests: self.total_requests,
            successful_requests: self.successful_requests,
            failed_requests: self.failed_requests,
            state_transitions: self.state_transitions,
            open_count: self.open_count,
            open_remaining_ms: self
                .open_until
                .map(|until| until.saturating_duration_since(Instant::now()).as_millis() as u64)
                .unwrap_or(0),
            total_open_duration_ms: self.open_duration_accum.as_millis() as u64,
            half_open_requests: self.half_open_completed,
            half_open_successes: self.half_open_successes,
            half_open_failures: self.half_open_failures,
            config: config.echo(),
        }
    }

    pub(crate) fn restore(&mut self, snapshot: &CircuitBreakerSnapshot) {
        self.state = snapshot.state;
        self.total_requests = snapshot.total_requests;
        self.successful_requests = snapshot.successful_requests;
        self.failed_requests = snapshot.failed_requests;
        self.state_transitions = snapshot.state_transitions;
        self.open_count = snapshot.open_count;
        self.open_duration_accum = Duration::from_millis(snapshot.total_open_duration_ms);
        self.half_open_completed = snapshot.half_open_requests;
        self.half_open_admitted = snapshot.half_open_requests;
        self.half_open_successes = snapshot.half_open_successes;
        self.half_open_failures = snapshot.half_open_failures;
        self.last_state_change = Instant::now();
        self.open_until = if snapshot.state == CircuitState::Open {
            Some(Instant::now() + Duration::from_millis(snapshot.open_remaining_ms))
        } else {
            None
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CircuitBreakerBuilder;

    fn config(minimum: u64) -> CircuitBreakerConfig {
        CircuitBreakerBuilder::new("core-test")
            .failure_threshold_percentage(50.0)
            .minimum_requests(minimum)
            .recovery_timeout(Duration::from_millis(20))
            .into_config()
            .unwrap()
    }

    #[test]
    fn counts_satisfy_the_split_invariant() {
        let cfg = config(100);
        let mut core = CircuitCore::new();
        for i in 0..10 {
            core.record_outcome(&cfg, i % 3 == 0);
        }
        let m = core.metrics(&cfg);
        assert_eq!(m.failed_requests + m.successful_requests, m.total_requests);
    }

    #[test]
    fn open_until_is_respected() {
        let cfg = config(1);
        let mut core = CircuitCore::new();
        core.record_outcome(&cfg, false);
        assert_eq!(core.state(), CircuitState::Open);
        assert!(!core.try_admit(&cfg));

        std::thread::sleep(Duration::from_millis(25));
        assert!(core.try_admit(&cfg));
        assert_eq!(core.state(), CircuitState::HalfOpen);
    }

    #[test]
    fn open_duration_accumulates_across_stints() {
        let cfg = config(1);
        let mut core = CircuitCore::new();
        core.record_outcome(&cfg, false);
        std::thread::sleep(Duration::from_millis(25));
        assert!(core.try_admit(&cfg));

        let m = core.metrics(&cfg);
        assert!(m.total_open_duration >= Duration::from_millis(20));
    }
}
