//! Circuit breaker: fail fast when a dependency is drowning.
//!
//! The breaker gates execution on a rolling failure percentage. It is
//! `Closed` (normal) until `minimum_requests` outcomes have been recorded
//! and the failure percentage reaches `failure_threshold_percentage`; then
//! it is `Open` (every admission rejected) for `recovery_timeout`, after
//! which the first admission flips it to `HalfOpen` and up to
//! `half_open_max_requests` trial operations decide whether it closes again
//! or re-opens.
//!
//! Rejections carry the distinct `circuit-open` error kind so retry loops
//! never burn attempts against an open circuit and composite executors can
//! tell blocked work from real failures.
//!
//! # Example
//!
//! ```
//! use steadfast_circuitbreaker::CircuitBreaker;
//!
//! let breaker = CircuitBreaker::builder("payments")
//!     .failure_threshold_percentage(50.0)
//!     .minimum_requests(6)
//!     .recovery_timeout(std::time::Duration::from_secs(1))
//!     .build()
//!     .unwrap();
//!
//! assert!(breaker.can_execute());
//! breaker.record_success();
//! ```

mod config;
mod events;
mod state;

pub use config::{CircuitBreakerBuilder, CircuitBreakerConfig};
pub use events::CircuitBreakerEvent;
pub use state::{CircuitBreakerMetrics, CircuitBreakerSnapshot, CircuitState};

use state::CircuitCore;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use steadfast_core::{Debouncer, OperationError, SnapshotStore};

#[cfg(feature = "metrics")]
use metrics::{counter, describe_counter, gauge};

/// A shareable circuit breaker instance.
///
/// All methods are safe under concurrent invocation; state transitions are
/// observed atomically (the state machine lives behind one mutex).
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    core: Mutex<CircuitCore>,
    persistence: Option<PersistenceBinding>,
}

struct PersistenceBinding {
    store: Arc<dyn SnapshotStore>,
    key: String,
    debouncer: Debouncer,
}

impl CircuitBreaker {
    /// Start building a breaker with the given instance name.
    pub fn builder(name: impl Into<String>) -> CircuitBreakerBuilder {
        CircuitBreakerBuilder::new(name)
    }

    pub(crate) fn from_parts(
        config: CircuitBreakerConfig,
        store: Option<(Arc<dyn SnapshotStore>, String)>,
    ) -> Self {
        #[cfg(feature = "metrics")]
        {
            describe_counter!(
                "steadfast_circuitbreaker_transitions_total",
                "Circuit breaker state transitions"
            );
            describe_counter!(
                "steadfast_circuitbreaker_calls_total",
                "Admission decisions and recorded outcomes"
            );
        }

        let persistence = store.map(|(store, key)| PersistenceBinding {
            store,
            key,
            debouncer: Debouncer::new(config.persistence_debounce),
        });
        Self {
            config,
            core: Mutex::new(CircuitCore::new()),
            persistence,
        }
    }

    /// Instance name used in events, logs and metric labels.
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Whether retries are recorded as independent events.
    ///
    /// When false, the retry loop records exactly one outcome per operation
    /// (the final one), so a flurry of retries cannot open the circuit by
    /// itself.
    pub fn records_individual_attempts(&self) -> bool {
        self.config.track_individual_attempts
    }

    /// Current state. Open→HalfOpen transitions happen on admission
    /// queries, not on the clock, so this may report `Open` past the
    /// recovery deadline until someone asks to execute.
    pub fn state(&self) -> CircuitState {
        self.core.lock().unwrap().state()
    }

    /// Admission gate.
    ///
    /// Returns true in `Closed`; in `Open` only once the recovery timeout
    /// has elapsed (transitioning to `HalfOpen` as a side effect); in
    /// `HalfOpen` only while fewer than `half_open_max_requests` trials
    /// have been admitted.
    pub fn can_execute(&self) -> bool {
        let permitted = {
            let mut core = self.core.lock().unwrap();
            core.try_admit(&self.config)
        };

        self.config.events.emit(&if permitted {
            CircuitBreakerEvent::CallPermitted {
                pattern_name: self.config.name.clone(),
                timestamp: Instant::now(),
                state: self.state(),
            }
        } else {
            CircuitBreakerEvent::CallRejected {
                pattern_name: self.config.name.clone(),
                timestamp: Instant::now(),
            }
        });

        #[cfg(feature = "metrics")]
        counter!(
            "steadfast_circuitbreaker_calls_total",
            "circuitbreaker" => self.config.name.clone(),
            "decision" => if permitted { "permitted" } else { "rejected" }
        )
        .increment(1);

        self.maybe_persist();
        permitted
    }

    /// The error an executor should surface when this breaker rejects.
    pub fn rejection(&self) -> OperationError {
        OperationError::circuit_open(format!("circuit breaker '{}' is open", self.config.name))
    }

    /// Record a successful outcome.
    pub fn record_success(&self) {
        let transition = {
            let mut core = self.core.lock().unwrap();
            core.record_outcome(&self.config, true)
        };
        self.emit_outcome(true, transition);
    }

    /// Record a failed outcome.
    pub fn record_failure(&self) {
        let transition = {
            let mut core = self.core.lock().unwrap();
            core.record_outcome(&self.config, false)
        };
        self.emit_outcome(false, transition);
    }

    /// Force the breaker open (rejecting) until its recovery timeout runs.
    pub fn force_open(&self) {
        let transition = {
            let mut core = self.core.lock().unwrap();
            core.force_state(&self.config, CircuitState::Open)
        };
        self.finish_transition(transition);
    }

    /// Force the breaker closed, clearing rolling counts.
    pub fn force_close(&self) {
        let transition = {
            let mut core = self.core.lock().unwrap();
            core.force_state(&self.config, CircuitState::Closed)
        };
        self.finish_transition(transition);
    }

    /// Reset to a pristine closed breaker.
    pub fn reset(&self) {
        {
            let mut core = self.core.lock().unwrap();
            *core = CircuitCore::new();
        }
        tracing::info!(circuitbreaker = %self.config.name, "circuit breaker reset");
        self.maybe_persist();
    }

    /// Point-in-time metrics snapshot.
    pub fn metrics(&self) -> CircuitBreakerMetrics {
        self.core.lock().unwrap().metrics(&self.config)
    }

    /// Serialisable semantic snapshot for persistence.
    pub fn snapshot(&self) -> CircuitBreakerSnapshot {
        self.core.lock().unwrap().snapshot(&self.config)
    }

    /// Apply a previously stored snapshot to this breaker.
    pub fn apply_snapshot(&self, snapshot: &CircuitBreakerSnapshot) {
        let mut core = self.core.lock().unwrap();
        core.restore(snapshot);
    }

    /// Load persisted state, if a store is bound. Call once at startup.
    pub async fn initialize(&self) {
        let Some(persistence) = &self.persistence else {
            return;
        };
        if let Some(value) = persistence.store.load(&persistence.key).await {
            match serde_json::from_value::<CircuitBreakerSnapshot>(value) {
                Ok(snapshot) => {
                    self.apply_snapshot(&snapshot);
                    tracing::info!(
                        circuitbreaker = %self.config.name,
                        state = ?self.state(),
                        "restored circuit breaker state"
                    );
                }
                Err(error) => {
                    tracing::warn!(
                        circuitbreaker = %self.config.name,
                        %error,
                        "ignoring malformed circuit breaker snapshot"
                    );
                }
            }
        }
    }

    /// Re-read persisted state. Used by schedulers after `restore_state`.
    pub async fn reload_from_persistence(&self) {
        self.initialize().await;
    }

    fn emit_outcome(&self, success: bool, transition: Option<(CircuitState, CircuitState)>) {
        self.config.events.emit(&if success {
            CircuitBreakerEvent::SuccessRecorded {
                pattern_name: self.config.name.clone(),
                timestamp: Instant::now(),
                state: self.state(),
            }
        } else {
            CircuitBreakerEvent::FailureRecorded {
                pattern_name: self.config.name.clone(),
                timestamp: Instant::now(),
                state: self.state(),
            }
        });

        #[cfg(feature = "metrics")]
        counter!(
            "steadfast_circuitbreaker_calls_total",
            "circuitbreaker" => self.config.name.clone(),
            "decision" => if success { "success" } else { "failure" }
        )
        .increment(1);

        self.finish_transition(transition);
    }

    fn finish_transition(&self, transition: Option<(CircuitState, CircuitState)>) {
        if let Some((from, to)) = transition {
            tracing::info!(
                circuitbreaker = %self.config.name,
                from = ?from,
                to = ?to,
                "circuit state transition"
            );

            self.config.events.emit(&CircuitBreakerEvent::StateTransition {
                pattern_name: self.config.name.clone(),
                timestamp: Instant::now(),
                from,
                to,
            });

            #[cfg(feature = "metrics")]
            {
                counter!(
                    "steadfast_circuitbreaker_transitions_total",
                    "circuitbreaker" => self.config.name.clone(),
                    "from" => from.as_str(),
                    "to" => to.as_str()
                )
                .increment(1);
                gauge!(
                    "steadfast_circuitbreaker_state",
                    "circuitbreaker" => self.config.name.clone()
                )
                .set(to as u8 as f64);
            }
        }
        self.maybe_persist();
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

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.config.name)
            .field("state", &self.state())
            .finish()
    }
}
