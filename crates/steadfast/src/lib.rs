//! steadfast: a resilience and orchestration runtime for async Rust.
//!
//! Describe a unit of unreliable work declaratively, as a transport request
//! or an async function, and execute it with retries, backoff, timeouts,
//! caching, rate and concurrency limiting and circuit breaking. Compose
//! units into batches, workflows (phases, branches, DAGs with conditional
//! routing, replay and parallelism) and recurring schedules, and share
//! primitive state across a fleet through a pluggable coordinator.
//!
//! Each concern lives in its own crate; this facade re-exports the whole
//! stack. Start with [`executor::Operation`] and [`executor::Runner`] for
//! single operations, [`workflow::Engine`] for multi-step work, and
//! [`scheduler::Scheduler`] for recurring jobs.
//!
//! ```
//! use steadfast::prelude::*;
//! use std::time::Duration;
//!
//! # async fn example() {
//! let breaker = std::sync::Arc::new(
//!     CircuitBreaker::builder("api")
//!         .failure_threshold_percentage(50.0)
//!         .minimum_requests(10)
//!         .recovery_timeout(Duration::from_secs(30))
//!         .build()
//!         .unwrap(),
//! );
//!
//! let op = Operation::call("fetch", |_| async { Ok::<_, OperationError>(42u32) })
//!     .with_profile(
//!         ProfilePatch::new()
//!             .attempts(3)
//!             .wait(Duration::from_millis(200))
//!             .strategy(BackoffStrategy::Exponential)
//!             .circuit_breaker(breaker),
//!     );
//!
//! let runner: Runner<u32> = Runner::new();
//! let result = runner.execute(&op).await;
//! assert!(result.success);
//! # }
//! ```

pub use steadfast_buffer as buffer;
pub use steadfast_bulkhead as bulkhead;
pub use steadfast_cache as cache;
pub use steadfast_circuitbreaker as circuitbreaker;
pub use steadfast_coordinator as coordinator;
pub use steadfast_core as core;
pub use steadfast_executor as executor;
pub use steadfast_gateway as gateway;
pub use steadfast_metrics as metrics;
pub use steadfast_ratelimiter as ratelimiter;
pub use steadfast_scheduler as scheduler;
pub use steadfast_workflow as workflow;

/// The names most integrations need.
pub mod prelude {
    pub use steadfast_buffer::StableBuffer;
    pub use steadfast_bulkhead::Bulkhead;
    pub use steadfast_cache::{Cache, EvictionPolicy};
    pub use steadfast_circuitbreaker::{CircuitBreaker, CircuitState};
    pub use steadfast_coordinator::{
        Coordinator, CoordinatorStore, InfraBundle, LockRequest, MemoryCoordinator,
    };
    pub use steadfast_core::{
        CancelToken, ErrorKind, EventListeners, ExecutionContext, OperationError, SnapshotStore,
    };
    pub use steadfast_executor::{
        Analysis, BackoffStrategy, FinalDisposition, Method, Operation, OperationResult,
        ProfilePatch, Protocol, RequestSpec, RunOptions, Runner, SharedBuffer, StateValue,
        Transport, TransportResponse, TrialMode,
    };
    pub use steadfast_gateway::{BatchConfig, BatchMode, BatchResult, Gateway};
    pub use steadfast_metrics::{aggregate, Anomaly, Bound, Dashboard, Guardrails, InfraRefs};
    pub use steadfast_ratelimiter::RateLimiter;
    pub use steadfast_scheduler::{JobRetry, JobSpec, Schedule, Scheduler, SharedInfrastructure};
    pub use steadfast_workflow::{
        Branch, BranchDecision, Decision, Engine, Phase, Workflow, WorkflowGraph, WorkflowResult,
    };
}
