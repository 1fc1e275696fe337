//! End-to-end scenario tests for the steadfast runtime.
//!
//! Each module pins down one externally observable behavior of a
//! component, timings, orderings and counters included, using only the
//! public API of the facade crates.

#[path = "scenarios/branch_racing.rs"]
mod branch_racing;
#[path = "scenarios/circuit_breaker.rs"]
mod circuit_breaker;
#[path = "scenarios/rate_limited_batch.rs"]
mod rate_limited_batch;
#[path = "scenarios/retry_exhaustion.rs"]
mod retry_exhaustion;
#[path = "scenarios/shared_circuit.rs"]
mod shared_circuit;
#[path = "scenarios/workflow_jump.rs"]
mod workflow_jump;
