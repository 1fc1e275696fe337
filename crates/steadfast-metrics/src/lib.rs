//! Metrics aggregation and guardrails.
//!
//! [`aggregate`] rolls a workflow result and any primitive handles into a
//! flat [`Dashboard`]; [`Guardrails`] compares metric sets against
//! caller-declared min/max bounds, reporting violations as [`Anomaly`]
//! records rather than errors.

mod dashboard;
mod guardrails;

pub use dashboard::{
    aggregate, bulkhead_metric_map, cache_metric_map, circuit_breaker_metric_map,
    rate_limiter_metric_map, BranchView, Dashboard, GroupView, InfraRefs, PhaseView, RequestView,
    WorkflowView,
};
pub use guardrails::{
    Anomaly, Bound, BoundEnd, GuardrailSources, Guardrails, InfrastructureGuardrails, MetricMap,
};
