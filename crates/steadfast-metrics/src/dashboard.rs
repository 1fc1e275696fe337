//! Dashboard aggregation.
//!
//! Rolls a workflow result plus any primitive handles into one flat,
//! serialisable view: workflow totals and rates, per-phase / per-branch /
//! per-request / per-group rollups, and breaker/cache/limiter sections.

use crate::guardrails::MetricMap;
use serde::Serialize;
use std::collections::BTreeMap;
use steadfast_bulkhead::{Bulkhead, BulkheadMetrics};
use steadfast_cache::{Cache, CacheMetrics};
use steadfast_circuitbreaker::{CircuitBreaker, CircuitBreakerMetrics};
use steadfast_ratelimiter::{RateLimiter, RateLimiterMetrics};
use steadfast_workflow::WorkflowResult;

/// Optional primitive handles folded into the dashboard.
pub struct InfraRefs<'a, T> {
    pub circuit_breaker: Option<&'a CircuitBreaker>,
    pub rate_limiter: Option<&'a RateLimiter>,
    pub bulkhead: Option<&'a Bulkhead>,
    pub cache: Option<&'a Cache<T>>,
}

impl<'a, T> Default for InfraRefs<'a, T> {
    fn default() -> Self {
        Self {
            circuit_breaker: None,
            rate_limiter: None,
            bulkhead: None,
            cache: None,
        }
    }
}

/// Workflow-level totals and rates.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkflowView {
    pub workflow_id: String,
    pub success: bool,
    pub execution_time_ms: u64,
    pub total_phases_executed: u32,
    pub total_requests: usize,
    pub successful_requests: usize,
    pub failed_requests: usize,
    pub success_rate: f64,
    pub failure_rate: f64,
    /// Requests per second over the elapsed run.
    pub throughput_rps: f64,
    pub replays: u32,
    pub skips: u32,
    pub terminated_early: bool,
    pub termination_reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PhaseView {
    pub phase_id: String,
    pub executions: u32,
    /// Success of the latest execution.
    pub success: bool,
    pub total_duration_ms: u64,
    pub requests: usize,
    pub successful_requests: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BranchView {
    pub branch_id: String,
    pub success: bool,
    pub skipped: bool,
    pub duration_ms: u64,
    pub phases: usize,
    pub replays: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RequestView {
    pub id: String,
    pub group: Option<String>,
    pub success: bool,
    pub attempts: u32,
    pub retries: u32,
    pub duration_ms: u64,
    pub from_cache: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GroupView {
    pub group: String,
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub success_rate: f64,
}

/// The flat dashboard view.
#[derive(Debug, Clone, Serialize)]
pub struct Dashboard {
    pub workflow: WorkflowView,
    pub phases: Vec<PhaseView>,
    pub branches: Vec<BranchView>,
    pub requests: Vec<RequestView>,
    pub groups: Vec<GroupView>,
    pub circuit_breaker: Option<CircuitBreakerMetrics>,
    pub rate_limiter: Option<RateLimiterMetrics>,
    pub concurrency_limiter: Option<BulkheadMetrics>,
    pub cache: Option<CacheMetrics>,
}

/// Build the dashboard for one workflow run.
pub fn aggregate<T: Clone + Send + 'static>(result: &WorkflowResult<T>, infra: &InfraRefs<'_, T>) -> Dashboard {
    let requests: Vec<RequestView> = result
        .phase_results
        .iter()
        .flat_map(|phase| phase.batch.results.iter())
        .chain(
            result
                .branch_results
                .iter()
                .flat_map(|branch| branch.phase_results.iter())
                .flat_map(|phase| phase.batch.results.iter()),
        )
        .map(|op| RequestView {
            id: op.id.clone(),
            group: op.group.clone(),
            success: op.success,
            attempts: op.metrics.attempts,
            retries: op.metrics.retries,
            duration_ms: op.metrics.total_duration.as_millis() as u64,
            from_cache: op.from_cache,
        })
        .collect();

    let successful_requests = requests.iter().filter(|r| r.success).count();
    let total_requests = requests.len();
    let elapsed = result.duration.as_secs_f64();

    let workflow = WorkflowView {
        workflow_id: result.workflow_id.clone(),
        success: result.success,
        execution_time_ms: result.duration.as_millis() as u64,
        total_phases_executed: result.total_phases_executed,
        total_requests,
        successful_requests,
        failed_requests: total_requests - successful_requests,
        success_rate: rate(successful_requests, total_requests),
        failure_rate: rate(total_requests - successful_requests, total_requests),
        throughput_rps: if elapsed > 0.0 {
            total_requests as f64 / elapsed
        } else {
            0.0
        },
        replays: result.replays,
        skips: result.skips,
        terminated_early: result.terminated_early,
        termination_reason: result.termination_reason.clone(),
    };

    let mut phases: BTreeMap<String, PhaseView> = BTreeMap::new();
    for phase in &result.phase_results {
        let entry = phases.entry(phase.phase_id.clone()).or_insert(PhaseView {
            phase_id: phase.phase_id.clone(),
            executions: 0,
            success: false,
            total_duration_ms: 0,
            requests: 0,
            successful_requests: 0,
        });
        entry.executions += 1;
        entry.success = phase.success; // latest wins
        entry.total_duration_ms += phase.duration.as_millis() as u64;
        entry.requests += phase.batch.results.len();
        entry.successful_requests += phase.batch.results.iter().filter(|r| r.success).count();
    }

    let branches = result
        .branch_results
        .iter()
        .map(|branch| BranchView {
            branch_id: branch.branch_id.clone(),
            success: branch.success,
            skipped: branch.skipped,
            duration_ms: branch.duration.as_millis() as u64,
            phases: branch.phase_results.len(),
            replays: branch.replays,
        })
        .collect();

    let mut groups: BTreeMap<String, GroupView> = BTreeMap::new();
    for request in &requests {
        let Some(group) = &request.group else { continue };
        let entry = groups.entry(group.clone()).or_insert(GroupView {
            group: group.clone(),
            total: 0,
            succeeded: 0,
            failed: 0,
            success_rate: 0.0,
        });
        entry.total += 1;
        if request.success {
            entry.succeeded += 1;
        } else {
            entry.failed += 1;
        }
    }
    for group in groups.values_mut() {
        group.success_rate = rate(group.succeeded, group.total);
    }

    Dashboard {
        workflow,
        phases: phases.into_values().collect(),
        branches,
        requests,
        groups: groups.into_values().collect(),
        circuit_breaker: infra.circuit_breaker.map(|cb| cb.metrics()),
        rate_limiter: infra.rate_limiter.map(|rl| rl.metrics()),
        concurrency_limiter: infra.bulkhead.map(|bh| bh.metrics()),
        cache: infra.cache.map(|cache| cache.metrics()),
    }
}

fn rate(part: usize, whole: usize) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64
    }
}

/// Flatten breaker metrics for guardrail checks.
pub fn circuit_breaker_metric_map(metrics: &CircuitBreakerMetrics) -> MetricMap {
    MetricMap::from([
        ("total_requests".into(), metrics.total_requests as f64),
        (
            "successful_requests".into(),
            metrics.successful_requests as f64,
        ),
        ("failed_requests".into(), metrics.failed_requests as f64),
        ("failure_percentage".into(), metrics.failure_percentage),
        ("state_transitions".into(), metrics.state_transitions as f64),
        ("open_count".into(), metrics.open_count as f64),
        (
            "time_in_state_ms".into(),
            metrics.time_in_current_state.as_millis() as f64,
        ),
    ])
}

/// Flatten limiter metrics for guardrail checks.
pub fn rate_limiter_metric_map(metrics: &RateLimiterMetrics) -> MetricMap {
    MetricMap::from([
        ("total_requests".into(), metrics.total_requests as f64),
        ("throttled".into(), metrics.throttled as f64),
        ("throttle_rate".into(), metrics.throttle_rate()),
        ("queue_length".into(), metrics.queue_length as f64),
        ("peak_queue_length".into(), metrics.peak_queue_length as f64),
        (
            "average_queue_wait_ms".into(),
            metrics.average_queue_wait.as_millis() as f64,
        ),
    ])
}

/// Flatten bulkhead metrics for guardrail checks.
pub fn bulkhead_metric_map(metrics: &BulkheadMetrics) -> MetricMap {
    MetricMap::from([
        ("running".into(), metrics.running as f64),
        ("utilization".into(), metrics.utilization()),
        ("queue_length".into(), metrics.queue_length as f64),
        ("peak_running".into(), metrics.peak_running as f64),
        ("failed_requests".into(), metrics.failed_requests as f64),
        (
            "average_execution_ms".into(),
            metrics.average_execution_time.as_millis() as f64,
        ),
    ])
}

/// Flatten cache metrics for guardrail checks.
pub fn cache_metric_map(metrics: &CacheMetrics) -> MetricMap {
    MetricMap::from([
        ("hits".into(), metrics.stats.hits as f64),
        ("misses".into(), metrics.stats.misses as f64),
        ("hit_rate".into(), metrics.stats.hit_rate()),
        ("evictions".into(), metrics.stats.evictions as f64),
        ("utilization".into(), metrics.utilization()),
        (
            "saved_network_requests".into(),
            metrics.stats.saved_network_requests() as f64,
        ),
    ])
}
