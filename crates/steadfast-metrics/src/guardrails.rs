//! Guardrails: caller-declared min/max bounds on observable metrics.
//!
//! Violations are reported as anomaly records, never raised: a guardrail
//! describes something worth looking at, not something worth crashing for.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A named metric set, e.g. everything a circuit breaker exposes.
pub type MetricMap = HashMap<String, f64>;

/// Acceptable range for one metric. Unset ends are unchecked.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Bound {
    pub min: Option<f64>,
    pub max: Option<f64>,
}

impl Bound {
    pub fn at_least(min: f64) -> Self {
        Self {
            min: Some(min),
            max: None,
        }
    }

    pub fn at_most(max: f64) -> Self {
        Self {
            min: None,
            max: Some(max),
        }
    }

    pub fn between(min: f64, max: f64) -> Self {
        Self {
            min: Some(min),
            max: Some(max),
        }
    }
}

/// Which end of a bound was violated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BoundEnd {
    Min,
    Max,
}

/// One observed guardrail violation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Anomaly {
    /// Which metric set the metric belongs to, e.g. `"circuit_breaker"`.
    pub section: String,
    pub metric: String,
    pub value: f64,
    pub violated: BoundEnd,
    pub limit: f64,
}

/// Guardrail bounds grouped by metric source.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Guardrails {
    #[serde(default)]
    pub scheduler: HashMap<String, Bound>,
    #[serde(default)]
    pub request: HashMap<String, Bound>,
    #[serde(default)]
    pub infrastructure: InfrastructureGuardrails,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InfrastructureGuardrails {
    #[serde(default)]
    pub circuit_breaker: HashMap<String, Bound>,
    #[serde(default)]
    pub rate_limiter: HashMap<String, Bound>,
    #[serde(default)]
    pub cache: HashMap<String, Bound>,
    #[serde(default)]
    pub concurrency_limiter: HashMap<String, Bound>,
}

/// The metric sets guardrails are checked against. Absent sources skip
/// their section entirely.
#[derive(Debug, Clone, Default)]
pub struct GuardrailSources {
    pub scheduler: Option<MetricMap>,
    pub request: Option<MetricMap>,
    pub circuit_breaker: Option<MetricMap>,
    pub rate_limiter: Option<MetricMap>,
    pub cache: Option<MetricMap>,
    pub concurrency_limiter: Option<MetricMap>,
}

impl Guardrails {
    /// Compare every configured bound against the supplied metric sets.
    pub fn validate(&self, sources: &GuardrailSources) -> Vec<Anomaly> {
        let mut anomalies = Vec::new();
        let sections: [(&str, &HashMap<String, Bound>, &Option<MetricMap>); 6] = [
            ("scheduler", &self.scheduler, &sources.scheduler),
            ("request", &self.request, &sources.request),
            (
                "circuit_breaker",
                &self.infrastructure.circuit_breaker,
                &sources.circuit_breaker,
            ),
            (
                "rate_limiter",
                &self.infrastructure.rate_limiter,
                &sources.rate_limiter,
            ),
            ("cache", &self.infrastructure.cache, &sources.cache),
            (
                "concurrency_limiter",
                &self.infrastructure.concurrency_limiter,
                &sources.concurrency_limiter,
            ),
        ];

        for (section, bounds, metrics) in sections {
            let Some(metrics) = metrics else { continue };
            anomalies.extend(check_section(section, bounds, metrics));
        }
        anomalies
    }
}

fn check_section(
    section: &str,
    bounds: &HashMap<String, Bound>,
    metrics: &MetricMap,
) -> Vec<Anomaly> {
    let mut anomalies = Vec::new();
    for (metric, bound) in bounds {
        let Some(&value) = metrics.get(metric) else {
            continue;
        };
        if let Some(min) = bound.min {
            if value < min {
                anomalies.push(Anomaly {
                    section: section.to_string(),
                    metric: metric.clone(),
                    value,
                    violated: BoundEnd::Min,
                    limit: min,
                });
            }
        }
        if let Some(max) = bound.max {
            if value > max {
                anomalies.push(Anomaly {
                    section: section.to_string(),
                    metric: metric.clone(),
                    value,
                    violated: BoundEnd::Max,
                    limit: max,
                });
            }
        }
    }
    anomalies.sort_by(|a, b| a.metric.cmp(&b.metric));
    anomalies
}
