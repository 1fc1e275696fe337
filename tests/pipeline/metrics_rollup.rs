//! Dashboard aggregation and guardrails over a real workflow run.

use std::sync::Arc;
use std::time::Duration;
use steadfast::prelude::*;
use steadfast_metrics::{circuit_breaker_metric_map, GuardrailSources};
use steadfast_workflow::Phase;

#[tokio::test]
async fn dashboard_reflects_a_mixed_run() {
    let engine: Engine<u32> = Engine::default();
    let workflow = Workflow::linear(
        "report",
        vec![
            Phase::new("gather")
                .concurrent()
                .operation(Operation::call("a", |_| async { Ok(1u32) }).in_group("sources"))
                .operation(Operation::call("b", |_| async { Ok(2u32) }).in_group("sources"))
                .operation(Operation::call("c", |_| async {
                    Err(steadfast_core::OperationError::transport("flaked"))
                })),
            Phase::new("publish").operation(Operation::call("d", |_| async { Ok(3u32) })),
        ],
    );

    let result = engine.run(&workflow).await.unwrap();
    let dashboard = aggregate(&result, &InfraRefs::default());

    assert_eq!(dashboard.workflow.total_requests, 4);
    assert_eq!(dashboard.workflow.successful_requests, 3);
    assert_eq!(dashboard.workflow.failed_requests, 1);
    assert!((dashboard.workflow.success_rate - 0.75).abs() < f64::EPSILON);
    assert!(dashboard.workflow.throughput_rps > 0.0);

    let sources = dashboard
        .groups
        .iter()
        .find(|g| g.group == "sources")
        .unwrap();
    assert_eq!(sources.total, 2);
    assert_eq!(sources.succeeded, 2);

    let gather = dashboard
        .phases
        .iter()
        .find(|p| p.phase_id == "gather")
        .unwrap();
    assert_eq!(gather.requests, 3);
    assert_eq!(gather.successful_requests, 2);
}

#[tokio::test]
async fn guardrail_violations_are_anomalies_not_errors() {
    let breaker = CircuitBreaker::builder("watched")
        .failure_threshold_percentage(90.0)
        .minimum_requests(100)
        .recovery_timeout(Duration::from_secs(60))
        .build()
        .unwrap();
    for _ in 0..8 {
        breaker.record_failure();
    }
    breaker.record_success();

    let mut guardrails = Guardrails::default();
    guardrails
        .infrastructure
        .circuit_breaker
        .insert("failure_percentage".into(), Bound::at_most(50.0));
    guardrails
        .infrastructure
        .circuit_breaker
        .insert("total_requests".into(), Bound::at_most(1000.0));

    let sources = GuardrailSources {
        circuit_breaker: Some(circuit_breaker_metric_map(&breaker.metrics())),
        ..Default::default()
    };

    let anomalies = guardrails.validate(&sources);
    assert_eq!(anomalies.len(), 1);
    assert_eq!(anomalies[0].metric, "failure_percentage");
    assert!(anomalies[0].value > 80.0);
}

#[tokio::test]
async fn limiter_and_bulkhead_sections_roll_up() {
    let limiter = Arc::new(
        RateLimiter::builder("dash-limiter")
            .capacity(1)
            .window(Duration::from_millis(50))
            .build()
            .unwrap(),
    );
    limiter.acquire().await.unwrap();
    limiter.acquire().await.unwrap(); // queued into the next window

    let bulkhead = Arc::new(Bulkhead::builder("dash-bulkhead").capacity(2).build().unwrap());
    bulkhead
        .execute(async { Ok::<_, OperationError>(()) })
        .await
        .unwrap();

    let engine: Engine<u32> = Engine::default();
    let workflow = Workflow::linear(
        "tiny",
        vec![Phase::new("only").operation(Operation::call("op", |_| async { Ok(0u32) }))],
    );
    let result = engine.run(&workflow).await.unwrap();

    let infra = InfraRefs {
        rate_limiter: Some(limiter.as_ref()),
        bulkhead: Some(bulkhead.as_ref()),
        ..InfraRefs::default()
    };
    let dashboard = aggregate(&result, &infra);

    let limiter_view = dashboard.rate_limiter.unwrap();
    assert_eq!(limiter_view.total_requests, 2);
    assert_eq!(limiter_view.throttled, 1);

    let bulkhead_view = dashboard.concurrency_limiter.unwrap();
    assert_eq!(bulkhead_view.completed_requests, 1);
    assert!(bulkhead_view.utilization() < 1.0);
}
