//! One circuit breaker shared by two schedulers.

use std::sync::Arc;
use std::time::Duration;
use steadfast_circuitbreaker::CircuitBreaker;
use steadfast_core::OperationError;
use steadfast_scheduler::{JobSpec, Scheduler, SharedInfrastructure};

#[tokio::test]
async fn breaker_counts_outcomes_from_both_schedulers() {
    let breaker = Arc::new(
        CircuitBreaker::builder("fleet")
            .failure_threshold_percentage(99.0)
            .minimum_requests(1000)
            .recovery_timeout(Duration::from_secs(60))
            .build()
            .unwrap(),
    );
    let infrastructure = SharedInfrastructure {
        circuit_breaker: Some(Arc::clone(&breaker)),
        ..Default::default()
    };

    let failing: Scheduler<u32> = Scheduler::builder("ingest")
        .infrastructure(infrastructure.clone())
        .max_parallel(8)
        .handler(|_| async { Err(OperationError::transport("downstream down")) })
        .build();
    let succeeding: Scheduler<u32> = Scheduler::builder("digest")
        .infrastructure(infrastructure)
        .handler(|_| async { Ok(0u32) })
        .build();

    for i in 0..3 {
        failing.add_job(JobSpec::new(format!("bad-{i}"))).unwrap();
    }
    succeeding.add_job(JobSpec::new("good")).unwrap();

    failing.tick_once().await;
    succeeding.tick_once().await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    let metrics = breaker.metrics();
    assert_eq!(metrics.total_requests, 4);
    assert_eq!(metrics.failed_requests, 3);
    assert_eq!(metrics.successful_requests, 1);
}

#[tokio::test]
async fn an_open_shared_breaker_blocks_every_scheduler() {
    let breaker = Arc::new(
        CircuitBreaker::builder("tight")
            .failure_threshold_percentage(50.0)
            .minimum_requests(1)
            .recovery_timeout(Duration::from_secs(60))
            .build()
            .unwrap(),
    );
    breaker.record_failure(); // opens

    let infrastructure = SharedInfrastructure {
        circuit_breaker: Some(Arc::clone(&breaker)),
        ..Default::default()
    };
    let scheduler: Scheduler<u32> = Scheduler::builder("blocked")
        .infrastructure(infrastructure)
        .handler(|_| async { Ok(0u32) })
        .build();
    scheduler.add_job(JobSpec::new("gated")).unwrap();

    scheduler.tick_once().await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    // The handler never ran; the dispatch failed on the open circuit, and
    // the rejection itself recorded no outcome.
    assert_eq!(scheduler.metrics().failed, 1);
    assert_eq!(breaker.metrics().total_requests, 1);
}
