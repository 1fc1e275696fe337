//! The breaker opens at the threshold and probes after recovery.

use std::time::Duration;
use steadfast_circuitbreaker::{CircuitBreaker, CircuitState};

#[tokio::test]
async fn opens_after_six_events_and_half_opens_after_recovery() {
    let breaker = CircuitBreaker::builder("orders-api")
        .failure_threshold_percentage(50.0)
        .minimum_requests(6)
        .recovery_timeout(Duration::from_millis(1000))
        .build()
        .unwrap();

    for _ in 0..3 {
        breaker.record_success();
    }
    assert_eq!(breaker.state(), CircuitState::Closed);

    for _ in 0..3 {
        breaker.record_failure();
    }

    // Sixth event tips 50 % over 6 requests.
    assert_eq!(breaker.state(), CircuitState::Open);
    assert!(!breaker.can_execute());

    tokio::time::sleep(Duration::from_millis(1100)).await;
    assert!(breaker.can_execute());
    assert_eq!(breaker.state(), CircuitState::HalfOpen);
}

#[tokio::test]
async fn half_open_trials_never_exceed_the_cap() {
    let breaker = CircuitBreaker::builder("strict")
        .failure_threshold_percentage(50.0)
        .minimum_requests(2)
        .recovery_timeout(Duration::from_millis(50))
        .half_open_max_requests(3)
        .build()
        .unwrap();

    breaker.record_failure();
    breaker.record_failure();
    assert_eq!(breaker.state(), CircuitState::Open);

    tokio::time::sleep(Duration::from_millis(60)).await;

    let mut admitted = 0;
    for _ in 0..10 {
        if breaker.can_execute() {
            admitted += 1;
        }
    }
    assert_eq!(admitted, 3);
    assert_eq!(breaker.state(), CircuitState::HalfOpen);
}

#[tokio::test]
async fn counts_respect_the_split_invariant() {
    let breaker = CircuitBreaker::builder("counts")
        .failure_threshold_percentage(90.0)
        .minimum_requests(100)
        .recovery_timeout(Duration::from_secs(60))
        .build()
        .unwrap();

    for i in 0..30 {
        if i % 3 == 0 {
            breaker.record_failure();
        } else {
            breaker.record_success();
        }
    }

    let metrics = breaker.metrics();
    assert_eq!(
        metrics.failed_requests + metrics.successful_requests,
        metrics.total_requests
    );
    assert_eq!(metrics.total_requests, 30);
    assert!((metrics.failure_percentage - 100.0 / 3.0).abs() < 0.5);
}
