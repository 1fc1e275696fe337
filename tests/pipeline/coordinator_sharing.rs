//! Coordinator round-trips and fleet-shared primitive state.

use std::sync::Arc;
use std::time::Duration;
use steadfast::prelude::*;
use steadfast_coordinator::ElectionRequest;

#[tokio::test]
async fn state_and_counters_round_trip() {
    let coordinator = MemoryCoordinator::new("fleet");

    coordinator
        .set_state("config", serde_json::json!({ "limit": 10 }))
        .await
        .unwrap();
    assert_eq!(
        coordinator.get_state("config").await.unwrap(),
        Some(serde_json::json!({ "limit": 10 }))
    );

    assert_eq!(coordinator.increment_counter("seen", 5).await.unwrap(), 5);
    assert_eq!(coordinator.increment_counter("seen", 5).await.unwrap(), 10);
    assert_eq!(coordinator.get_counter("seen").await.unwrap(), 10);
}

#[tokio::test]
async fn two_bundles_share_breaker_state_through_one_backend() {
    let coordinator: Arc<dyn Coordinator> = Arc::new(MemoryCoordinator::new("payments"));

    let breaker_config = || {
        CircuitBreaker::builder("payments")
            .failure_threshold_percentage(50.0)
            .minimum_requests(2)
            .recovery_timeout(Duration::from_secs(60))
    };

    let process_a = InfraBundle::builder(Arc::clone(&coordinator), "payments")
        .circuit_breaker(breaker_config())
        .persistence_debounce(Duration::ZERO)
        .build()
        .unwrap();

    let breaker_a = process_a.circuit_breaker.as_ref().unwrap();
    breaker_a.record_failure();
    breaker_a.record_failure();
    assert_eq!(breaker_a.state(), CircuitState::Open);
    process_a
        .store
        .store(
            "circuit-breaker",
            serde_json::to_value(breaker_a.snapshot()).unwrap(),
        )
        .await;

    // A "second process" builds the same bundle and sees the open circuit.
    let process_b = InfraBundle::builder(coordinator, "payments")
        .circuit_breaker(breaker_config())
        .build()
        .unwrap();
    process_b.initialize().await;

    let breaker_b = process_b.circuit_breaker.unwrap();
    assert_eq!(breaker_b.state(), CircuitState::Open);
    assert!(!breaker_b.can_execute());
}

#[tokio::test]
async fn leadership_coordinates_which_node_does_the_work() {
    let node_a = MemoryCoordinator::new("workers");
    let node_b = node_a.attach("node-b");

    let outcome_a = node_a
        .campaign(ElectionRequest::new("batch-leader", Duration::from_secs(5)))
        .await
        .unwrap();
    let outcome_b = node_b
        .campaign(ElectionRequest::new("batch-leader", Duration::from_secs(5)))
        .await
        .unwrap();

    let leaders = [&outcome_a, &outcome_b]
        .iter()
        .filter(|o| o.status == steadfast_coordinator::ElectionStatus::Leader)
        .count();
    assert_eq!(leaders, 1);
    assert_eq!(outcome_b.leader_id, outcome_a.leader_id);
}

#[tokio::test]
async fn with_lock_serialises_fleet_critical_sections() {
    use steadfast_coordinator::with_lock;

    let coordinator = Arc::new(MemoryCoordinator::new("jobs"));
    let log = Arc::new(std::sync::Mutex::new(Vec::new()));

    let mut handles = Vec::new();
    for worker in 0..4 {
        let coordinator = Arc::clone(&coordinator);
        let log = Arc::clone(&log);
        handles.push(tokio::spawn(async move {
            with_lock(
                coordinator.as_ref(),
                LockRequest::new("critical", Duration::from_secs(5))
                    .wait_up_to(Duration::from_secs(5)),
                || async {
                    log.lock().unwrap().push((worker, "enter"));
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    log.lock().unwrap().push((worker, "exit"));
                },
            )
            .await
            .unwrap();
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    // Entries and exits strictly alternate: no overlapping sections.
    let log = log.lock().unwrap();
    assert_eq!(log.len(), 8);
    for pair in log.chunks(2) {
        assert_eq!(pair[0].0, pair[1].0);
        assert_eq!(pair[0].1, "enter");
        assert_eq!(pair[1].1, "exit");
    }
}
