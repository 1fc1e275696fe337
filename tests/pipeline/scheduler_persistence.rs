//! Scheduler state persists through a coordinator and restores before
//! dispatch.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use steadfast::prelude::*;
use steadfast_coordinator::CoordinatorStore;

fn store_over(coordinator: &Arc<MemoryCoordinator>) -> Arc<dyn SnapshotStore> {
    Arc::new(CoordinatorStore::new(
        Arc::clone(coordinator) as Arc<dyn Coordinator>,
        "sched",
    ))
}

#[tokio::test]
async fn jobs_survive_a_scheduler_restart() {
    let coordinator = Arc::new(MemoryCoordinator::new("jobs"));
    let runs = Arc::new(AtomicU32::new(0));

    {
        let scheduler: Scheduler<u32> = Scheduler::builder("original")
            .persistence(store_over(&coordinator), "state")
            .handler(|_| async { Ok(0u32) })
            .build();
        scheduler
            .add_job(JobSpec::new("recurring").every(Duration::from_millis(10)))
            .unwrap();
        scheduler
            .add_job(JobSpec::new("nightly").cron("0 3 * * *"))
            .unwrap();
        scheduler.persist_now().await;
    }

    // A fresh scheduler restores the same jobs and keeps running them.
    let runs_clone = Arc::clone(&runs);
    let restored: Scheduler<u32> = Scheduler::builder("restarted")
        .persistence(store_over(&coordinator), "state")
        .handler(move |invocation| {
            let runs = Arc::clone(&runs_clone);
            async move {
                if invocation.job_id == "recurring" {
                    runs.fetch_add(1, Ordering::SeqCst);
                }
                Ok(0u32)
            }
        })
        .build();

    restored.restore_state().await.unwrap();
    assert_eq!(restored.metrics().jobs, 2);

    tokio::time::sleep(Duration::from_millis(20)).await;
    restored.tick_once().await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(runs.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn restore_rehydrates_shared_infrastructure_first() {
    let coordinator = Arc::new(MemoryCoordinator::new("infra"));
    let store = store_over(&coordinator);

    // Persist an open breaker under the key the restored one will read.
    {
        let breaker = CircuitBreaker::builder("gate")
            .failure_threshold_percentage(50.0)
            .minimum_requests(1)
            .recovery_timeout(Duration::from_secs(60))
            .build()
            .unwrap();
        breaker.record_failure();
        store
            .store("breaker", serde_json::to_value(breaker.snapshot()).unwrap())
            .await;
    }

    let breaker = Arc::new(
        CircuitBreaker::builder("gate")
            .failure_threshold_percentage(50.0)
            .minimum_requests(1)
            .recovery_timeout(Duration::from_secs(60))
            .persistence(Arc::clone(&store), "breaker")
            .build()
            .unwrap(),
    );
    assert_eq!(breaker.state(), CircuitState::Closed);

    let scheduler: Scheduler<u32> = Scheduler::builder("guarded")
        .infrastructure(SharedInfrastructure {
            circuit_breaker: Some(Arc::clone(&breaker)),
            ..Default::default()
        })
        .handler(|_| async { Ok(0u32) })
        .build();

    scheduler.restore_state().await.unwrap();
    // The persisted open state arrived before any dispatch.
    assert_eq!(breaker.state(), CircuitState::Open);

    scheduler.add_job(JobSpec::new("blocked")).unwrap();
    scheduler.tick_once().await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(scheduler.metrics().failed, 1);
}

#[tokio::test]
async fn cron_jobs_wait_for_their_instant() {
    let scheduler: Scheduler<u32> = Scheduler::builder("cron")
        .handler(|_| async { Ok(0u32) })
        .build();
    // 03:00 daily: not due now unless we happen to be at exactly 03:00,
    // and certainly not dispatched by an immediate tick.
    scheduler.add_job(JobSpec::new("nightly").cron("0 3 * * *")).unwrap();

    scheduler.tick_once().await;
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(scheduler.metrics().dispatched, 0);
}
