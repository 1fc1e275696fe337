//! Two racing branches: the fast one wins, the slow one is cancelled.

use std::time::Duration;
use steadfast_core::OperationError;
use steadfast_executor::Operation;
use steadfast_workflow::{Branch, Engine, Phase, Workflow};

fn timed_phase(id: &str, ms: u64) -> Phase<u32> {
    Phase::new(id).operation(Operation::call(format!("{id}-op"), move |_| async move {
        tokio::time::sleep(Duration::from_millis(ms)).await;
        Ok(1u32)
    }))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn exactly_one_branch_wins() {
    let workflow = Workflow::branched(
        "race",
        vec![
            Branch::new("fast").phase(timed_phase("fast-work", 10)),
            Branch::new("slow").phase(timed_phase("slow-work", 30_000)),
        ],
    )
    .enable_branch_racing();

    let engine: Engine<u32> = Engine::default();
    let started = std::time::Instant::now();
    let result = engine.run(&workflow).await.unwrap();

    assert!(result.success);
    assert!(started.elapsed() < Duration::from_secs(10));

    let winners: Vec<_> = result.branch_results.iter().filter(|b| b.success).collect();
    let losers: Vec<_> = result.branch_results.iter().filter(|b| b.skipped).collect();
    assert_eq!(winners.len(), 1);
    assert_eq!(losers.len(), 1);
    assert_eq!(winners[0].branch_id, "fast");

    let loser_error = losers[0].error.as_ref().unwrap();
    assert!(loser_error.message.contains("Cancelled"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn race_survives_a_failing_contender() {
    let failing = Branch::new("broken").phase(Phase::new("broken-work").operation(
        Operation::call("broken-op", |_| async {
            Err::<u32, _>(OperationError::transport("no route"))
        }),
    ));
    let healthy = Branch::new("healthy").phase(timed_phase("healthy-work", 20));

    let workflow =
        Workflow::branched("race", vec![failing, healthy]).enable_branch_racing();

    let engine: Engine<u32> = Engine::default();
    let result = engine.run(&workflow).await.unwrap();

    assert!(result.success);
    let winner = result.branch_results.iter().find(|b| b.success).unwrap();
    assert_eq!(winner.branch_id, "healthy");
}
