//! A persistently failing operation exhausts its attempts.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use steadfast_core::{ErrorKind, OperationError};
use steadfast_executor::{
    BackoffStrategy, FinalDisposition, Operation, ProfilePatch, Runner,
};

#[tokio::test]
async fn three_attempts_fixed_backoff_and_one_final_analysis() {
    let transport_calls = Arc::new(AtomicU32::new(0));
    let analyzer_calls = Arc::new(AtomicU32::new(0));
    let transport_clone = Arc::clone(&transport_calls);
    let analyzer_clone = Arc::clone(&analyzer_calls);

    let op: Operation<u32> = Operation::call("doomed", move |_| {
        let calls = Arc::clone(&transport_clone);
        async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(OperationError::transport("service down"))
        }
    })
    .with_profile(
        ProfilePatch::new()
            .attempts(3)
            .wait(Duration::from_millis(10))
            .strategy(BackoffStrategy::Fixed)
            .jitter(Duration::ZERO),
    )
    .with_final_error_analyzer(move |input| {
        let calls = Arc::clone(&analyzer_clone);
        async move {
            calls.fetch_add(1, Ordering::SeqCst);
            assert_eq!(input.attempts_made, 3);
            FinalDisposition::Propagate
        }
    });

    let runner = Runner::new();
    let started = Instant::now();
    let result = runner.execute(&op).await;
    let elapsed = started.elapsed();

    assert!(!result.success);
    assert_eq!(result.attempts.len(), 3);
    assert_eq!(transport_calls.load(Ordering::SeqCst), 3);
    assert_eq!(analyzer_calls.load(Ordering::SeqCst), 1);
    assert_eq!(result.error.as_ref().unwrap().kind, ErrorKind::TransportFailure);

    // Two fixed 10 ms backoffs, give or take scheduling slop.
    assert!(elapsed >= Duration::from_millis(20));
    assert!(elapsed < Duration::from_millis(400));

    // Attempt records are ordered and numbered from 1.
    for (index, record) in result.attempts.iter().enumerate() {
        assert_eq!(record.number as usize, index + 1);
    }
    assert_eq!(result.metrics.retries, 2);
}

#[tokio::test]
async fn attempt_records_never_exceed_the_budget() {
    for attempts in [1u32, 2, 5] {
        let op: Operation<u32> = Operation::call("flaky", |_| async {
            Err(OperationError::transport("nope"))
        })
        .with_profile(
            ProfilePatch::new()
                .attempts(attempts)
                .wait(Duration::from_millis(1)),
        );

        let result = Runner::new().execute(&op).await;
        assert!(result.attempts.len() as u32 <= attempts);
        assert_eq!(result.attempts.len() as u32, attempts);
    }
}
