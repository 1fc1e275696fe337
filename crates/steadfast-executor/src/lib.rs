//! Single-operation executor: the retry/timeout/hook pipeline shared by
//! requests and functions.
//!
//! Callers describe a unit of work as an [`Operation`] (a transport
//! request or an async function plus a [`ProfilePatch`] of resilience
//! knobs) and a [`Runner`] drives it: admission gates (circuit breaker,
//! rate limiter, bulkhead), cache consult, pre-execution hook, trial-mode
//! fault injection, the invocation under its deadline, response analysis,
//! backoff between attempts, and a final-error analyzer once attempts are
//! spent. Every execution returns a structured [`OperationResult`]; the
//! runner itself never panics or throws for operation failures.
//!
//! # Example
//!
//! ```
//! use steadfast_executor::{Operation, ProfilePatch, Runner};
//! use steadfast_core::OperationError;
//! use std::time::Duration;
//!
//! # async fn example() {
//! let runner: Runner<u32> = Runner::new();
//! let op = Operation::call("answer", |_| async { Ok::<_, OperationError>(42) })
//!     .with_profile(ProfilePatch::new().attempts(3).wait(Duration::from_millis(50)));
//!
//! let result = runner.execute(&op).await;
//! assert!(result.success);
//! assert_eq!(result.data, Some(42));
//! # }
//! ```

mod backoff;
mod operation;
mod profile;
mod result;
mod run;
mod transport;

pub use backoff::{compute_backoff, BackoffStrategy};
pub use operation::{
    Analysis, AnalyzerInput, CallFn, CallInput, ErrorHandler, FinalDisposition, FinalErrorAnalyzer,
    FinalErrorInput, HookInput, Method, Operation, OperationKind, PreExecutionHook, Protocol,
    RequestSpec, ResponseAnalyzer, SharedBuffer, StateValue, SuccessHandler,
};
pub use profile::{ProfilePatch, ResilienceProfile, TrialMode};
pub use result::{AttemptOutcome, AttemptRecord, OperationMetrics, OperationResult, Verdict};
pub use run::{RunOptions, Runner};
pub use transport::{Transport, TransportResponse};

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::{Duration, Instant};
    use steadfast_core::{ErrorKind, ExecutionContext, OperationError};

    fn flaky(fail_first: u32) -> (Operation<u32>, Arc<AtomicU32>) {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = Arc::clone(&calls);
        let op = Operation::call("flaky", move |_| {
            let calls = Arc::clone(&calls_clone);
            async move {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                if n < fail_first {
                    Err(OperationError::transport("still warming up"))
                } else {
                    Ok(n)
                }
            }
        });
        (op, calls)
    }

    #[tokio::test]
    async fn first_attempt_success_needs_no_retry() {
        let runner = Runner::new();
        let (op, calls) = flaky(0);
        let result = runner
            .execute(&op.with_profile(ProfilePatch::new().attempts(3)))
            .await;

        assert!(result.success);
        assert_eq!(result.metrics.attempts, 1);
        assert_eq!(result.metrics.retries, 0);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retries_until_success() {
        let runner = Runner::new();
        let (op, calls) = flaky(2);
        let result = runner
            .execute(&op.with_profile(
                ProfilePatch::new().attempts(5).wait(Duration::from_millis(1)),
            ))
            .await;

        assert!(result.success);
        assert_eq!(result.data, Some(2));
        assert_eq!(result.metrics.attempts, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(result.attempts[0].outcome, AttemptOutcome::Failure);
        assert_eq!(result.attempts[2].outcome, AttemptOutcome::Success);
    }

    #[tokio::test]
    async fn exhaustion_reports_all_attempt_records() {
        let runner = Runner::new();
        let (op, _) = flaky(100);
        let analyzer_calls = Arc::new(AtomicU32::new(0));
        let analyzer_clone = Arc::clone(&analyzer_calls);

        let result = runner
            .execute(
                &op.with_profile(
                    ProfilePatch::new().attempts(3).wait(Duration::from_millis(10)),
                )
                .with_final_error_analyzer(move |_| {
                    analyzer_clone.fetch_add(1, Ordering::SeqCst);
                    async { FinalDisposition::Propagate }
                }),
            )
            .await;

        assert!(!result.success);
        assert_eq!(result.attempts.len(), 3);
        assert_eq!(result.metrics.retries, 2);
        assert_eq!(analyzer_calls.load(Ordering::SeqCst), 1);
        assert_eq!(result.error.as_ref().unwrap().kind, ErrorKind::TransportFailure);
    }

    #[tokio::test]
    async fn fixed_backoff_wall_time_is_bounded() {
        let runner = Runner::new();
        let (op, _) = flaky(100);
        let started = Instant::now();
        let result = runner
            .execute(&op.with_profile(
                ProfilePatch::new().attempts(3).wait(Duration::from_millis(10)),
            ))
            .await;
        let elapsed = started.elapsed();

        assert_eq!(result.attempts.len(), 3);
        // Two sleeps of 10 ms plus slop.
        assert!(elapsed >= Duration::from_millis(20));
        assert!(elapsed < Duration::from_millis(500));
    }

    #[tokio::test]
    async fn validation_errors_never_retry() {
        let runner = Runner::new();
        let op: Operation<u32> = Operation::call("invalid", |_| async {
            Err(OperationError::validation("bad input"))
        })
        .with_profile(ProfilePatch::new().attempts(5).wait(Duration::from_millis(1)));

        let result = runner.execute(&op).await;
        assert!(!result.success);
        assert_eq!(result.attempts.len(), 1);
    }

    #[tokio::test]
    async fn timeout_failures_are_retryable() {
        let runner = Runner::new();
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = Arc::clone(&calls);
        let op = Operation::call("slow-then-fast", move |_| {
            let calls = Arc::clone(&calls_clone);
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    tokio::time::sleep(Duration::from_secs(10)).await;
                }
                Ok::<_, OperationError>(7u32)
            }
        })
        .with_profile(
            ProfilePatch::new()
                .attempts(2)
                .wait(Duration::from_millis(1))
                .timeout(Duration::from_millis(30)),
        );

        let result = runner.execute(&op).await;
        assert!(result.success);
        assert_eq!(result.attempts[0].error.as_ref().unwrap().kind, ErrorKind::Timeout);
    }

    #[tokio::test]
    async fn trial_mode_fails_first_attempt_synthetically() {
        let runner = Runner::new();
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = Arc::clone(&calls);
        let op = Operation::call("trialed", move |_| {
            let calls = Arc::clone(&calls_clone);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, OperationError>(1u32)
            }
        })
        .with_profile(
            ProfilePatch::new()
                .attempts(2)
                .wait(Duration::from_millis(1))
                .trial(TrialMode::always_fail_first()),
        );

        let result = runner.execute(&op).await;
        assert!(result.success);
        assert!(result.attempts[0].synthetic);
        assert_eq!(result.attempts[0].outcome, AttemptOutcome::Failure);
        // The synthetic failure never reached the function.
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn analyzer_downgrades_semantic_failures() {
        let runner = Runner::new();
        let op: Operation<u32> = Operation::call("semantic", |_| async { Ok(500u32) })
            .with_response_analyzer(|input: AnalyzerInput<u32>| async move {
                if input.payload >= 500 {
                    Ok(Analysis::Fail {
                        message: "payload looks like an error code".into(),
                        retryable: false,
                    })
                } else {
                    Ok(Analysis::Pass)
                }
            })
            .with_profile(ProfilePatch::new().attempts(3).wait(Duration::from_millis(1)));

        let result = runner.execute(&op).await;
        assert!(!result.success);
        assert_eq!(result.attempts.len(), 1); // analyzer said non-retryable
        assert_eq!(result.error.as_ref().unwrap().kind, ErrorKind::AnalyzerFailure);
        assert_eq!(result.attempts[0].verdict, Verdict::Fail);
    }

    #[tokio::test]
    async fn final_error_analyzer_can_suppress() {
        let runner = Runner::new();
        let op: Operation<u32> = Operation::call("doomed", |_| async {
            Err(OperationError::transport("nope"))
        })
        .with_final_error_analyzer(|_| async { FinalDisposition::Suppress });

        let result = runner.execute(&op).await;
        assert!(!result.success);
        assert!(result.error_suppressed);
        assert!(result.effective_error().is_none());
    }

    #[tokio::test]
    async fn pre_hook_failure_is_fatal_by_default() {
        let runner = Runner::new();
        let op: Operation<u32> = Operation::call("hooked", |_| async { Ok(1) })
            .with_pre_hook(|_| async { Err(OperationError::transport("hook exploded")) })
            .with_profile(ProfilePatch::new().attempts(3).wait(Duration::from_millis(1)));

        let result = runner.execute(&op).await;
        assert!(!result.success);
        assert_eq!(result.attempts.len(), 1);
        assert_eq!(result.error.as_ref().unwrap().kind, ErrorKind::PreHookFailure);
    }

    #[tokio::test]
    async fn pre_hook_override_applies_per_attempt() {
        let runner = Runner::new();
        let (op, _) = flaky(100);
        let op = op
            .with_pre_hook(|_| async {
                // Shrink the wait so the test runs fast.
                Ok(Some(ProfilePatch::new().wait(Duration::from_millis(1))))
            })
            .apply_pre_hook_override(true)
            .with_profile(ProfilePatch::new().attempts(3).wait(Duration::from_secs(30)));

        let started = Instant::now();
        let result = runner.execute(&op).await;
        assert!(!result.success);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn request_without_transport_is_a_validation_failure() {
        let runner: Runner<u32> = Runner::new();
        let op = Operation::request("req", RequestSpec::get("api.example.com"));
        let result = runner.execute(&op).await;
        assert!(!result.success);
        assert!(result.error.as_ref().unwrap().is_validation());
    }

    struct StubTransport {
        status: u16,
    }

    #[async_trait]
    impl Transport<String> for StubTransport {
        async fn send(
            &self,
            request: &RequestSpec,
            _context: &ExecutionContext,
        ) -> Result<TransportResponse<String>, OperationError> {
            Ok(TransportResponse::new(self.status, format!("hello from {}", request.hostname))
                .with_header("Cache-Control", "max-age=60"))
        }
    }

    #[tokio::test]
    async fn request_operations_flow_through_the_transport() {
        let runner = Runner::with_transport(Arc::new(StubTransport { status: 200 }));
        let op = Operation::request("req", RequestSpec::get("api.example.com"));
        let result = runner.execute(&op).await;
        assert!(result.success);
        assert_eq!(result.data.as_deref(), Some("hello from api.example.com"));
    }

    #[tokio::test]
    async fn cached_hit_skips_the_second_transport_call() {
        use steadfast_cache::Cache;

        let cache: Arc<Cache<String>> =
            Arc::new(Cache::<String>::for_requests("exec-cache").build().unwrap());
        let runner = Runner::with_transport(Arc::new(StubTransport { status: 200 }));
        let op = Operation::request("req", RequestSpec::get("api.example.com"))
            .with_profile(ProfilePatch::new().cache(Arc::clone(&cache)));

        let first = runner.execute(&op).await;
        assert!(first.success);
        assert!(!first.from_cache);

        let second = runner.execute(&op).await;
        assert!(second.success);
        assert!(second.from_cache);
        assert_eq!(cache.metrics().stats.hits, 1);
    }

    #[tokio::test]
    async fn circuit_open_short_circuits_without_retry() {
        use steadfast_circuitbreaker::CircuitBreaker;

        let breaker = Arc::new(
            CircuitBreaker::builder("exec-breaker")
                .failure_threshold_percentage(50.0)
                .minimum_requests(1)
                .recovery_timeout(Duration::from_secs(60))
                .build()
                .unwrap(),
        );
        breaker.record_failure(); // opens immediately

        let runner: Runner<u32> = Runner::new();
        let op = Operation::call("gated", |_| async { Ok(1u32) }).with_profile(
            ProfilePatch::new()
                .attempts(5)
                .wait(Duration::from_millis(1))
                .circuit_breaker(breaker),
        );

        let result = runner.execute(&op).await;
        assert!(!result.success);
        assert_eq!(result.attempts.len(), 1);
        assert!(result.error.as_ref().unwrap().is_circuit_open());
    }

    #[tokio::test]
    async fn breaker_records_one_outcome_per_operation_by_default() {
        use steadfast_circuitbreaker::CircuitBreaker;

        let breaker = Arc::new(
            CircuitBreaker::builder("per-op")
                .failure_threshold_percentage(99.0)
                .minimum_requests(100)
                .recovery_timeout(Duration::from_secs(60))
                .build()
                .unwrap(),
        );

        let runner = Runner::new();
        let (op, _) = flaky(100);
        let op = op.with_profile(
            ProfilePatch::new()
                .attempts(4)
                .wait(Duration::from_millis(1))
                .circuit_breaker(Arc::clone(&breaker)),
        );

        let result = runner.execute(&op).await;
        assert!(!result.success);
        assert_eq!(result.attempts.len(), 4);
        // Four attempts, one recorded outcome.
        assert_eq!(breaker.metrics().total_requests, 1);
    }

    #[tokio::test]
    async fn cancellation_stops_the_loop() {
        let runner = Runner::new();
        let (op, _) = flaky(100);
        let op = op.with_profile(
            ProfilePatch::new().attempts(100).wait(Duration::from_millis(50)),
        );

        let token = steadfast_core::CancelToken::new();
        let handle = {
            let runner = runner.clone();
            let token = token.clone();
            tokio::spawn(async move { runner.run(&op, &RunOptions::cancellable(token)).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        token.cancel();
        let result = handle.await.unwrap();
        assert!(!result.success);
        assert!(result.is_cancelled());
        assert!(result.error.as_ref().unwrap().message.contains("Cancelled"));
    }
}
