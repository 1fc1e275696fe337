//! One operation through every gate: circuit breaker, rate limiter,
//! bulkhead and cache, against a stub transport.

use async_trait::async_trait;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use steadfast::prelude::*;

struct CountingTransport {
    calls: Arc<AtomicU32>,
    status: u16,
}

#[async_trait]
impl Transport<String> for CountingTransport {
    async fn send(
        &self,
        request: &RequestSpec,
        _context: &ExecutionContext,
    ) -> Result<TransportResponse<String>, OperationError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(TransportResponse::new(self.status, format!("body:{}", request.path)))
    }
}

fn guarded_profile(
    cache: &Arc<Cache<String>>,
    breaker: &Arc<CircuitBreaker>,
) -> ProfilePatch<String> {
    let limiter = Arc::new(
        RateLimiter::builder("stack-limiter")
            .capacity(100)
            .window(Duration::from_secs(1))
            .build()
            .unwrap(),
    );
    let bulkhead = Arc::new(Bulkhead::builder("stack-bulkhead").capacity(8).build().unwrap());
    ProfilePatch::new()
        .attempts(2)
        .wait(Duration::from_millis(5))
        .circuit_breaker(Arc::clone(breaker))
        .rate_limiter(limiter)
        .bulkhead(bulkhead)
        .cache(Arc::clone(cache))
}

#[tokio::test]
async fn second_identical_request_is_served_from_cache() {
    let calls = Arc::new(AtomicU32::new(0));
    let transport = Arc::new(CountingTransport {
        calls: Arc::clone(&calls),
        status: 200,
    });
    let runner = Runner::with_transport(transport);

    let cache: Arc<Cache<String>> = Arc::new(Cache::<String>::for_requests("stack-cache").build().unwrap());
    let breaker = Arc::new(CircuitBreaker::builder("stack-breaker").build().unwrap());

    let op = Operation::request(
        "lookup",
        RequestSpec::get("api.example.com").with_path("/items/7"),
    )
    .with_profile(guarded_profile(&cache, &breaker));

    let first = runner.execute(&op).await;
    assert!(first.success);
    assert!(!first.from_cache);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let second = runner.execute(&op).await;
    assert!(second.success);
    assert!(second.from_cache);
    assert_eq!(second.data.as_deref(), first.data.as_deref());
    // No second transport call: the cache absorbed it.
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(cache.metrics().stats.saved_network_requests(), 1);
}

#[tokio::test]
async fn uncacheable_status_codes_bypass_the_cache() {
    let calls = Arc::new(AtomicU32::new(0));
    let transport = Arc::new(CountingTransport {
        calls: Arc::clone(&calls),
        status: 500,
    });
    let runner = Runner::with_transport(transport);

    let cache: Arc<Cache<String>> = Arc::new(Cache::<String>::for_requests("sad-cache").build().unwrap());
    let breaker = Arc::new(CircuitBreaker::builder("sad-breaker").build().unwrap());

    let op = Operation::request("err", RequestSpec::get("api.example.com"))
        .with_profile(guarded_profile(&cache, &breaker));

    let first = runner.execute(&op).await;
    // A 500 is still a transport-level success without an analyzer.
    assert!(first.success);
    assert_eq!(cache.len(), 0);

    let second = runner.execute(&op).await;
    assert!(!second.from_cache);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn analyzer_turns_bad_statuses_into_failures() {
    let calls = Arc::new(AtomicU32::new(0));
    let transport = Arc::new(CountingTransport {
        calls: Arc::clone(&calls),
        status: 503,
    });
    let runner = Runner::with_transport(transport);

    let op = Operation::request("checked", RequestSpec::get("api.example.com"))
        .with_response_analyzer(|input: steadfast_executor::AnalyzerInput<String>| async move {
            match input.status {
                Some(status) if status >= 500 => Ok(Analysis::Fail {
                    message: format!("upstream returned {status}"),
                    retryable: true,
                }),
                _ => Ok(Analysis::Pass),
            }
        })
        .with_profile(ProfilePatch::new().attempts(3).wait(Duration::from_millis(1)));

    let result = runner.execute(&op).await;
    assert!(!result.success);
    assert_eq!(result.attempts.len(), 3);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(
        result.error.as_ref().unwrap().kind,
        ErrorKind::AnalyzerFailure
    );
}

#[tokio::test]
async fn open_circuit_blocks_requests_before_the_transport() {
    let calls = Arc::new(AtomicU32::new(0));
    let transport = Arc::new(CountingTransport {
        calls: Arc::clone(&calls),
        status: 200,
    });
    let runner = Runner::with_transport(transport);

    let breaker = Arc::new(
        CircuitBreaker::builder("slammed")
            .failure_threshold_percentage(50.0)
            .minimum_requests(1)
            .recovery_timeout(Duration::from_secs(60))
            .build()
            .unwrap(),
    );
    breaker.record_failure();

    let op = Operation::request("blocked", RequestSpec::get("api.example.com"))
        .with_profile(ProfilePatch::new().attempts(5).circuit_breaker(breaker));

    let result = runner.execute(&op).await;
    assert!(!result.success);
    assert!(result.error.as_ref().unwrap().is_circuit_open());
    assert_eq!(result.attempts.len(), 1);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}
