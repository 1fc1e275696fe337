//! Five concurrent operations through a 2-per-500ms limiter.

use std::sync::Arc;
use std::time::{Duration, Instant};
use steadfast_ratelimiter::RateLimiter;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn admissions_spread_across_windows_in_fifo_order() {
    let limiter = Arc::new(
        RateLimiter::builder("batch")
            .capacity(2)
            .window(Duration::from_millis(500))
            .build()
            .unwrap(),
    );

    let started = Instant::now();
    let mut handles = Vec::new();
    for _ in 0..5 {
        let limiter = Arc::clone(&limiter);
        handles.push(tokio::spawn(async move {
            limiter.acquire().await.unwrap();
            started.elapsed()
        }));
    }

    let mut admissions: Vec<Duration> = Vec::new();
    for handle in handles {
        admissions.push(handle.await.unwrap());
    }
    admissions.sort();

    // First two immediate, next two after ~500 ms, last after ~1000 ms.
    assert!(admissions[0] < Duration::from_millis(100));
    assert!(admissions[1] < Duration::from_millis(100));
    assert!(admissions[2] >= Duration::from_millis(400));
    assert!(admissions[3] >= Duration::from_millis(400));
    assert!(admissions[3] < Duration::from_millis(900));
    assert!(admissions[4] >= Duration::from_millis(900));

    let metrics = limiter.metrics();
    assert_eq!(metrics.total_requests, 5);
    assert!(metrics.throttle_rate() >= 0.0);
    assert!(metrics.peak_queue_length >= 3);
    assert!(metrics.average_queue_wait > Duration::ZERO);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn no_window_ever_admits_more_than_capacity() {
    let limiter = Arc::new(
        RateLimiter::builder("strict")
            .capacity(3)
            .window(Duration::from_millis(200))
            .build()
            .unwrap(),
    );

    let started = Instant::now();
    let mut handles = Vec::new();
    for _ in 0..12 {
        let limiter = Arc::clone(&limiter);
        handles.push(tokio::spawn(async move {
            limiter.acquire().await.unwrap();
            started.elapsed()
        }));
    }

    let mut admissions: Vec<Duration> = Vec::new();
    for handle in handles {
        admissions.push(handle.await.unwrap());
    }

    // Count admissions per 200 ms window; none may exceed 3.
    let mut per_window = std::collections::HashMap::new();
    for admitted in admissions {
        *per_window.entry(admitted.as_millis() / 200).or_insert(0u32) += 1;
    }
    assert!(per_window.values().all(|&n| n <= 3), "{per_window:?}");
}
