//! Backoff stays inside its contract for arbitrary inputs.

use proptest::prelude::*;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::time::Duration;
use steadfast_executor::{compute_backoff, BackoffStrategy};

fn strategies() -> impl Strategy<Value = BackoffStrategy> {
    prop_oneof![
        Just(BackoffStrategy::Fixed),
        Just(BackoffStrategy::Linear),
        Just(BackoffStrategy::Exponential),
    ]
}

proptest! {
    #[test]
    fn backoff_is_bounded_by_cap_plus_jitter(
        attempt in 1u32..64,
        strategy in strategies(),
        wait_ms in 0u64..10_000,
        cap_ms in 0u64..120_000,
        jitter_ms in 0u64..5_000,
        seed in any::<u64>(),
    ) {
        let mut rng = StdRng::seed_from_u64(seed);
        let backoff = compute_backoff(
            attempt,
            strategy,
            Duration::from_millis(wait_ms),
            Duration::from_millis(cap_ms),
            Duration::from_millis(jitter_ms),
            &mut rng,
        );
        prop_assert!(backoff <= Duration::from_millis(cap_ms + jitter_ms));
    }

    #[test]
    fn zero_jitter_is_deterministic(
        attempt in 1u32..64,
        strategy in strategies(),
        wait_ms in 0u64..10_000,
        seed_a in any::<u64>(),
        seed_b in any::<u64>(),
    ) {
        let cap = Duration::from_secs(600);
        let a = compute_backoff(
            attempt, strategy, Duration::from_millis(wait_ms), cap,
            Duration::ZERO, &mut StdRng::seed_from_u64(seed_a),
        );
        let b = compute_backoff(
            attempt, strategy, Duration::from_millis(wait_ms), cap,
            Duration::ZERO, &mut StdRng::seed_from_u64(seed_b),
        );
        prop_assert_eq!(a, b);
    }

    #[test]
    fn curves_are_monotonic_in_the_attempt(
        strategy in strategies(),
        wait_ms in 1u64..1_000,
        attempt in 1u32..32,
    ) {
        let cap = Duration::from_secs(3600);
        let mut rng = StdRng::seed_from_u64(0);
        let earlier = compute_backoff(
            attempt, strategy, Duration::from_millis(wait_ms), cap,
            Duration::ZERO, &mut rng,
        );
        let later = compute_backoff(
            attempt + 1, strategy, Duration::from_millis(wait_ms), cap,
            Duration::ZERO, &mut rng,
        );
        prop_assert!(later >= earlier);
    }
}
