//! Backoff computation.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How the wait between attempts grows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackoffStrategy {
    /// Same wait before every retry.
    #[default]
    Fixed,
    /// `wait * attempt`.
    Linear,
    /// `wait * 2^(attempt - 1)`.
    Exponential,
}

/// Compute the sleep after a failed attempt (1-based).
///
/// The strategy curve is clamped to `max_allowed_wait`, then uniform
/// jitter in `[0, jitter]` is added on top.
pub fn compute_backoff(
    attempt: u32,
    strategy: BackoffStrategy,
    wait: Duration,
    max_allowed_wait: Duration,
    jitter: Duration,
    rng: &mut impl Rng,
) -> Duration {
    let attempt = attempt.max(1);
    let base = match strategy {
        BackoffStrategy::Fixed => wait,
        BackoffStrategy::Linear => wait.saturating_mul(attempt),
        BackoffStrategy::Exponential => {
            wait.saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)))
        }
    };
    let clamped = base.min(max_allowed_wait);

    if jitter.is_zero() {
        clamped
    } else {
        let jitter_ms = rng.random_range(0..=jitter.as_millis() as u64);
        clamped + Duration::from_millis(jitter_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn rng() -> StdRng {
        StdRng::seed_from_u64(7)
    }

    #[test]
    fn fixed_is_constant() {
        let wait = Duration::from_millis(100);
        let cap = Duration::from_secs(60);
        for attempt in 1..5 {
            let backoff = compute_backoff(
                attempt,
                BackoffStrategy::Fixed,
                wait,
                cap,
                Duration::ZERO,
                &mut rng(),
            );
            assert_eq!(backoff, wait);
        }
    }

    #[test]
    fn linear_scales_with_attempt() {
        let wait = Duration::from_millis(100);
        let cap = Duration::from_secs(60);
        let backoffs: Vec<_> = (1..=3)
            .map(|a| {
                compute_backoff(
                    a,
                    BackoffStrategy::Linear,
                    wait,
                    cap,
                    Duration::ZERO,
                    &mut rng(),
                )
            })
            .collect();
        assert_eq!(
            backoffs,
            vec![
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::from_millis(300)
            ]
        );
    }

    #[test]
    fn exponential_doubles() {
        let wait = Duration::from_millis(100);
        let cap = Duration::from_secs(60);
        let backoffs: Vec<_> = (1..=4)
            .map(|a| {
                compute_backoff(
                    a,
                    BackoffStrategy::Exponential,
                    wait,
                    cap,
                    Duration::ZERO,
                    &mut rng(),
                )
            })
            .collect();
        assert_eq!(
            backoffs,
            vec![
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::from_millis(400),
                Duration::from_millis(800)
            ]
        );
    }

    #[test]
    fn clamps_to_max_allowed_wait() {
        let backoff = compute_backoff(
            30,
            BackoffStrategy::Exponential,
            Duration::from_secs(1),
            Duration::from_secs(5),
            Duration::ZERO,
            &mut rng(),
        );
        assert_eq!(backoff, Duration::from_secs(5));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let wait = Duration::from_millis(100);
        let jitter = Duration::from_millis(50);
        let mut rng = rng();
        for _ in 0..100 {
            let backoff = compute_backoff(
                1,
                BackoffStrategy::Fixed,
                wait,
                Duration::from_secs(60),
                jitter,
                &mut rng,
            );
            assert!(backoff >= wait);
            assert!(backoff <= wait + jitter);
        }
    }
}
