//! Limiter events.

use std::time::{Duration, Instant};
use steadfast_core::PatternEvent;

/// Events emitted by a [`RateLimiter`](crate::RateLimiter).
#[derive(Debug, Clone)]
pub enum RateLimiterEvent {
    /// An admission was granted, after `waited` in the queue (zero when
    /// the live window had room).
    Admitted {
        pattern_name: String,
        timestamp: Instant,
        waited: Duration,
    },
    /// An admission was booked into a future window.
    Queued {
        pattern_name: String,
        timestamp: Instant,
        wake_at: Instant,
    },
    /// The projected wait exceeded the configured cap.
    Rejected {
        pattern_name: String,
        timestamp: Instant,
        projected_wait: Duration,
    },
}

impl PatternEvent for RateLimiterEvent {
    fn event_type(&self) -> &'static str {
        match self {
            RateLimiterEvent::Admitted { .. } => "admitted",
            RateLimiterEvent::Queued { .. } => "queued",
            RateLimiterEvent::Rejected { .. } => "rejected",
        }
    }

    fn timestamp(&self) -> Instant {
        match self {
            RateLimiterEvent::Admitted { timestamp, .. }
            | RateLimiterEvent::Queued { timestamp, .. }
            | RateLimiterEvent::Rejected { timestamp, .. } => *timestamp,
        }
    }

    fn pattern_name(&self) -> &str {
        match self {
            RateLimiterEvent::Admitted { pattern_name, .. }
            | RateLimiterEvent::Queued { pattern_name, .. }
            | RateLimiterEvent::Rejected { pattern_name, .. } => pattern_name,
        }
    }
}
