//! Window accounting.
//!
//! Admissions are assigned to numbered windows relative to a fixed origin.
//! The state tracks the furthest window currently being filled; an acquire
//! either lands in the live window (immediate) or is booked into the first
//! window with spare capacity and told when that window opens.

use crate::config::RateLimiterConfig;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// Point-in-time limiter metrics.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RateLimiterMetrics {
    pub capacity: u64,
    #[serde(skip)]
    pub window: Duration,
    pub total_requests: u64,
    pub completed_requests: u64,
    pub throttled: u64,
    /// Admissions booked into the window currently being filled.
    pub admitted_in_window: u64,
    pub queue_length: u64,
    pub peak_queue_length: u64,
    #[serde(skip)]
    pub average_queue_wait: Duration,
    /// Highest single-window admission count observed.
    pub peak_window_admissions: u64,
}

impl RateLimiterMetrics {
    /// Fraction of requests that had to queue or were rejected.
    pub fn throttle_rate(&self) -> f64 {
        if self.total_requests == 0 {
            0.0
        } else {
            self.throttled as f64 / self.total_requests as f64
        }
    }
}

/// Serialisable snapshot for persistence. Window timing is process-local
/// and restarts on restore; counters carry over.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimiterSnapshot {
    pub capacity: u64,
    pub window_ms: u64,
    pub total_requests: u64,
    pub completed_requests: u64,
    pub throttled: u64,
    pub queue_length: u64,
    pub peak_queue_length: u64,
    pub average_queue_wait_ms: u64,
    pub peak_window_admissions: u64,
}

pub(crate) struct LimiterState {
    origin: Instant,
    /// Index of the window admissions are currently booked into.
    booking_window: u64,
    booked: u64,
    total_requests: u64,
    completed_requests: u64,
    throttled: u64,
    queue_length: u64,
    peak_queue_length: u64,
    queue_wait_total: Duration,
    queued_served: u64,
    peak_window_admissions: u64,
}

impl LimiterState {
    pub(crate) fn new() -> Self {
        Self {
            origin: Instant::now(),
            booking_window: 0,
            booked: 0,
            total_requests: 0,
            completed_requests: 0,
            throttled: 0,
            queue_length: 0,
            peak_queue_length: 0,
            queue_wait_total: Duration::ZERO,
            queued_served: 0,
            peak_window_admissions: 0,
        }
    }

    /// Book an admission.
    ///
    /// `Ok(None)`: admitted into the live window, go ahead.
    /// `Ok(Some(instant))`: queued; sleep until the instant.
    /// `Err(projected)`: projected wait exceeds the configured cap.
    pub(crate) fn admit(
        &mut self,
        config: &RateLimiterConfig,
        now: Instant,
    ) -> Result<Option<Instant>, Duration> {
        let window = config.window;
        let live = (now.duration_since(self.origin).as_nanos() / window.as_nanos().max(1)) as u64;

        if self.booking_window < live {
            self.booking_window = live;
            self.booked = 0;
        }

        if self.booking_window == live && self.booked < config.capacity {
            self.total_requests += 1;
            self.completed_requests += 1;
            self.booked += 1;
            self.peak_window_admissions = self.peak_window_admissions.max(self.booked);
            return Ok(None);
        }

        // Live window (or the window being booked) is full; take the first
        // slot in the next window with room.
        if self.booked >= config.capacity {
            self.booking_window += 1;
            self.booked = 0;
        }

        let target = self.origin + window * (self.booking_window as u32);
        let projected = target.saturating_duration_since(now);
        if let Some(max_wait) = config.max_wait {
            if projected > max_wait {
                self.total_requests += 1;
                self.throttled += 1;
                return Err(projected);
            }
        }

        self.total_requests += 1;
        self.throttled += 1;
        self.booked += 1;
        self.peak_window_admissions = self.peak_window_admissions.max(self.booked);
        self.queue_length += 1;
        self.peak_queue_length = self.peak_queue_length.max(self.queue_length);
        Ok(Some(target))
    }

    /// A queued waiter woke up (or was cancelled while queued).
    pub(crate) fn dequeue(&mut self, waited: Duration, admitted: bool) {
        self.queue_length = self.queue_length.saturating_sub(1);
        if admitted {
            self.completed_requests += 1;
            self.queued_served += 1;
            self.queue_wait_total += waited;
        }
    }

    pub(crate) fn metrics(&self, config: &RateLimiterConfig) -> RateLimiterMetrics {
        RateLimiterMetrics {
            capacity: config.capacity,
            window: config.window,
            total_requests: self.total_requests,
            completed_requests: self.completed_requests,
            throttled: self.throttled,
            admitted_in_window: self.booked,
            queue_length: self.queue_length,
            peak_queue_length: self.peak_queue_length,
            average_queue_wait: self.average_queue_wait(),
            peak_window_admissions: self.peak_window_admissions,
        }
    }

    fn average_queue_wait(&self) -> Duration {
        if self.queued_served == 0 {
            Duration::ZERO
        } else {
            self.queue_wait_total / self.queued_served as u32
        }
    }

    pub(crate) fn snapshot(&self, config: &RateLimiterConfig) -> RateLimiterSnapshot {
        RateLimiterSnapshot {
            capacity: config.capacity,
            window_ms: config.window.as_millis() as u64,
            total_requests: self.total_requests,
            completed_requests: self.completed_requests,
            throttled: self.throttled,
            queue_length: self.queue_length,
            peak_queue_length: self.peak_queue_length,
            average_queue_wait_ms: self.average_queue_wait().as_millis() as u64,
            peak_window_admissions: self.peak_window_admissions,
        }
    }

    pub(crate) fn restore(&mut self, snapshot: &RateLimiterSnapshot) {
        self.total_requests = snapshot.total_requests;
        self.completed_requests = snapshot.completed_requests;
        self.throttled = snapshot.throttled;
        self.peak_queue_length = snapshot.peak_queue_length;
        self.peak_window_admissions = snapshot.peak_window_admissions;
        self.queued_served = if snapshot.average_queue_wait_ms > 0 { 1 } else { 0 };
        self.queue_wait_total = Duration::from_millis(snapshot.average_queue_wait_ms);
    }
}
