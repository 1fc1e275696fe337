//! Bulkhead events.

use std::time::Instant;
use steadfast_core::PatternEvent;

/// Events emitted by a [`Bulkhead`](crate::Bulkhead).
#[derive(Debug, Clone)]
pub enum BulkheadEvent {
    /// No slot was free; the caller joined the queue.
    CallQueued {
        pattern_name: String,
        timestamp: Instant,
        capacity: u64,
    },
    /// A queued caller gave up (max wait elapsed or cancelled).
    CallRejected {
        pattern_name: String,
        timestamp: Instant,
        capacity: u64,
    },
}

impl PatternEvent for BulkheadEvent {
    fn event_type(&self) -> &'static str {
        match self {
            BulkheadEvent::CallQueued { .. } => "call_queued",
            BulkheadEvent::CallRejected { .. } => "call_rejected",
        }
    }

    fn timestamp(&self) -> Instant {
        match self {
            BulkheadEvent::CallQueued { timestamp, .. }
            | BulkheadEvent::CallRejected { timestamp, .. } => *timestamp,
        }
    }

    fn pattern_name(&self) -> &str {
        match self {
            BulkheadEvent::CallQueued { pattern_name, .. }
            | BulkheadEvent::CallRejected { pattern_name, .. } => pattern_name,
        }
    }
}
