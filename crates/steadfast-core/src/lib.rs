//! Shared plumbing for the steadfast resilience runtime.
//!
//! Everything in this crate is pattern-agnostic: the kind-classified
//! [`OperationError`], the [`ExecutionContext`] that travels with every
//! operation and hook, the typed event system, cooperative cancellation,
//! and the [`SnapshotStore`] seam that lets primitives persist their state
//! through a distributed coordinator.

mod cancel;
mod context;
mod error;
mod events;
mod persistence;

pub use cancel::CancelToken;
pub use context::ExecutionContext;
pub use error::{ConfigError, ErrorKind, OperationError};
pub use events::{BoxedEventListener, EventListener, EventListeners, FnListener, PatternEvent};
pub use persistence::{Debouncer, SnapshotStore};
