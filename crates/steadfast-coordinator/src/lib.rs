//! Distributed coordinator abstraction.
//!
//! A [`Coordinator`] exposes the primitives a fleet needs to share
//! resilience state: a namespaced key/value space, atomic counters, TTL
//! locks, pub/sub and leader election. The in-memory
//! [`MemoryCoordinator`] is the reference adapter and what tests run
//! against; real backends implement the same trait. [`CoordinatorStore`]
//! bridges a coordinator into the [`SnapshotStore`] seam every resilience
//! primitive persists through, and [`InfraBundle`] wires a namespace's
//! primitives to one backend in a single step.

mod bundle;
mod memory;
mod store;

pub use bundle::{InfraBundle, InfraBundleBuilder};
pub use memory::MemoryCoordinator;
pub use store::CoordinatorStore;

use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Opaque JSON payloads, matching the rest of the runtime.
pub type Value = serde_json::Value;

/// Coordinator failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CoordinatorError {
    /// The backend is unreachable. Calls that need it are fatal.
    #[error("coordinator disconnected: {0}")]
    Disconnected(String),
    /// Backend-specific failure.
    #[error("coordinator backend error: {0}")]
    Backend(String),
    /// `with_lock` could not acquire the resource.
    #[error("lock on '{0}' unavailable")]
    LockUnavailable(String),
}

/// Handle proving lock ownership; release is keyed on it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockHandle {
    pub resource: String,
    pub token: u64,
}

/// Lock acquisition parameters.
#[derive(Debug, Clone)]
pub struct LockRequest {
    pub resource: String,
    /// Lease length; the lock self-releases when it expires.
    pub ttl: Duration,
    /// How long to queue for the lock. `None` means fail fast.
    pub wait_timeout: Option<Duration>,
}

impl LockRequest {
    pub fn new(resource: impl Into<String>, ttl: Duration) -> Self {
        Self {
            resource: resource.into(),
            ttl,
            wait_timeout: None,
        }
    }

    pub fn wait_up_to(mut self, timeout: Duration) -> Self {
        self.wait_timeout = Some(timeout);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockStatus {
    Acquired,
    Failed,
}

/// Outcome of a lock attempt.
#[derive(Debug, Clone)]
pub struct LockGrant {
    pub status: LockStatus,
    pub handle: Option<LockHandle>,
}

/// Topic subscriber callback.
pub type SubscriberFn = Arc<dyn Fn(Value) + Send + Sync>;

/// Handle for unsubscribing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub topic: String,
    pub id: u64,
}

/// Leadership callbacks.
pub type LeadershipCallback = Arc<dyn Fn() + Send + Sync>;

/// Leader-election parameters.
#[derive(Clone)]
pub struct ElectionRequest {
    pub election_key: String,
    /// Leadership lease; without heartbeats it lapses after this long.
    pub ttl: Duration,
    pub heartbeat_interval: Duration,
    pub on_become_leader: Option<LeadershipCallback>,
    pub on_lose_leadership: Option<LeadershipCallback>,
}

impl ElectionRequest {
    pub fn new(election_key: impl Into<String>, ttl: Duration) -> Self {
        let ttl_half = ttl / 2;
        Self {
            election_key: election_key.into(),
            ttl,
            heartbeat_interval: ttl_half.max(Duration::from_millis(10)),
            on_become_leader: None,
            on_lose_leadership: None,
        }
    }

    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn on_become_leader<F: Fn() + Send + Sync + 'static>(mut self, f: F) -> Self {
        self.on_become_leader = Some(Arc::new(f));
        self
    }

    pub fn on_lose_leadership<F: Fn() + Send + Sync + 'static>(mut self, f: F) -> Self {
        self.on_lose_leadership = Some(Arc::new(f));
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElectionStatus {
    Leader,
    Follower,
}

/// Outcome of a leadership campaign.
#[derive(Debug, Clone)]
pub struct ElectionOutcome {
    pub status: ElectionStatus,
    /// Who currently leads (possibly the caller).
    pub leader_id: String,
}

/// The pluggable backend surface.
///
/// All keys are namespaced by the adapter; callers use logical names.
#[async_trait]
pub trait Coordinator: Send + Sync {
    async fn set_state(&self, key: &str, value: Value) -> Result<(), CoordinatorError>;
    async fn get_state(&self, key: &str) -> Result<Option<Value>, CoordinatorError>;
    /// Atomically transform a key's value. The closure sees the current
    /// value (if any) and returns the replacement, which is also handed
    /// back to the caller.
    async fn update_state(
        &self,
        key: &str,
        update: Box<dyn FnOnce(Option<Value>) -> Value + Send>,
    ) -> Result<Value, CoordinatorError>;
    async fn delete_state(&self, key: &str) -> Result<bool, CoordinatorError>;

    async fn increment_counter(&self, key: &str, by: i64) -> Result<i64, CoordinatorError>;
    async fn decrement_counter(&self, key: &str, by: i64) -> Result<i64, CoordinatorError>;
    async fn get_counter(&self, key: &str) -> Result<i64, CoordinatorError>;

    async fn acquire_lock(&self, request: LockRequest) -> Result<LockGrant, CoordinatorError>;
    /// Idempotent: releasing an expired or already-released handle is Ok.
    async fn release_lock(&self, handle: &LockHandle) -> Result<(), CoordinatorError>;

    /// Deliver a payload to every subscriber of the topic; returns how
    /// many were notified.
    async fn publish(&self, topic: &str, payload: Value) -> Result<usize, CoordinatorError>;
    async fn subscribe(
        &self,
        topic: &str,
        subscriber: SubscriberFn,
    ) -> Result<Subscription, CoordinatorError>;
    async fn unsubscribe(&self, subscription: &Subscription) -> Result<(), CoordinatorError>;

    async fn campaign(&self, request: ElectionRequest) -> Result<ElectionOutcome, CoordinatorError>;
    /// Idempotent: resigning a leadership not held is Ok.
    async fn resign(&self, election_key: &str) -> Result<(), CoordinatorError>;
}

/// Run `f` under a lock, releasing it whatever `f` does.
///
/// Fails with [`CoordinatorError::LockUnavailable`] when the lock cannot
/// be acquired within the request's wait budget.
pub async fn with_lock<C, F, Fut, R>(
    coordinator: &C,
    request: LockRequest,
    f: F,
) -> Result<R, CoordinatorError>
where
    C: Coordinator + ?Sized,
    F: FnOnce() -> Fut,
    Fut: Future<Output = R>,
{
    let resource = request.resource.clone();
    let grant = coordinator.acquire_lock(request).await?;
    let Some(handle) = grant.handle else {
        return Err(CoordinatorError::LockUnavailable(resource));
    };

    let output = f().await;
    coordinator.release_lock(&handle).await?;
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn with_lock_releases_after_the_closure() {
        let coordinator = MemoryCoordinator::new("test");
        let value = with_lock(
            &coordinator,
            LockRequest::new("resource", Duration::from_secs(5)),
            || async { 42 },
        )
        .await
        .unwrap();
        assert_eq!(value, 42);

        // Lock must be free again.
        let grant = coordinator
            .acquire_lock(LockRequest::new("resource", Duration::from_secs(5)))
            .await
            .unwrap();
        assert_eq!(grant.status, LockStatus::Acquired);
    }

    #[tokio::test]
    async fn with_lock_reports_unavailable_locks() {
        let coordinator = MemoryCoordinator::new("test");
        let held = coordinator
            .acquire_lock(LockRequest::new("busy", Duration::from_secs(60)))
            .await
            .unwrap();
        assert_eq!(held.status, LockStatus::Acquired);

        let err = with_lock(
            &coordinator,
            LockRequest::new("busy", Duration::from_secs(60)),
            || async { () },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, CoordinatorError::LockUnavailable(_)));
    }
}
