//! In-memory reference adapter.
//!
//! Backs the whole [`Coordinator`] surface with process-local maps. State
//! is shared between every handle attached to the same backend, which is
//! how tests simulate a fleet: `attach("node-2")` yields a second handle
//! with its own identity over the same data.

use crate::{
    Coordinator, CoordinatorError, ElectionOutcome, ElectionRequest, ElectionStatus,
    LeadershipCallback, LockGrant, LockHandle, LockRequest, LockStatus, SubscriberFn,
    Subscription, Value,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::Notify;

struct LockEntry {
    token: u64,
    expires_at: Instant,
}

struct ElectionEntry {
    leader_id: String,
    expires_at: Instant,
    on_lose: Option<LeadershipCallback>,
}

#[derive(Default)]
struct Backend {
    state: Mutex<HashMap<String, Value>>,
    counters: Mutex<HashMap<String, i64>>,
    locks: Mutex<HashMap<String, LockEntry>>,
    subscribers: Mutex<HashMap<String, Vec<(u64, SubscriberFn)>>>,
    elections: Mutex<HashMap<String, ElectionEntry>>,
    next_id: AtomicU64,
    lock_released: Notify,
}

/// The in-memory [`Coordinator`].
#[derive(Clone)]
pub struct MemoryCoordinator {
    backend: Arc<Backend>,
    namespace: String,
    node_id: String,
}

impl MemoryCoordinator {
    pub fn new(namespace: impl Into<String>) -> Self {
        static NODE_SEQ: AtomicU64 = AtomicU64::new(0);
        let node_id = format!(
            "node-{}-{}",
            std::process::id(),
            NODE_SEQ.fetch_add(1, Ordering::SeqCst)
        );
        Self {
            backend: Arc::new(Backend::default()),
            namespace: namespace.into(),
            node_id,
        }
    }

    /// A second handle over the same backend with its own node identity.
    pub fn attach(&self, node_id: impl Into<String>) -> Self {
        Self {
            backend: Arc::clone(&self.backend),
            namespace: self.namespace.clone(),
            node_id: node_id.into(),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    fn key(&self, key: &str) -> String {
        format!("{}:{}", self.namespace, key)
    }

    fn next_id(&self) -> u64 {
        self.backend.next_id.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn try_take_lock(&self, resource: &str, ttl: Duration) -> Option<LockHandle> {
        let mut locks = self.backend.locks.lock().unwrap();
        let now = Instant::now();
        match locks.get(resource) {
            Some(entry) if entry.expires_at > now => None,
            _ => {
                let token = self.next_id();
                locks.insert(
                    resource.to_string(),
                    LockEntry {
                        token,
                        expires_at: now + ttl,
                    },
                );
                Some(LockHandle {
                    resource: resource.to_string(),
                    token,
                })
            }
        }
    }

    /// Drop lapsed leaders, firing their loss callbacks outside the lock.
    fn purge_expired_leader(&self, election_key: &str) {
        let lapsed = {
            let mut elections = self.backend.elections.lock().unwrap();
            match elections.get(election_key) {
                Some(entry) if entry.expires_at <= Instant::now() => {
                    elections.remove(election_key)
                }
                _ => None,
            }
        };
        if let Some(entry) = lapsed {
            tracing::info!(
                election = election_key,
                leader = %entry.leader_id,
                "leadership lease lapsed"
            );
            if let Some(on_lose) = entry.on_lose {
                on_lose();
            }
        }
    }
}

#[async_trait]
impl Coordinator for MemoryCoordinator {
    async fn set_state(&self, key: &str, value: Value) -> Result<(), CoordinatorError> {
        self.backend
            .state
            .lock()
            .unwrap()
            .insert(self.key(key), value);
        Ok(())
    }

    async fn get_state(&self, key: &str) -> Result<Option<Value>, CoordinatorError> {
        Ok(self.backend.state.lock().unwrap().get(&self.key(key)).cloned())
    }

    async fn update_state(
        &self,
        key: &str,
        update: Box<dyn FnOnce(Option<Value>) -> Value + Send>,
    ) -> Result<Value, CoordinatorError> {
        let mut state = self.backend.state.lock().unwrap();
        let full_key = self.key(key);
        let current = state.get(&full_key).cloned();
        let next = update(current);
        state.insert(full_key, next.clone());
        Ok(next)
    }

    async fn delete_state(&self, key: &str) -> Result<bool, CoordinatorError> {
        Ok(self
            .backend
            .state
            .lock()
            .unwrap()
            .remove(&self.key(key))
            .is_some())
    }

    async fn increment_counter(&self, key: &str, by: i64) -> Result<i64, CoordinatorError> {
        let mut counters = self.backend.counters.lock().unwrap();
        let counter = counters.entry(self.key(key)).or_insert(0);
        *counter += by;
        Ok(*counter)
    }

    async fn decrement_counter(&self, key: &str, by: i64) -> Result<i64, CoordinatorError> {
        self.increment_counter(key, -by).await
    }

    async fn get_counter(&self, key: &str) -> Result<i64, CoordinatorError> {
        Ok(*self
            .backend
            .counters
            .lock()
            .unwrap()
            .get(&self.key(key))
            .unwrap_or(&0))
    }

    async fn acquire_lock(&self, request: LockRequest) -> Result<LockGrant, CoordinatorError> {
        let resource = self.key(&request.resource);
        let deadline = request.wait_timeout.map(|wait| Instant::now() + wait);

        loop {
            if let Some(handle) = self.try_take_lock(&resource, request.ttl) {
                return Ok(LockGrant {
                    status: LockStatus::Acquired,
                    handle: Some(handle),
                });
            }

            let Some(deadline) = deadline else {
                return Ok(LockGrant {
                    status: LockStatus::Failed,
                    handle: None,
                });
            };
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(LockGrant {
                    status: LockStatus::Failed,
                    handle: None,
                });
            }

            // Wake on release, or poll at least every 10 ms so TTL expiry
            // of the holder is observed.
            let wait = remaining.min(Duration::from_millis(10));
            let notified = self.backend.lock_released.notified();
            let _ = tokio::time::timeout(wait, notified).await;
        }
    }

    async fn release_lock(&self, handle: &LockHandle) -> Result<(), CoordinatorError> {
        let mut locks = self.backend.locks.lock().unwrap();
        if let Some(entry) = locks.get(&handle.resource) {
            if entry.token == handle.token {
                locks.remove(&handle.resource);
            }
        }
        drop(locks);
        self.backend.lock_released.notify_waiters();
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: Value) -> Result<usize, CoordinatorError> {
        let subscribers: Vec<SubscriberFn> = {
            let map = self.backend.subscribers.lock().unwrap();
            map.get(&self.key(topic))
                .map(|list| list.iter().map(|(_, f)| Arc::clone(f)).collect())
                .unwrap_or_default()
        };
        for subscriber in &subscribers {
            subscriber(payload.clone());
        }
        Ok(subscribers.len())
    }

    async fn subscribe(
        &self,
        topic: &str,
        subscriber: SubscriberFn,
    ) -> Result<Subscription, CoordinatorError> {
        let id = self.next_id();
        self.backend
            .subscribers
            .lock()
            .unwrap()
            .entry(self.key(topic))
            .or_default()
            .push((id, subscriber));
        Ok(Subscription {
            topic: topic.to_string(),
            id,
        })
    }

    async fn unsubscribe(&self, subscription: &Subscription) -> Result<(), CoordinatorError> {
        let mut map = self.backend.subscribers.lock().unwrap();
        if let Some(list) = map.get_mut(&self.key(&subscription.topic)) {
            list.retain(|(id, _)| *id != subscription.id);
        }
        Ok(())
    }

    async fn campaign(&self, request: ElectionRequest) -> Result<ElectionOutcome, CoordinatorError> {
        let key = self.key(&request.election_key);
        self.purge_expired_leader(&key);

        {
            let mut elections = self.backend.elections.lock().unwrap();
            if let Some(entry) = elections.get(&key) {
                let leader_id = entry.leader_id.clone();
                return Ok(ElectionOutcome {
                    status: if leader_id == self.node_id {
                        ElectionStatus::Leader
                    } else {
                        ElectionStatus::Follower
                    },
                    leader_id,
                });
            }

            elections.insert(
                key.clone(),
                ElectionEntry {
                    leader_id: self.node_id.clone(),
                    expires_at: Instant::now() + request.ttl,
                    on_lose: request.on_lose_leadership.clone(),
                },
            );
        }

        // Heartbeat renews the lease until resignation or loss.
        let backend = Arc::clone(&self.backend);
        let node_id = self.node_id.clone();
        let election_key = key.clone();
        let ttl = request.ttl;
        let interval = request.heartbeat_interval;
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let mut elections = backend.elections.lock().unwrap();
                match elections.get_mut(&election_key) {
                    Some(entry) if entry.leader_id == node_id => {
                        entry.expires_at = Instant::now() + ttl;
                    }
                    _ => break,
                }
            }
        });

        tracing::info!(election = %key, leader = %self.node_id, "became leader");
        if let Some(on_become) = &request.on_become_leader {
            on_become();
        }
        Ok(ElectionOutcome {
            status: ElectionStatus::Leader,
            leader_id: self.node_id.clone(),
        })
    }

    async fn resign(&self, election_key: &str) -> Result<(), CoordinatorError> {
        let key = self.key(election_key);
        let resigned = {
            let mut elections = self.backend.elections.lock().unwrap();
            match elections.get(&key) {
                Some(entry) if entry.leader_id == self.node_id => elections.remove(&key),
                _ => None,
            }
        };
        if let Some(entry) = resigned {
            tracing::info!(election = %key, leader = %self.node_id, "resigned leadership");
            if let Some(on_lose) = entry.on_lose {
                on_lose();
            }
        }
        Ok(())
    }
}
