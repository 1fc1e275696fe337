//! Coordinator-backed snapshot storage.

use crate::Coordinator;
use async_trait::async_trait;
use std::sync::Arc;
use steadfast_core::SnapshotStore;

/// Implements the [`SnapshotStore`] seam every primitive persists through
/// on top of a [`Coordinator`]'s state keyspace, so circuit/limiter/cache
/// state is shared by every process on the same backend and prefix.
pub struct CoordinatorStore {
    coordinator: Arc<dyn Coordinator>,
    prefix: String,
}

impl CoordinatorStore {
    pub fn new(coordinator: Arc<dyn Coordinator>, prefix: impl Into<String>) -> Self {
        Self {
            coordinator,
            prefix: prefix.into(),
        }
    }

    fn key(&self, key: &str) -> String {
        format!("{}:{}", self.prefix, key)
    }
}

#[async_trait]
impl SnapshotStore for CoordinatorStore {
    async fn load(&self, key: &str) -> Option<serde_json::Value> {
        match self.coordinator.get_state(&self.key(key)).await {
            Ok(value) => value,
            Err(error) => {
                tracing::warn!(key, %error, "snapshot load failed");
                None
            }
        }
    }

    async fn store(&self, key: &str, snapshot: serde_json::Value) {
        if let Err(error) = self.coordinator.set_state(&self.key(key), snapshot).await {
            tracing::warn!(key, %error, "snapshot store failed");
        }
    }
}
