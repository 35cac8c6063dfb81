use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::StoreError;
use crate::lock::{force_unlock_decision, release_decision, Lock, LockManager, LockRequest};
use crate::state::{prepare_write, StateSnapshot};
use crate::store::StateStore;

#[derive(Debug, Default)]
struct Inner {
    snapshots: HashMap<String, StateSnapshot>,
    locks: HashMap<String, Lock>,
}

/// In-memory implementation of [`StateStore`] and [`LockManager`].
///
/// All data is lost on process exit. Suitable for tests and dry runs.
#[derive(Debug, Clone, Default)]
pub struct InMemoryStore {
    inner: Arc<RwLock<Inner>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for InMemoryStore {
    async fn read(&self, key: &str) -> Result<Option<StateSnapshot>, StoreError> {
        let guard = self.inner.read().await;
        Ok(guard.snapshots.get(key).cloned())
    }

    async fn write(
        &self,
        key: &str,
        snapshot: &StateSnapshot,
        expected_serial: u64,
    ) -> Result<u64, StoreError> {
        let mut guard = self.inner.write().await;
        let prepared = prepare_write(key, guard.snapshots.get(key), snapshot, expected_serial)?;
        match prepared {
            Some(next) => {
                let serial = next.serial;
                guard.snapshots.insert(key.to_string(), next);
                Ok(serial)
            }
            None => Ok(expected_serial),
        }
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let mut guard = self.inner.write().await;
        guard.snapshots.remove(key);
        Ok(())
    }

    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let guard = self.inner.read().await;
        let mut keys: Vec<String> = guard
            .snapshots
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }
}

#[async_trait]
impl LockManager for InMemoryStore {
    async fn try_acquire(
        &self,
        key: &str,
        workspace: &str,
        request: &LockRequest,
    ) -> Result<Lock, StoreError> {
        let mut guard = self.inner.write().await;
        if let Some(held) = guard.locks.get(key) {
            return Err(StoreError::LockHeld(Box::new(held.clone())));
        }
        let lock = Lock::new(key, workspace, request);
        guard.locks.insert(key.to_string(), lock.clone());
        Ok(lock)
    }

    async fn release(&self, lock: &Lock) -> Result<(), StoreError> {
        let mut guard = self.inner.write().await;
        if release_decision(lock, guard.locks.get(&lock.key)) {
            guard.locks.remove(&lock.key);
        }
        Ok(())
    }

    async fn force_unlock(&self, key: &str, lock_id: Uuid) -> Result<Option<Lock>, StoreError> {
        let mut guard = self.inner.write().await;
        if force_unlock_decision(key, lock_id, guard.locks.get(key))? {
            return Ok(guard.locks.remove(key));
        }
        Ok(None)
    }

    async fn current(&self, key: &str) -> Result<Option<Lock>, StoreError> {
        let guard = self.inner.read().await;
        Ok(guard.locks.get(key).cloned())
    }
}
