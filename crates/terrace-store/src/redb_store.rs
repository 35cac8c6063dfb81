use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use redb::{Database, ReadableTable, TableDefinition};
use uuid::Uuid;

use crate::error::StoreError;
use crate::lock::{force_unlock_decision, release_decision, Lock, LockManager, LockRequest};
use crate::state::{prepare_write, StateSnapshot};
use crate::store::StateStore;

const SNAPSHOTS: TableDefinition<&str, &[u8]> = TableDefinition::new("snapshots");
const LOCKS: TableDefinition<&str, &[u8]> = TableDefinition::new("locks");

fn internal<E: std::fmt::Display>(e: E) -> StoreError {
    StoreError::Internal(e.to_string())
}

/// Local-file backend on a redb database.
///
/// Every write and every lock acquisition runs in one redb write transaction;
/// redb serialises write transactions, which makes the serial compare-and-swap
/// and the lock's conditional put atomic for all handles on the same file.
#[derive(Clone)]
pub struct RedbStore {
    db: Arc<Database>,
}

impl RedbStore {
    /// Open (or create) a redb database at `path`.
    ///
    /// Parent directories are created automatically.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(internal)?;
        }
        let db = Database::create(path).map_err(internal)?;

        // Ensure tables exist
        {
            let wtxn = db.begin_write().map_err(internal)?;
            wtxn.open_table(SNAPSHOTS).map_err(internal)?;
            wtxn.open_table(LOCKS).map_err(internal)?;
            wtxn.commit().map_err(internal)?;
        }

        Ok(Self { db: Arc::new(db) })
    }

    fn read_lock(&self, key: &str) -> Result<Option<Lock>, StoreError> {
        let rtxn = self.db.begin_read().map_err(internal)?;
        let table = rtxn.open_table(LOCKS).map_err(internal)?;
        let lock = table
            .get(key)
            .map_err(internal)?
            .map(|g| serde_json::from_slice::<Lock>(g.value()))
            .transpose()?;
        Ok(lock)
    }
}

#[async_trait]
impl StateStore for RedbStore {
    async fn read(&self, key: &str) -> Result<Option<StateSnapshot>, StoreError> {
        let rtxn = self.db.begin_read().map_err(internal)?;
        let table = rtxn.open_table(SNAPSHOTS).map_err(internal)?;
        let snapshot = table
            .get(key)
            .map_err(internal)?
            .map(|g| serde_json::from_slice::<StateSnapshot>(g.value()))
            .transpose()?;
        Ok(snapshot)
    }

    async fn write(
        &self,
        key: &str,
        snapshot: &StateSnapshot,
        expected_serial: u64,
    ) -> Result<u64, StoreError> {
        let wtxn = self.db.begin_write().map_err(internal)?;
        let serial = {
            let mut table = wtxn.open_table(SNAPSHOTS).map_err(internal)?;
            let current = table
                .get(key)
                .map_err(internal)?
                .map(|g| serde_json::from_slice::<StateSnapshot>(g.value()))
                .transpose()?;
            match prepare_write(key, current.as_ref(), snapshot, expected_serial)? {
                Some(next) => {
                    let bytes = serde_json::to_vec(&next)?;
                    table.insert(key, bytes.as_slice()).map_err(internal)?;
                    next.serial
                }
                None => expected_serial,
            }
        };
        wtxn.commit().map_err(internal)?;
        Ok(serial)
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let wtxn = self.db.begin_write().map_err(internal)?;
        {
            let mut table = wtxn.open_table(SNAPSHOTS).map_err(internal)?;
            table.remove(key).map_err(internal)?;
        }
        wtxn.commit().map_err(internal)?;
        Ok(())
    }

    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let rtxn = self.db.begin_read().map_err(internal)?;
        let table = rtxn.open_table(SNAPSHOTS).map_err(internal)?;
        let mut keys = Vec::new();
        for entry in table.iter().map_err(internal)? {
            let (k, _v) = entry.map_err(internal)?;
            if k.value().starts_with(prefix) {
                keys.push(k.value().to_string());
            }
        }
        Ok(keys)
    }
}

#[async_trait]
impl LockManager for RedbStore {
    async fn try_acquire(
        &self,
        key: &str,
        workspace: &str,
        request: &LockRequest,
    ) -> Result<Lock, StoreError> {
        let wtxn = self.db.begin_write().map_err(internal)?;
        let lock = {
            let mut table = wtxn.open_table(LOCKS).map_err(internal)?;
            let held = table
                .get(key)
                .map_err(internal)?
                .map(|g| serde_json::from_slice::<Lock>(g.value()))
                .transpose()?;
            if let Some(held) = held {
                return Err(StoreError::LockHeld(Box::new(held)));
            }
            let lock = Lock::new(key, workspace, request);
            let bytes = serde_json::to_vec(&lock)?;
            table.insert(key, bytes.as_slice()).map_err(internal)?;
            lock
        };
        wtxn.commit().map_err(internal)?;
        Ok(lock)
    }

    async fn release(&self, lock: &Lock) -> Result<(), StoreError> {
        let wtxn = self.db.begin_write().map_err(internal)?;
        {
            let mut table = wtxn.open_table(LOCKS).map_err(internal)?;
            let held = table
                .get(lock.key.as_str())
                .map_err(internal)?
                .map(|g| serde_json::from_slice::<Lock>(g.value()))
                .transpose()?;
            if release_decision(lock, held.as_ref()) {
                table.remove(lock.key.as_str()).map_err(internal)?;
            }
        }
        wtxn.commit().map_err(internal)?;
        Ok(())
    }

    async fn force_unlock(&self, key: &str, lock_id: Uuid) -> Result<Option<Lock>, StoreError> {
        let wtxn = self.db.begin_write().map_err(internal)?;
        let removed = {
            let mut table = wtxn.open_table(LOCKS).map_err(internal)?;
            let held = table
                .get(key)
                .map_err(internal)?
                .map(|g| serde_json::from_slice::<Lock>(g.value()))
                .transpose()?;
            if force_unlock_decision(key, lock_id, held.as_ref())? {
                table.remove(key).map_err(internal)?;
                held
            } else {
                None
            }
        };
        wtxn.commit().map_err(internal)?;
        Ok(removed)
    }

    async fn current(&self, key: &str) -> Result<Option<Lock>, StoreError> {
        self.read_lock(key)
    }
}
