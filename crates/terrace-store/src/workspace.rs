use std::sync::Arc;

use terrace_domain::types::is_identifier;
use tracing::{info, warn};

use crate::error::StoreError;
use crate::lock::{AcquirePolicy, Lock, LockOperation, LockRequest};
use crate::state::StateSnapshot;
use crate::Backend;

pub const DEFAULT_WORKSPACE: &str = "default";

/// Where a workspace's snapshot and lock live inside the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkspaceKey {
    pub name: String,
    pub state_key: String,
    pub lock_key: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkspaceConfig {
    /// Every workspace lives under `<key_prefix>/<name>/`.
    pub key_prefix: String,
    /// Object name of the snapshot inside a workspace prefix.
    pub state_key: String,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        WorkspaceConfig {
            key_prefix: "workspaces".into(),
            state_key: "terrace.state".into(),
        }
    }
}

/// Routes every operation for a named environment to its own key prefix on a
/// shared backend.
pub struct WorkspaceManager {
    backend: Arc<dyn Backend>,
    config: WorkspaceConfig,
    active: String,
}

impl WorkspaceManager {
    pub fn new(backend: Arc<dyn Backend>, config: WorkspaceConfig) -> Self {
        WorkspaceManager {
            backend,
            config,
            active: DEFAULT_WORKSPACE.to_string(),
        }
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    pub fn active(&self) -> &str {
        &self.active
    }

    pub fn key(&self, name: &str) -> Result<WorkspaceKey, StoreError> {
        if !is_identifier(name) {
            return Err(StoreError::InvalidWorkspaceName(name.to_string()));
        }
        let state_key = format!("{}/{}/{}", self.config.key_prefix, name, self.config.state_key);
        Ok(WorkspaceKey {
            name: name.to_string(),
            lock_key: format!("{state_key}.lock"),
            state_key,
        })
    }

    /// Create `name` with an empty snapshot on a fresh lineage. Creating a
    /// workspace that already exists does nothing.
    pub async fn create(&self, name: &str) -> Result<WorkspaceKey, StoreError> {
        let key = self.key(name)?;
        if self.backend.read(&key.state_key).await?.is_some() {
            return Ok(key);
        }
        match self.backend.write(&key.state_key, &StateSnapshot::fresh(), 0).await {
            Ok(_) => {
                info!(workspace = name, "workspace created");
                Ok(key)
            }
            // Someone else created it first.
            Err(StoreError::Conflict { .. }) => Ok(key),
            Err(e) => Err(e),
        }
    }

    pub async fn exists(&self, name: &str) -> Result<bool, StoreError> {
        if name == DEFAULT_WORKSPACE {
            return Ok(true);
        }
        let key = self.key(name)?;
        Ok(self.backend.read(&key.state_key).await?.is_some())
    }

    /// Workspace names, sorted; `default` is always present.
    pub async fn list(&self) -> Result<Vec<String>, StoreError> {
        let prefix = format!("{}/", self.config.key_prefix);
        let suffix = format!("/{}", self.config.state_key);
        let mut names: Vec<String> = self
            .backend
            .list_keys(&prefix)
            .await?
            .into_iter()
            .filter_map(|k| {
                k.strip_prefix(&prefix)
                    .and_then(|rest| rest.strip_suffix(&suffix))
                    .filter(|name| is_identifier(name))
                    .map(str::to_string)
            })
            .collect();
        if !names.iter().any(|n| n == DEFAULT_WORKSPACE) {
            names.push(DEFAULT_WORKSPACE.to_string());
        }
        names.sort();
        Ok(names)
    }

    pub async fn select(&mut self, name: &str) -> Result<(), StoreError> {
        if !self.exists(name).await? {
            return Err(StoreError::WorkspaceNotFound(name.to_string()));
        }
        self.active = name.to_string();
        Ok(())
    }

    /// Current snapshot of `name`. The default workspace is created on first use.
    pub async fn read(&self, name: &str) -> Result<StateSnapshot, StoreError> {
        let key = self.key(name)?;
        if let Some(snapshot) = self.backend.read(&key.state_key).await? {
            return Ok(snapshot);
        }
        if name != DEFAULT_WORKSPACE {
            return Err(StoreError::WorkspaceNotFound(name.to_string()));
        }
        self.create(name).await?;
        self.backend
            .read(&key.state_key)
            .await?
            .ok_or_else(|| StoreError::WorkspaceNotFound(name.to_string()))
    }

    pub async fn write(
        &self,
        name: &str,
        snapshot: &StateSnapshot,
        expected_serial: u64,
    ) -> Result<u64, StoreError> {
        let key = self.key(name)?;
        self.backend
            .write(&key.state_key, snapshot, expected_serial)
            .await
    }

    pub async fn lock(
        &self,
        name: &str,
        request: &LockRequest,
        policy: &AcquirePolicy,
    ) -> Result<Lock, StoreError> {
        let key = self.key(name)?;
        self.backend.acquire(&key.lock_key, name, request, policy).await
    }

    pub async fn unlock(&self, lock: &Lock) -> Result<(), StoreError> {
        self.backend.release(lock).await
    }

    pub async fn current_lock(&self, name: &str) -> Result<Option<Lock>, StoreError> {
        let key = self.key(name)?;
        self.backend.current(&key.lock_key).await
    }

    /// Explicit operator override of another holder's lock.
    pub async fn force_unlock(&self, name: &str, lock_id: uuid::Uuid) -> Result<Option<Lock>, StoreError> {
        let key = self.key(name)?;
        self.backend.force_unlock(&key.lock_key, lock_id).await
    }

    /// Delete `name` and its snapshot.
    ///
    /// The active workspace and `default` cannot be deleted. A workspace that
    /// still tracks resources is only deleted with `force`.
    pub async fn delete(&self, name: &str, holder_id: &str, force: bool) -> Result<(), StoreError> {
        if name == DEFAULT_WORKSPACE {
            return Err(StoreError::DefaultWorkspace);
        }
        if name == self.active {
            return Err(StoreError::WorkspaceActive(name.to_string()));
        }
        let key = self.key(name)?;
        let request = LockRequest::new(holder_id, LockOperation::Destroy).with_info("workspace delete");
        let lock = self.lock(name, &request, &AcquirePolicy::fail_fast()).await?;

        // The emptiness check must see the snapshot as of the held lock.
        let result = match self.backend.read(&key.state_key).await {
            Ok(None) => Err(StoreError::WorkspaceNotFound(name.to_string())),
            Ok(Some(snapshot)) if !snapshot.is_empty() && !force => Err(StoreError::WorkspaceNotEmpty {
                name: name.to_string(),
                resources: snapshot.resource_count(),
            }),
            Ok(Some(_)) => self.backend.delete(&key.state_key).await,
            Err(e) => Err(e),
        };

        if let Err(e) = self.unlock(&lock).await {
            warn!(workspace = name, lock_id = %lock.id, error = %e, "failed to release lock");
        }
        if result.is_ok() {
            info!(workspace = name, "workspace deleted");
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::LockManager;
    use crate::memory::InMemoryStore;
    use crate::state::StateEntity;
    use crate::store::StateStore;
    use async_trait::async_trait;
    use terrace_domain::{Address, Attributes};

    fn manager() -> WorkspaceManager {
        WorkspaceManager::new(Arc::new(InMemoryStore::new()), WorkspaceConfig::default())
    }

    #[test]
    fn keys_are_isolated_per_workspace() {
        let mgr = manager();
        let dev = mgr.key("dev").unwrap();
        let prod = mgr.key("prod").unwrap();
        assert_eq!(dev.state_key, "workspaces/dev/terrace.state");
        assert_eq!(dev.lock_key, "workspaces/dev/terrace.state.lock");
        assert_ne!(dev.state_key, prod.state_key);
        assert!(mgr.key("../etc").is_err());
    }

    #[tokio::test]
    async fn create_is_idempotent() {
        let mgr = manager();
        mgr.create("dev").await.unwrap();
        let first = mgr.read("dev").await.unwrap();
        mgr.create("dev").await.unwrap();
        let second = mgr.read("dev").await.unwrap();
        assert_eq!(first.lineage, second.lineage);
        assert_eq!(first.serial, second.serial);
    }

    #[tokio::test]
    async fn default_workspace_is_implicit() {
        let mgr = manager();
        assert_eq!(mgr.list().await.unwrap(), vec!["default"]);
        let snap = mgr.read(DEFAULT_WORKSPACE).await.unwrap();
        assert!(snap.is_empty());
        assert!(matches!(
            mgr.read("missing").await,
            Err(StoreError::WorkspaceNotFound(_))
        ));
    }

    #[tokio::test]
    async fn list_and_select() {
        let mut mgr = manager();
        mgr.create("staging").await.unwrap();
        mgr.create("dev").await.unwrap();
        assert_eq!(mgr.list().await.unwrap(), vec!["default", "dev", "staging"]);

        mgr.select("dev").await.unwrap();
        assert_eq!(mgr.active(), "dev");
        assert!(mgr.select("nope").await.is_err());
    }

    #[tokio::test]
    async fn active_workspace_cannot_be_deleted() {
        let mut mgr = manager();
        mgr.create("dev").await.unwrap();
        mgr.select("dev").await.unwrap();
        assert!(matches!(
            mgr.delete("dev", "me", true).await,
            Err(StoreError::WorkspaceActive(_))
        ));
        assert!(matches!(
            mgr.delete(DEFAULT_WORKSPACE, "me", true).await,
            Err(StoreError::DefaultWorkspace)
        ));
    }

    #[tokio::test]
    async fn non_empty_workspace_needs_force() {
        let mgr = manager();
        mgr.create("dev").await.unwrap();
        let mut snap = mgr.read("dev").await.unwrap();
        let serial = snap.serial;
        snap.upsert(StateEntity::new(Address::new("host", "a"), "local", Attributes::new()));
        mgr.write("dev", &snap, serial).await.unwrap();

        assert!(matches!(
            mgr.delete("dev", "me", false).await,
            Err(StoreError::WorkspaceNotEmpty { resources: 1, .. })
        ));
        // the refused delete released its lock
        assert!(mgr.current_lock("dev").await.unwrap().is_none());

        mgr.delete("dev", "me", true).await.unwrap();
        assert_eq!(mgr.list().await.unwrap(), vec!["default"]);
    }

    #[tokio::test]
    async fn delete_refuses_locked_workspace() {
        let mgr = manager();
        mgr.create("dev").await.unwrap();
        let _held = mgr
            .lock("dev", &LockRequest::new("other", LockOperation::Apply), &AcquirePolicy::fail_fast())
            .await
            .unwrap();
        assert!(matches!(
            mgr.delete("dev", "me", true).await,
            Err(StoreError::LockHeld(_))
        ));
    }

    /// Lets another session land a write while the lock is being granted,
    /// and optionally fails every release.
    struct Interleaved {
        inner: InMemoryStore,
        write_on_acquire: bool,
        fail_release: bool,
    }

    #[async_trait]
    impl StateStore for Interleaved {
        async fn read(&self, key: &str) -> Result<Option<StateSnapshot>, StoreError> {
            self.inner.read(key).await
        }

        async fn write(
            &self,
            key: &str,
            snapshot: &StateSnapshot,
            expected_serial: u64,
        ) -> Result<u64, StoreError> {
            self.inner.write(key, snapshot, expected_serial).await
        }

        async fn delete(&self, key: &str) -> Result<(), StoreError> {
            self.inner.delete(key).await
        }

        async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
            self.inner.list_keys(prefix).await
        }
    }

    #[async_trait]
    impl LockManager for Interleaved {
        async fn try_acquire(
            &self,
            key: &str,
            workspace: &str,
            request: &LockRequest,
        ) -> Result<Lock, StoreError> {
            if self.write_on_acquire {
                let state_key = key.trim_end_matches(".lock");
                if let Some(mut snap) = self.inner.read(state_key).await? {
                    let serial = snap.serial;
                    snap.upsert(StateEntity::new(Address::new("host", "a"), "local", Attributes::new()));
                    self.inner.write(state_key, &snap, serial).await?;
                }
            }
            self.inner.try_acquire(key, workspace, request).await
        }

        async fn release(&self, lock: &Lock) -> Result<(), StoreError> {
            if self.fail_release {
                return Err(StoreError::Internal("lock table unavailable".into()));
            }
            self.inner.release(lock).await
        }

        async fn force_unlock(&self, key: &str, lock_id: uuid::Uuid) -> Result<Option<Lock>, StoreError> {
            self.inner.force_unlock(key, lock_id).await
        }

        async fn current(&self, key: &str) -> Result<Option<Lock>, StoreError> {
            self.inner.current(key).await
        }
    }

    fn interleaved(write_on_acquire: bool, fail_release: bool) -> WorkspaceManager {
        let backend = Interleaved {
            inner: InMemoryStore::new(),
            write_on_acquire,
            fail_release,
        };
        WorkspaceManager::new(Arc::new(backend), WorkspaceConfig::default())
    }

    #[tokio::test]
    async fn delete_checks_emptiness_under_the_lock() {
        let mgr = interleaved(true, false);
        mgr.create("dev").await.unwrap();
        assert!(mgr.read("dev").await.unwrap().is_empty());

        assert!(matches!(
            mgr.delete("dev", "me", false).await,
            Err(StoreError::WorkspaceNotEmpty { resources: 1, .. })
        ));
        assert!(mgr.exists("dev").await.unwrap());
    }

    #[tokio::test]
    async fn release_failure_keeps_the_delete_error() {
        let mgr = interleaved(false, true);
        mgr.create("dev").await.unwrap();
        let mut snap = mgr.read("dev").await.unwrap();
        let serial = snap.serial;
        snap.upsert(StateEntity::new(Address::new("host", "a"), "local", Attributes::new()));
        mgr.write("dev", &snap, serial).await.unwrap();

        assert!(matches!(
            mgr.delete("dev", "me", false).await,
            Err(StoreError::WorkspaceNotEmpty { .. })
        ));
    }
}
