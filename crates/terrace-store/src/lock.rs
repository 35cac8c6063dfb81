use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::StoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockOperation {
    Plan,
    Apply,
    Destroy,
}

impl std::fmt::Display for LockOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LockOperation::Plan => write!(f, "plan"),
            LockOperation::Apply => write!(f, "apply"),
            LockOperation::Destroy => write!(f, "destroy"),
        }
    }
}

/// Who is asking for a lock and why.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRequest {
    pub holder_id: String,
    pub operation: LockOperation,
    pub info: String,
}

impl LockRequest {
    pub fn new(holder_id: impl Into<String>, operation: LockOperation) -> Self {
        LockRequest {
            holder_id: holder_id.into(),
            operation,
            info: String::new(),
        }
    }

    pub fn with_info(mut self, info: impl Into<String>) -> Self {
        self.info = info.into();
        self
    }
}

/// An exclusive advisory lock on one workspace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lock {
    pub id: Uuid,
    /// Backend key the lock record lives under.
    pub key: String,
    pub workspace: String,
    pub holder_id: String,
    pub acquired_at: DateTime<Utc>,
    pub operation: LockOperation,
    pub info: String,
}

impl Lock {
    pub fn new(key: &str, workspace: &str, request: &LockRequest) -> Self {
        Lock {
            id: Uuid::new_v4(),
            key: key.to_string(),
            workspace: workspace.to_string(),
            holder_id: request.holder_id.clone(),
            acquired_at: Utc::now(),
            operation: request.operation,
            info: request.info.clone(),
        }
    }
}

/// How long `acquire` keeps retrying a held lock. The default fails fast.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcquirePolicy {
    pub timeout: Duration,
    pub backoff: Duration,
}

impl AcquirePolicy {
    pub fn fail_fast() -> Self {
        AcquirePolicy {
            timeout: Duration::ZERO,
            backoff: Duration::from_secs(1),
        }
    }

    pub fn retry_for(timeout: Duration, backoff: Duration) -> Self {
        AcquirePolicy { timeout, backoff }
    }
}

impl Default for AcquirePolicy {
    fn default() -> Self {
        Self::fail_fast()
    }
}

#[async_trait]
pub trait LockManager: Send + Sync + 'static {
    /// Atomically create the lock record under `key`, or fail with
    /// [`StoreError::LockHeld`] carrying the existing record.
    async fn try_acquire(
        &self,
        key: &str,
        workspace: &str,
        request: &LockRequest,
    ) -> Result<Lock, StoreError>;

    /// Remove `lock` if it is still the current lock under its key.
    ///
    /// Idempotent. Releasing a lock that has been replaced or force-unlocked
    /// logs a warning and succeeds.
    async fn release(&self, lock: &Lock) -> Result<(), StoreError>;

    /// Remove the lock with id `lock_id` regardless of its holder.
    ///
    /// Returns the removed record, `None` when no lock was held, and
    /// [`StoreError::LockIdMismatch`] when a different lock is held.
    async fn force_unlock(&self, key: &str, lock_id: Uuid) -> Result<Option<Lock>, StoreError>;

    async fn current(&self, key: &str) -> Result<Option<Lock>, StoreError>;

    /// [`try_acquire`](Self::try_acquire), retried with `policy.backoff`
    /// pauses until `policy.timeout` has elapsed.
    async fn acquire(
        &self,
        key: &str,
        workspace: &str,
        request: &LockRequest,
        policy: &AcquirePolicy,
    ) -> Result<Lock, StoreError> {
        let deadline = tokio::time::Instant::now() + policy.timeout;
        loop {
            match self.try_acquire(key, workspace, request).await {
                Ok(lock) => {
                    info!(workspace, lock_id = %lock.id, operation = %lock.operation, "lock acquired");
                    return Ok(lock);
                }
                Err(StoreError::LockHeld(held)) => {
                    let now = tokio::time::Instant::now();
                    if now >= deadline {
                        return Err(StoreError::LockHeld(held));
                    }
                    debug!(workspace, holder = %held.holder_id, "lock held, retrying");
                    tokio::time::sleep(policy.backoff.min(deadline - now)).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// What a backend should do when asked to release `lock` while `current` is
/// stored under the key. Returns true when the stored record must be removed.
pub(crate) fn release_decision(lock: &Lock, current: Option<&Lock>) -> bool {
    match current {
        Some(held) if held.id == lock.id => {
            info!(workspace = %lock.workspace, lock_id = %lock.id, "lock released");
            true
        }
        Some(held) => {
            warn!(
                workspace = %lock.workspace,
                lock_id = %lock.id,
                current_lock = %held.id,
                current_holder = %held.holder_id,
                "release of a lock this session no longer holds; leaving current lock in place"
            );
            false
        }
        None => {
            warn!(
                workspace = %lock.workspace,
                lock_id = %lock.id,
                "release of a lock that is not held; it may have been force-unlocked"
            );
            false
        }
    }
}

/// Shared force-unlock rule: the caller must name the lock being removed.
pub(crate) fn force_unlock_decision(
    key: &str,
    lock_id: Uuid,
    current: Option<&Lock>,
) -> Result<bool, StoreError> {
    match current {
        Some(held) if held.id == lock_id => {
            warn!(
                workspace = %held.workspace,
                lock_id = %held.id,
                holder = %held.holder_id,
                "force-unlocking state"
            );
            Ok(true)
        }
        Some(held) => Err(StoreError::LockIdMismatch {
            key: key.to_string(),
            requested: lock_id,
            current: held.id,
        }),
        None => Ok(false),
    }
}
