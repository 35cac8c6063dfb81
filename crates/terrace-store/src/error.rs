use thiserror::Error;
use uuid::Uuid;

use crate::lock::Lock;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("workspace not found: {0}")]
    WorkspaceNotFound(String),

    #[error("invalid workspace name '{0}': only ASCII letters, digits, '-' and '_' are allowed")]
    InvalidWorkspaceName(String),

    #[error("workspace '{0}' is the active workspace; select another workspace before deleting it")]
    WorkspaceActive(String),

    #[error("the default workspace cannot be deleted")]
    DefaultWorkspace,

    #[error("workspace '{name}' still manages {resources} resource(s); pass force to delete it anyway")]
    WorkspaceNotEmpty { name: String, resources: usize },

    #[error("state conflict on '{key}': expected serial {expected}, found {actual}; re-plan against the latest state")]
    Conflict {
        key: String,
        expected: u64,
        actual: u64,
    },

    #[error("lineage mismatch on '{key}': state belongs to lineage {actual}, write carried {expected}")]
    LineageMismatch {
        key: String,
        expected: String,
        actual: String,
    },

    #[error(
        "state '{}' is locked by {} (lock {}, operation {}, acquired {}): {}",
        .0.key, .0.holder_id, .0.id, .0.operation, .0.acquired_at, .0.info
    )]
    LockHeld(Box<Lock>),

    #[error("lock id mismatch on '{key}': requested {requested}, current lock is {current}")]
    LockIdMismatch {
        key: String,
        requested: Uuid,
        current: Uuid,
    },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("internal store error: {0}")]
    Internal(String),
}
