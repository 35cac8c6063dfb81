use serde::{Deserialize, Serialize};
use terrace_domain::{Address, ChangeAction};

/// Terminal state of one plan entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Succeeded,
    Failed,
    /// A predecessor failed or was blocked; never started.
    Blocked,
    /// No-op, or not started because the session was cancelled or aborted.
    Skipped,
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeStatus::Succeeded => write!(f, "succeeded"),
            NodeStatus::Failed => write!(f, "failed"),
            NodeStatus::Blocked => write!(f, "blocked"),
            NodeStatus::Skipped => write!(f, "skipped"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeOutcome {
    pub address: Address,
    pub action: ChangeAction,
    pub operation: ChangeAction,
    /// The entry targeted a deposed object.
    pub deposed: bool,
    pub status: NodeStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Overall result of an apply, mapped to the process exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplyOutcome {
    NoChanges,
    Applied,
    Failed,
}

impl ApplyOutcome {
    pub fn exit_code(&self) -> i32 {
        match self {
            ApplyOutcome::NoChanges => 0,
            ApplyOutcome::Applied => 2,
            ApplyOutcome::Failed => 1,
        }
    }
}

/// Complete per-entry result of one apply session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplyReport {
    pub workspace: String,
    /// One outcome per plan entry, in plan order.
    pub outcomes: Vec<NodeOutcome>,
    /// Serial of the last snapshot this session wrote (or read).
    pub serial: u64,
    /// Set when dispatching stopped because the session could no longer write
    /// state safely.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aborted: Option<String>,
    #[serde(default)]
    pub cancelled: bool,
}

impl ApplyReport {
    pub fn outcome(&self) -> ApplyOutcome {
        let changes: Vec<&NodeOutcome> =
            self.outcomes.iter().filter(|o| o.operation.is_change()).collect();
        if changes.is_empty() && self.aborted.is_none() {
            return ApplyOutcome::NoChanges;
        }
        let incomplete = changes.iter().any(|o| o.status != NodeStatus::Succeeded);
        if self.aborted.is_some() || incomplete {
            ApplyOutcome::Failed
        } else {
            ApplyOutcome::Applied
        }
    }

    pub fn with_status(&self, status: NodeStatus) -> Vec<&NodeOutcome> {
        self.outcomes.iter().filter(|o| o.status == status).collect()
    }

    pub fn outcome_for(&self, address: &Address) -> Vec<&NodeOutcome> {
        self.outcomes.iter().filter(|o| &o.address == address).collect()
    }
}
