use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("graph validation error: {0}")]
    Graph(#[from] terrace_graph::GraphError),

    #[error("store error: {0}")]
    Store(#[from] terrace_store::StoreError),

    #[error("provider error: {0}")]
    Provider(#[from] terrace_provider::ProviderError),

    #[error(
        "stale plan for workspace '{workspace}': planned against {planned_lineage}@{planned_serial}, \
         state is now {current_lineage}@{current_serial}; re-plan against the latest state"
    )]
    StalePlan {
        workspace: String,
        planned_lineage: String,
        planned_serial: u64,
        current_lineage: String,
        current_serial: u64,
    },

    #[error("plan was computed for workspace '{planned}', not '{requested}'")]
    WrongWorkspace { planned: String, requested: String },

    #[error("invalid plan: {0}")]
    InvalidPlan(String),

    #[error("internal error: {0}")]
    Internal(String),
}
