pub mod apply;
pub mod diff;
pub mod error;
pub mod plan;
pub mod reconcile;
pub mod report;

pub use apply::ApplyOptions;
pub use diff::{diff, refresh, AttributeChange, ResourceDiff};
pub use error::ReconcileError;
pub use plan::{build_plan, Plan, PlanEntry, PlanSummary, PLAN_FORMAT_VERSION};
pub use reconcile::{PlanOptions, Reconciler, ReconcilerSettings, Session};
pub use report::{ApplyOutcome, ApplyReport, NodeOutcome, NodeStatus};
