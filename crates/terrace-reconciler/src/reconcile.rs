use std::collections::BTreeSet;
use std::sync::Arc;

use terrace_domain::{Address, ResourceSpec};
use terrace_graph::{validate_specs, DependencyGraph};
use terrace_provider::ProviderRegistry;
use terrace_store::{
    AcquirePolicy, Lock, LockOperation, LockRequest, StateSnapshot, WorkspaceManager,
};
use tracing::{debug, info, warn};

use crate::apply::{ApplyOptions, Executor};
use crate::diff::{diff, refresh};
use crate::error::ReconcileError;
use crate::plan::{build_plan, Plan};
use crate::report::ApplyReport;

#[derive(Debug, Clone)]
pub struct ReconcilerSettings {
    pub parallelism: usize,
    pub lock_policy: AcquirePolicy,
    /// Recorded in every lock this reconciler takes.
    pub holder_id: String,
}

impl Default for ReconcilerSettings {
    fn default() -> Self {
        ReconcilerSettings {
            parallelism: 10,
            lock_policy: AcquirePolicy::fail_fast(),
            holder_id: format!("terrace-{}", std::process::id()),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PlanOptions {
    /// Re-read every recorded object through its provider before diffing.
    pub refresh: bool,
}

/// A held workspace lock. Always [`close`](Session::close)d, also on error.
#[derive(Debug)]
pub struct Session {
    lock: Lock,
}

impl Session {
    pub async fn open(
        workspaces: &WorkspaceManager,
        workspace: &str,
        request: &LockRequest,
        policy: &AcquirePolicy,
    ) -> Result<Self, ReconcileError> {
        let lock = workspaces.lock(workspace, request, policy).await?;
        Ok(Session { lock })
    }

    pub fn lock(&self) -> &Lock {
        &self.lock
    }

    pub async fn close(self, workspaces: &WorkspaceManager) {
        if let Err(e) = workspaces.unlock(&self.lock).await {
            warn!(workspace = %self.lock.workspace, lock_id = %self.lock.id, error = %e, "failed to release lock");
        }
    }
}

/// Plans and applies declared resources against one backend.
pub struct Reconciler {
    workspaces: WorkspaceManager,
    providers: Arc<ProviderRegistry>,
    settings: ReconcilerSettings,
}

impl Reconciler {
    pub fn new(
        workspaces: WorkspaceManager,
        providers: Arc<ProviderRegistry>,
        settings: ReconcilerSettings,
    ) -> Self {
        Reconciler {
            workspaces,
            providers,
            settings,
        }
    }

    pub fn workspaces(&self) -> &WorkspaceManager {
        &self.workspaces
    }

    pub fn workspaces_mut(&mut self) -> &mut WorkspaceManager {
        &mut self.workspaces
    }

    pub fn providers(&self) -> &ProviderRegistry {
        &self.providers
    }

    /// Dependency graph of `specs` against the current state, without locking.
    pub async fn graph(
        &self,
        workspace: &str,
        specs: &[ResourceSpec],
    ) -> Result<DependencyGraph, ReconcileError> {
        validate_specs(specs)?;
        let snapshot = self.workspaces.read(workspace).await?;
        Ok(DependencyGraph::build(specs, &snapshot)?)
    }

    /// Compute the plan that would converge `workspace` on `specs`.
    ///
    /// Holds a plan lock only while reading; nothing is written.
    pub async fn plan(
        &self,
        workspace: &str,
        specs: &[ResourceSpec],
        options: &PlanOptions,
    ) -> Result<Plan, ReconcileError> {
        validate_specs(specs)?;
        let session = self.open(workspace, LockOperation::Plan, "plan").await?;
        let result = self.plan_locked(workspace, specs, options).await;
        session.close(&self.workspaces).await;
        result.map(|(plan, _)| plan)
    }

    /// Execute a saved plan.
    ///
    /// Rejected without touching any object when the state has moved on since
    /// the plan was computed.
    pub async fn apply(
        &self,
        workspace: &str,
        plan: &Plan,
        options: &ApplyOptions,
    ) -> Result<ApplyReport, ReconcileError> {
        if plan.workspace != workspace {
            return Err(ReconcileError::WrongWorkspace {
                planned: plan.workspace.clone(),
                requested: workspace.to_string(),
            });
        }
        plan.validate()?;

        let session = self.open(workspace, LockOperation::Apply, "apply saved plan").await?;
        let result = async {
            let snapshot = self.workspaces.read(workspace).await?;
            if snapshot.lineage != plan.lineage || snapshot.serial != plan.serial {
                return Err(ReconcileError::StalePlan {
                    workspace: workspace.to_string(),
                    planned_lineage: plan.lineage.clone(),
                    planned_serial: plan.serial,
                    current_lineage: snapshot.lineage,
                    current_serial: snapshot.serial,
                });
            }
            Ok::<_, ReconcileError>(self.execute(plan, snapshot, session.lock(), options).await)
        }
        .await;
        session.close(&self.workspaces).await;
        result
    }

    /// Plan and apply in one session, under a single lock.
    pub async fn apply_specs(
        &self,
        workspace: &str,
        specs: &[ResourceSpec],
        plan_options: &PlanOptions,
        options: &ApplyOptions,
    ) -> Result<(Plan, ApplyReport), ReconcileError> {
        validate_specs(specs)?;
        self.converge(workspace, specs, plan_options, options, LockOperation::Apply, "apply")
            .await
    }

    /// Delete every object recorded in `workspace`.
    pub async fn destroy(
        &self,
        workspace: &str,
        plan_options: &PlanOptions,
        options: &ApplyOptions,
    ) -> Result<(Plan, ApplyReport), ReconcileError> {
        self.converge(workspace, &[], plan_options, options, LockOperation::Destroy, "destroy")
            .await
    }

    async fn converge(
        &self,
        workspace: &str,
        specs: &[ResourceSpec],
        plan_options: &PlanOptions,
        options: &ApplyOptions,
        operation: LockOperation,
        info: &str,
    ) -> Result<(Plan, ApplyReport), ReconcileError> {
        let session = self.open(workspace, operation, info).await?;
        let result = match self.plan_locked(workspace, specs, plan_options).await {
            Ok((plan, snapshot)) => {
                let report = self.execute(&plan, snapshot, session.lock(), options).await;
                Ok((plan, report))
            }
            Err(e) => Err(e),
        };
        session.close(&self.workspaces).await;
        result
    }

    async fn open(
        &self,
        workspace: &str,
        operation: LockOperation,
        info: &str,
    ) -> Result<Session, ReconcileError> {
        let request = LockRequest::new(self.settings.holder_id.clone(), operation).with_info(info);
        Session::open(&self.workspaces, workspace, &request, &self.settings.lock_policy).await
    }

    /// Plan against the stored snapshot, which is returned alongside as the
    /// base the plan was computed against.
    async fn plan_locked(
        &self,
        workspace: &str,
        specs: &[ResourceSpec],
        options: &PlanOptions,
    ) -> Result<(Plan, StateSnapshot), ReconcileError> {
        // 1. Read the current state
        let stored = self.workspaces.read(workspace).await?;
        debug!(workspace, serial = stored.serial, resources = stored.resource_count(), "state loaded");

        // 2. Refresh against real objects
        let current = if options.refresh {
            let declared: BTreeSet<Address> = specs.iter().map(|s| s.address()).collect();
            refresh(&stored, &declared, &self.providers).await?
        } else {
            stored.clone()
        };

        // 3. Graph, diff, order
        let graph = DependencyGraph::build(specs, &current)?;
        let diffs = diff(&graph, &self.providers)?;
        let plan = build_plan(workspace, &current, &graph, &diffs)?;

        info!(workspace, summary = %plan.summary(), "plan computed");
        Ok((plan, stored))
    }

    async fn execute(
        &self,
        plan: &Plan,
        snapshot: StateSnapshot,
        lock: &Lock,
        options: &ApplyOptions,
    ) -> ApplyReport {
        let options = ApplyOptions {
            parallelism: options.parallelism.min(self.settings.parallelism).max(1),
            cancel: options.cancel.clone(),
        };
        let executor = Executor {
            workspaces: &self.workspaces,
            providers: &self.providers,
            lock,
            options: &options,
        };
        let report = executor.run(plan, snapshot).await;
        info!(workspace = %plan.workspace, outcome = ?report.outcome(), serial = report.serial, "apply finished");
        report
    }
}
