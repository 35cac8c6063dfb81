use std::collections::BTreeSet;
use std::sync::Arc;

use terrace_domain::{Attributes, ChangeAction, Reference, Value};
use terrace_provider::{OperationRequest, Provider, ProviderError, ProviderRegistry};
use terrace_store::{Lock, StateEntity, StateSnapshot, WorkspaceManager};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::plan::{Plan, PlanEntry};
use crate::report::{ApplyReport, NodeOutcome, NodeStatus};

#[derive(Debug, Clone)]
pub struct ApplyOptions {
    /// Upper bound on provider operations in flight.
    pub parallelism: usize,
    /// Stops dispatching new entries; in-flight operations still finish and
    /// are recorded.
    pub cancel: CancellationToken,
}

impl Default for ApplyOptions {
    fn default() -> Self {
        ApplyOptions {
            parallelism: 10,
            cancel: CancellationToken::new(),
        }
    }
}

type TaskResult = (usize, Result<Option<StateEntity>, ProviderError>);

/// Walks a plan under a held lock.
///
/// The coordinating task owns the working snapshot and the per-entry
/// predecessor counters; spawned tasks only run provider calls. Every
/// confirmed operation is written back before its successors are released.
pub(crate) struct Executor<'a> {
    pub workspaces: &'a WorkspaceManager,
    pub providers: &'a ProviderRegistry,
    pub lock: &'a Lock,
    pub options: &'a ApplyOptions,
}

struct Progress {
    status: Vec<Option<(NodeStatus, Option<String>)>>,
    remaining: Vec<usize>,
    successors: Vec<Vec<usize>>,
    ready: BTreeSet<usize>,
    /// Dispatched entries whose task has not reported back.
    in_flight: BTreeSet<usize>,
}

impl Progress {
    fn new(plan: &Plan) -> Self {
        let n = plan.entries.len();
        let mut successors: Vec<Vec<usize>> = vec![Vec::new(); n];
        let mut remaining = Vec::with_capacity(n);
        for (ix, entry) in plan.entries.iter().enumerate() {
            remaining.push(entry.depends_on.len());
            for &before in &entry.depends_on {
                if let Some(list) = successors.get_mut(before) {
                    list.push(ix);
                }
            }
        }
        let ready = (0..n).filter(|&ix| remaining[ix] == 0).collect();
        Progress {
            status: vec![None; n],
            remaining,
            successors,
            ready,
            in_flight: BTreeSet::new(),
        }
    }

    /// Fail every dispatched entry whose task ended without a result.
    fn fail_lost(&mut self, plan: &Plan) {
        for ix in std::mem::take(&mut self.in_flight) {
            self.fail(plan, ix, "operation outcome unknown: its task ended without reporting".into());
        }
    }

    fn succeed(&mut self, ix: usize, status: NodeStatus, message: Option<String>) {
        self.status[ix] = Some((status, message));
        for &next in &self.successors[ix] {
            self.remaining[next] = self.remaining[next].saturating_sub(1);
            if self.remaining[next] == 0 && self.status[next].is_none() {
                self.ready.insert(next);
            }
        }
    }

    fn fail(&mut self, plan: &Plan, ix: usize, message: String) {
        let entry = &plan.entries[ix];
        warn!(address = %entry.address, operation = %entry.operation, error = %message, "operation failed");
        self.status[ix] = Some((NodeStatus::Failed, Some(message)));

        let mut stack = self.successors[ix].clone();
        while let Some(next) = stack.pop() {
            if self.status[next].is_some() {
                continue;
            }
            let blocked = &plan.entries[next];
            warn!(address = %blocked.address, blocked_by = %entry.address, "blocked");
            self.status[next] = Some((
                NodeStatus::Blocked,
                Some(format!("blocked by failed {} of {}", entry.operation, entry.address)),
            ));
            self.ready.remove(&next);
            stack.extend(self.successors[next].iter().copied());
        }
    }
}

impl Executor<'_> {
    pub async fn run(&self, plan: &Plan, mut snapshot: StateSnapshot) -> ApplyReport {
        let workspace = plan.workspace.as_str();
        let parallelism = self.options.parallelism.max(1);
        let mut progress = Progress::new(plan);
        let mut tasks: JoinSet<TaskResult> = JoinSet::new();
        let mut aborted: Option<String> = None;

        info!(workspace, entries = plan.entries.len(), parallelism, "apply started");

        loop {
            while aborted.is_none()
                && !self.options.cancel.is_cancelled()
                && tasks.len() < parallelism
            {
                let Some(ix) = progress.ready.pop_first() else { break };
                let entry = &plan.entries[ix];
                if !entry.operation.is_change() {
                    progress.succeed(ix, NodeStatus::Skipped, None);
                    continue;
                }
                match self.prepare(entry, &snapshot) {
                    Ok((provider, attributes)) => {
                        info!(workspace, address = %entry.address, operation = %entry.operation, "dispatching");
                        let owned = entry.clone();
                        progress.in_flight.insert(ix);
                        tasks.spawn(async move {
                            // A panicking provider fails its own entry only.
                            let call = tokio::spawn(async move {
                                let request = OperationRequest {
                                    action: owned.operation,
                                    address: &owned.address,
                                    spec: owned.spec.as_ref(),
                                    prior: owned.prior.as_ref(),
                                    attributes: &attributes,
                                };
                                provider.apply_operation(request).await
                            });
                            let result = call.await.unwrap_or_else(|e| {
                                Err(ProviderError::Internal(format!("provider task failed: {e}")))
                            });
                            (ix, result)
                        });
                    }
                    Err(message) => progress.fail(plan, ix, message),
                }
            }

            let Some(joined) = tasks.join_next().await else { break };
            let (ix, result) = match joined {
                Ok(done) => done,
                Err(e) => {
                    warn!(workspace, error = %e, "apply task lost");
                    continue;
                }
            };
            progress.in_flight.remove(&ix);

            let entry = &plan.entries[ix];
            let observed = match result {
                Ok(observed) => observed,
                Err(e) => {
                    progress.fail(plan, ix, e.to_string());
                    continue;
                }
            };
            if let Err(message) = record(entry, observed, &mut snapshot) {
                progress.fail(plan, ix, message);
                continue;
            }
            match self.persist(workspace, &mut snapshot).await {
                Ok(()) => {
                    info!(workspace, address = %entry.address, operation = %entry.operation, serial = snapshot.serial, "applied");
                    progress.succeed(ix, NodeStatus::Succeeded, None);
                }
                Err(message) => {
                    warn!(workspace, error = %message, "state write failed; no further operations will be dispatched");
                    progress.fail(plan, ix, message.clone());
                    aborted = Some(message);
                }
            }
        }

        progress.fail_lost(plan);

        let cancelled = self.options.cancel.is_cancelled();
        if cancelled {
            info!(workspace, "apply cancelled; undispatched entries skipped");
        }
        let not_started = if aborted.is_some() {
            "not started: apply aborted"
        } else {
            "not started: apply cancelled"
        };

        let outcomes = plan
            .entries
            .iter()
            .zip(progress.status)
            .map(|(entry, status)| {
                let (status, message) =
                    status.unwrap_or((NodeStatus::Skipped, Some(not_started.to_string())));
                NodeOutcome {
                    address: entry.address.clone(),
                    action: entry.action,
                    operation: entry.operation,
                    deposed: entry.deposed,
                    status,
                    message,
                }
            })
            .collect();

        ApplyReport {
            workspace: workspace.to_string(),
            outcomes,
            serial: snapshot.serial,
            aborted,
            cancelled,
        }
    }

    /// Provider and fully resolved attributes for `entry`.
    fn prepare(
        &self,
        entry: &PlanEntry,
        snapshot: &StateSnapshot,
    ) -> Result<(Arc<dyn Provider>, Attributes), String> {
        let provider = self.providers.get(&entry.provider_id).map_err(|e| e.to_string())?;
        let Some(spec) = &entry.spec else {
            return Ok((provider, Attributes::new()));
        };
        if entry.operation == ChangeAction::Delete {
            return Ok((provider, Attributes::new()));
        }
        let lookup = |r: &Reference| -> Option<Value> {
            snapshot
                .entity(&r.address)
                .and_then(|e| e.attribute(&r.attribute))
                .cloned()
        };
        let mut attributes = Attributes::new();
        for (name, value) in &spec.attributes {
            let resolved = value
                .resolve(&lookup)
                .map_err(|r| format!("unresolved reference {r} in attribute '{name}'"))?;
            attributes.insert(name.clone(), resolved);
        }
        Ok((provider, attributes))
    }

    /// Write the working snapshot, provided this session still owns the lock.
    async fn persist(&self, workspace: &str, snapshot: &mut StateSnapshot) -> Result<(), String> {
        match self.workspaces.current_lock(workspace).await {
            Ok(Some(current)) if current.id == self.lock.id => {}
            Ok(Some(current)) => {
                return Err(format!(
                    "lock {} was replaced by lock {} held by {}; state not written",
                    self.lock.id, current.id, current.holder_id
                ))
            }
            Ok(None) => {
                return Err(format!(
                    "lock {} is no longer held (force-unlocked?); state not written",
                    self.lock.id
                ))
            }
            Err(e) => return Err(format!("checking lock: {e}")),
        }
        let serial = self
            .workspaces
            .write(workspace, snapshot, snapshot.serial)
            .await
            .map_err(|e| format!("state write failed: {e}"))?;
        debug!(workspace, serial, "state written");
        snapshot.serial = serial;
        Ok(())
    }
}

/// Fold a confirmed operation into the working snapshot.
fn record(
    entry: &PlanEntry,
    observed: Option<StateEntity>,
    snapshot: &mut StateSnapshot,
) -> Result<(), String> {
    match entry.operation {
        ChangeAction::Create | ChangeAction::Update => {
            let Some(mut entity) = observed else {
                return Err(format!(
                    "provider returned no object after {} of {}",
                    entry.operation, entry.address
                ));
            };
            if entry.action == (ChangeAction::Replace { before_destroy: true }) {
                if let Some(old) = snapshot.remove(&entry.address) {
                    snapshot.deposed.push(old);
                }
            }
            entity.address = entry.address.clone();
            entity.provider_id = entry.provider_id.clone();
            entity.dependencies = entry
                .spec
                .as_ref()
                .map(|s| s.dependencies())
                .unwrap_or_default();
            snapshot.upsert(entity);
            Ok(())
        }
        ChangeAction::Delete if entry.deposed => {
            let position = snapshot
                .deposed
                .iter()
                .position(|d| Some(d) == entry.prior.as_ref())
                .or_else(|| snapshot.deposed.iter().position(|d| d.address == entry.address));
            if let Some(position) = position {
                snapshot.deposed.remove(position);
            }
            Ok(())
        }
        ChangeAction::Delete => {
            snapshot.remove(&entry.address);
            Ok(())
        }
        other => Err(format!("'{other}' is not an executable operation")),
    }
}
