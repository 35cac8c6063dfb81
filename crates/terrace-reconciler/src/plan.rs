use std::cmp::Reverse;
use std::collections::{BTreeSet, BinaryHeap, HashMap};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use terrace_domain::{Address, ChangeAction, ResourceSpec};
use terrace_graph::{DependencyGraph, EdgeKind, GraphError};
use terrace_store::{StateEntity, StateSnapshot};

use crate::diff::{AttributeChange, ResourceDiff};
use crate::error::ReconcileError;

/// Version of the saved plan layout.
pub const PLAN_FORMAT_VERSION: u32 = 1;

/// One executable step.
///
/// A `Replace` diff becomes two entries sharing the address: a `Delete` of the
/// old object and a `Create` of the new one, ordered by `before_destroy`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanEntry {
    pub address: Address,
    /// The diff verdict for the resource.
    pub action: ChangeAction,
    /// What this entry asks the provider to do: `NoOp`, `Create`, `Update`
    /// or `Delete`.
    pub operation: ChangeAction,
    /// Targets a deposed object rather than the current one.
    #[serde(default)]
    pub deposed: bool,
    pub provider_id: String,
    /// Indices of entries that must succeed first; all lower than this
    /// entry's own index.
    pub depends_on: Vec<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spec: Option<ResourceSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prior: Option<StateEntity>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub changes: Vec<AttributeChange>,
}

/// Counts of provider operations a plan will perform.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanSummary {
    pub add: usize,
    pub change: usize,
    pub destroy: usize,
}

impl PlanSummary {
    pub fn is_empty(&self) -> bool {
        self.add == 0 && self.change == 0 && self.destroy == 0
    }
}

impl std::fmt::Display for PlanSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} to add, {} to change, {} to destroy",
            self.add, self.change, self.destroy
        )
    }
}

/// An immutable, ordered set of steps computed against one snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub format_version: u32,
    pub workspace: String,
    /// Lineage and serial of the snapshot the plan was computed against.
    pub lineage: String,
    pub serial: u64,
    pub entries: Vec<PlanEntry>,
}

impl Plan {
    pub fn summary(&self) -> PlanSummary {
        let mut summary = PlanSummary::default();
        for entry in &self.entries {
            match entry.operation {
                ChangeAction::Create => summary.add += 1,
                ChangeAction::Update => summary.change += 1,
                ChangeAction::Delete => summary.destroy += 1,
                _ => {}
            }
        }
        summary
    }

    pub fn has_changes(&self) -> bool {
        self.entries.iter().any(|e| e.operation.is_change())
    }

    /// Canonical serialized form; identical plans give identical bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec_pretty(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ReconcileError> {
        let plan: Plan = serde_json::from_slice(bytes)
            .map_err(|e| ReconcileError::InvalidPlan(e.to_string()))?;
        plan.validate()?;
        Ok(plan)
    }

    /// Hex SHA-256 of [`to_bytes`](Self::to_bytes).
    pub fn digest(&self) -> Result<String, serde_json::Error> {
        let bytes = self.to_bytes()?;
        let hash = Sha256::digest(&bytes);
        Ok(hash.iter().map(|b| format!("{b:02x}")).collect())
    }

    /// Structural checks for plans read back from disk.
    pub fn validate(&self) -> Result<(), ReconcileError> {
        if self.format_version != PLAN_FORMAT_VERSION {
            return Err(ReconcileError::InvalidPlan(format!(
                "unsupported plan format version {}",
                self.format_version
            )));
        }
        for (i, entry) in self.entries.iter().enumerate() {
            if let Some(bad) = entry.depends_on.iter().find(|&&d| d >= i) {
                return Err(ReconcileError::InvalidPlan(format!(
                    "entry {i} ({}) depends on entry {bad}, which does not precede it",
                    entry.address
                )));
            }
            if matches!(entry.operation, ChangeAction::Replace { .. }) {
                return Err(ReconcileError::InvalidPlan(format!(
                    "entry {i} ({}) has a replace operation; replacements must be expanded",
                    entry.address
                )));
            }
            let needs_spec = matches!(entry.operation, ChangeAction::Create | ChangeAction::Update);
            if needs_spec && entry.spec.is_none() {
                return Err(ReconcileError::InvalidPlan(format!(
                    "entry {i} ({}) has no resource specification",
                    entry.address
                )));
            }
        }
        Ok(())
    }
}

// ── Builder ───────────────────────────────────────────────────────────────────

struct Step {
    entry: PlanEntry,
    after: BTreeSet<usize>,
}

#[derive(Default)]
struct Steps {
    steps: Vec<Step>,
    apply: HashMap<Address, usize>,
    destroy: HashMap<Address, usize>,
    create_before_destroy: BTreeSet<Address>,
}

impl Steps {
    fn push(&mut self, entry: PlanEntry) -> usize {
        self.steps.push(Step { entry, after: BTreeSet::new() });
        self.steps.len() - 1
    }

    fn order(&mut self, before: Option<usize>, after: Option<usize>) {
        if let (Some(before), Some(after)) = (before, after) {
            if before != after {
                self.steps[after].after.insert(before);
            }
        }
    }

    fn apply_of(&self, address: &Address) -> Option<usize> {
        self.apply.get(address).copied()
    }

    fn destroy_of(&self, address: &Address) -> Option<usize> {
        self.destroy.get(address).copied()
    }
}

fn entry(diff: &ResourceDiff, operation: ChangeAction) -> PlanEntry {
    PlanEntry {
        address: diff.address.clone(),
        action: diff.action,
        operation,
        deposed: false,
        provider_id: diff.provider_id.clone(),
        depends_on: Vec::new(),
        spec: diff.spec.clone(),
        prior: diff.prior.clone(),
        changes: diff.changes.clone(),
    }
}

/// Order `diffs` into an executable plan.
///
/// Step ordering for a graph edge `u → v` (v depends on u):
/// - apply(u) before apply(v)
/// - destroy(v) before destroy(u), unless v is create-before-destroy
/// - when u is create-before-destroy, apply(v) before destroy(u)
///
/// Orphans are deleted after every declared node that used to depend on them
/// has been applied, and before the destroy of anything they depended on.
/// Deposed objects left over from an interrupted replacement are deleted as
/// standalone entries. Ties are broken by address, then by creation order.
pub fn build_plan(
    workspace: &str,
    snapshot: &StateSnapshot,
    graph: &DependencyGraph,
    diffs: &[ResourceDiff],
) -> Result<Plan, GraphError> {
    let mut steps = Steps::default();

    for diff in diffs {
        let address = diff.address.clone();
        match diff.action {
            ChangeAction::NoOp | ChangeAction::Create | ChangeAction::Update => {
                let ix = steps.push(entry(diff, diff.action));
                steps.apply.insert(address, ix);
            }
            ChangeAction::Delete => {
                let mut delete = entry(diff, ChangeAction::Delete);
                delete.spec = None;
                let ix = steps.push(delete);
                steps.destroy.insert(address, ix);
            }
            ChangeAction::Replace { before_destroy } => {
                let mut delete = entry(diff, ChangeAction::Delete);
                delete.spec = None;
                delete.changes = Vec::new();
                delete.deposed = before_destroy;
                let create = entry(diff, ChangeAction::Create);
                let (destroy_ix, create_ix) = if before_destroy {
                    let c = steps.push(create);
                    let d = steps.push(delete);
                    steps.order(Some(c), Some(d));
                    steps.create_before_destroy.insert(address.clone());
                    (d, c)
                } else {
                    let d = steps.push(delete);
                    let c = steps.push(create);
                    steps.order(Some(d), Some(c));
                    (d, c)
                };
                steps.apply.insert(address.clone(), create_ix);
                steps.destroy.insert(address, destroy_ix);
            }
        }
    }

    for (u, v, kind) in graph.edges() {
        match kind {
            EdgeKind::Reference | EdgeKind::DependsOn => {
                steps.order(steps.apply_of(u), steps.apply_of(v));
                if !steps.create_before_destroy.contains(v) {
                    steps.order(steps.destroy_of(v), steps.destroy_of(u));
                }
                if steps.create_before_destroy.contains(u) {
                    steps.order(steps.apply_of(v), steps.destroy_of(u));
                }
            }
            EdgeKind::Teardown => {
                let target = steps.destroy_of(v);
                steps.order(steps.apply_of(u), target);
                steps.order(steps.destroy_of(u), target);
            }
        }
    }

    // Orphans keep the recorded order against nodes that are still declared.
    for node in graph.iter().filter(|n| n.is_orphan()) {
        let Some(state) = &node.state else { continue };
        for dep in &state.dependencies {
            let still_declared = graph.node(dep).is_some_and(|n| !n.is_orphan());
            if still_declared {
                steps.order(steps.destroy_of(&node.address), steps.destroy_of(dep));
            }
        }
    }

    for deposed in &snapshot.deposed {
        let ix = steps.push(PlanEntry {
            address: deposed.address.clone(),
            action: ChangeAction::Delete,
            operation: ChangeAction::Delete,
            deposed: true,
            provider_id: deposed.provider_id.clone(),
            depends_on: Vec::new(),
            spec: None,
            prior: Some(deposed.clone()),
            changes: Vec::new(),
        });
        for dep in &deposed.dependencies {
            steps.order(Some(ix), steps.destroy_of(dep));
        }
        // Never in flight alongside another operation on the same address.
        for target in [steps.apply_of(&deposed.address), steps.destroy_of(&deposed.address)] {
            if target.is_some_and(|t| steps.steps[t].entry.operation.is_change()) {
                steps.order(Some(ix), target);
            }
        }
    }

    let entries = sort_steps(steps.steps)?;
    Ok(Plan {
        format_version: PLAN_FORMAT_VERSION,
        workspace: workspace.to_string(),
        lineage: snapshot.lineage.clone(),
        serial: snapshot.serial,
        entries,
    })
}

/// Kahn's algorithm over steps, always emitting the smallest ready
/// `(address, creation index)`.
fn sort_steps(steps: Vec<Step>) -> Result<Vec<PlanEntry>, GraphError> {
    let mut successors: Vec<Vec<usize>> = vec![Vec::new(); steps.len()];
    let mut remaining: Vec<usize> = Vec::with_capacity(steps.len());
    for (ix, step) in steps.iter().enumerate() {
        remaining.push(step.after.len());
        for &before in &step.after {
            successors[before].push(ix);
        }
    }

    let mut ready: BinaryHeap<Reverse<(&Address, usize)>> = steps
        .iter()
        .enumerate()
        .filter(|(ix, _)| remaining[*ix] == 0)
        .map(|(ix, step)| Reverse((&step.entry.address, ix)))
        .collect();

    let mut order: Vec<usize> = Vec::with_capacity(steps.len());
    while let Some(Reverse((_, ix))) = ready.pop() {
        order.push(ix);
        for &next in &successors[ix] {
            remaining[next] -= 1;
            if remaining[next] == 0 {
                ready.push(Reverse((&steps[next].entry.address, next)));
            }
        }
    }

    if order.len() < steps.len() {
        let emitted: BTreeSet<usize> = order.iter().copied().collect();
        let stuck: BTreeSet<Address> = steps
            .iter()
            .enumerate()
            .filter(|(ix, _)| !emitted.contains(ix))
            .map(|(_, step)| step.entry.address.clone())
            .collect();
        return Err(GraphError::Cycle(stuck.into_iter().collect()));
    }

    let position: HashMap<usize, usize> = order.iter().enumerate().map(|(pos, &ix)| (ix, pos)).collect();
    let mut slots: Vec<Option<Step>> = steps.into_iter().map(Some).collect();
    let mut entries = Vec::with_capacity(order.len());
    for ix in order {
        let Some(step) = slots[ix].take() else { continue };
        let mut entry = step.entry;
        entry.depends_on = step.after.iter().filter_map(|b| position.get(b).copied()).collect();
        entry.depends_on.sort_unstable();
        entries.push(entry);
    }
    Ok(entries)
}
