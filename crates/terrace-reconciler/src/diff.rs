use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde::{Deserialize, Serialize};
use terrace_domain::{
    Address, AttributeBehavior, Attributes, ChangeAction, Reference, ResourceSchema, ResourceSpec,
    Value,
};
use terrace_graph::{DependencyGraph, GraphNode};
use terrace_provider::{ProviderError, ProviderRegistry};
use terrace_store::{StateEntity, StateSnapshot};
use tracing::{debug, info};

/// One attribute that differs between recorded and desired state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributeChange {
    pub name: String,
    pub before: Option<Value>,
    /// `None` either when the attribute was removed from the configuration or
    /// when `known_after_apply` is set.
    pub after: Option<Value>,
    /// The new value depends on an object that does not exist yet.
    #[serde(default)]
    pub known_after_apply: bool,
    #[serde(default)]
    pub forces_replacement: bool,
}

/// The diff engine's verdict for one graph node.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceDiff {
    pub address: Address,
    pub action: ChangeAction,
    pub provider_id: String,
    pub spec: Option<ResourceSpec>,
    pub prior: Option<StateEntity>,
    pub changes: Vec<AttributeChange>,
}

/// What later nodes can learn about an already diffed node at plan time.
struct Planned {
    action: ChangeAction,
    /// Desired attributes; `None` values are known only after apply.
    desired: BTreeMap<String, Option<Value>>,
    prior: Option<Attributes>,
}

/// Plan-time value of `reference`, if it can be known before applying.
fn planned_value(planned: &HashMap<Address, Planned>, reference: &Reference) -> Option<Value> {
    let target = planned.get(&reference.address)?;
    match target.desired.get(&reference.attribute) {
        Some(value) => value.clone(),
        // Attributes the configuration does not set survive in place.
        None => match target.action {
            ChangeAction::NoOp | ChangeAction::Update => {
                target.prior.as_ref()?.get(&reference.attribute).cloned()
            }
            _ => None,
        },
    }
}

/// Compute a change for every node of `graph`, in graph order.
///
/// Attribute behaviour comes from the provider schema of each declared
/// resource; orphans are always deleted.
pub fn diff(
    graph: &DependencyGraph,
    providers: &ProviderRegistry,
) -> Result<Vec<ResourceDiff>, ProviderError> {
    let mut planned: HashMap<Address, Planned> = HashMap::new();
    let mut diffs = Vec::with_capacity(graph.len());

    for node in graph.iter() {
        let diff = match &node.spec {
            None => orphan_diff(node),
            Some(spec) => {
                let schema = providers.schema(&spec.provider_id, &spec.resource_type)?;
                let desired: BTreeMap<String, Option<Value>> = spec
                    .attributes
                    .iter()
                    .map(|(name, value)| {
                        let resolved = value.resolve(&|r: &Reference| planned_value(&planned, r));
                        (name.clone(), resolved.ok())
                    })
                    .collect();
                let diff = declared_diff(node, spec, &schema, &desired);
                planned.insert(
                    node.address.clone(),
                    Planned {
                        action: diff.action,
                        desired,
                        prior: node.state.as_ref().map(|s| s.attributes.clone()),
                    },
                );
                diff
            }
        };
        debug!(address = %diff.address, action = %diff.action, "diffed");
        diffs.push(diff);
    }
    Ok(diffs)
}

fn orphan_diff(node: &GraphNode) -> ResourceDiff {
    ResourceDiff {
        address: node.address.clone(),
        action: ChangeAction::Delete,
        provider_id: node.provider_id().to_string(),
        spec: None,
        prior: node.state.clone(),
        changes: Vec::new(),
    }
}

fn declared_diff(
    node: &GraphNode,
    spec: &ResourceSpec,
    schema: &ResourceSchema,
    desired: &BTreeMap<String, Option<Value>>,
) -> ResourceDiff {
    let Some(prior) = &node.state else {
        let changes = desired
            .iter()
            .map(|(name, after)| AttributeChange {
                name: name.clone(),
                before: None,
                after: after.clone(),
                known_after_apply: after.is_none(),
                forces_replacement: false,
            })
            .collect();
        return ResourceDiff {
            address: node.address.clone(),
            action: ChangeAction::Create,
            provider_id: spec.provider_id.clone(),
            spec: Some(spec.clone()),
            prior: None,
            changes,
        };
    };

    let names: BTreeSet<&String> = desired.keys().chain(prior.attributes.keys()).collect();
    let mut changes = Vec::new();
    for name in names {
        let behavior = schema.behavior(name);
        let forces_replacement = behavior == AttributeBehavior::ForcesReplacement;
        let before = prior.attributes.get(name.as_str());
        let change = match (desired.get(name.as_str()), before) {
            (Some(Some(after)), Some(before)) if after == before => None,
            (Some(after), before) => Some(AttributeChange {
                name: name.clone(),
                before: before.cloned(),
                after: after.clone(),
                known_after_apply: after.is_none(),
                forces_replacement,
            }),
            (None, Some(_)) if behavior == AttributeBehavior::Computed => None,
            // Removed from the configuration: reset to the provider default.
            (None, Some(before)) => Some(AttributeChange {
                name: name.clone(),
                before: Some(before.clone()),
                after: None,
                known_after_apply: false,
                forces_replacement,
            }),
            (None, None) => None,
        };
        changes.extend(change);
    }

    let action = if changes.is_empty() {
        ChangeAction::NoOp
    } else if changes.iter().any(|c| c.forces_replacement) {
        ChangeAction::Replace {
            before_destroy: schema.create_before_destroy,
        }
    } else {
        ChangeAction::Update
    };

    ResourceDiff {
        address: node.address.clone(),
        action,
        provider_id: spec.provider_id.clone(),
        spec: Some(spec.clone()),
        prior: Some(prior.clone()),
        changes,
    }
}

/// Re-read every recorded entity through its provider.
///
/// Live attributes replace recorded ones. A declared resource that no longer
/// exists is dropped so that it is planned as a create; a vanished orphan is
/// kept so its record is still removed by a delete.
pub async fn refresh(
    snapshot: &StateSnapshot,
    declared: &BTreeSet<Address>,
    providers: &ProviderRegistry,
) -> Result<StateSnapshot, ProviderError> {
    let mut refreshed = snapshot.clone();
    for entity in snapshot.entities.values() {
        let provider = providers.get(&entity.provider_id)?;
        match provider.read(entity).await? {
            Some(mut live) => {
                live.dependencies = entity.dependencies.clone();
                if live.attributes != entity.attributes {
                    info!(address = %entity.address, "drift detected");
                }
                refreshed.upsert(live);
            }
            None if declared.contains(&entity.address) => {
                info!(address = %entity.address, "object no longer exists; it will be recreated");
                refreshed.remove(&entity.address);
            }
            None => {
                debug!(address = %entity.address, "orphan already gone");
            }
        }
    }
    Ok(refreshed)
}
