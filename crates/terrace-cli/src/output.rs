use terrace_domain::ChangeAction;
use terrace_graph::DependencyGraph;
use terrace_reconciler::{ApplyReport, NodeStatus, Plan, PlanEntry};
use terrace_store::StateSnapshot;

/// Render a plan as human-readable text.
pub fn render_plan(plan: &Plan) -> String {
    let mut out = format!(
        "Workspace '{}' (lineage {}, serial {})\n\n",
        plan.workspace, plan.lineage, plan.serial
    );
    if !plan.has_changes() {
        out.push_str("No changes. Infrastructure matches the configuration.\n");
        return out;
    }
    for entry in plan.entries.iter().filter(|e| e.operation.is_change()) {
        out.push_str(&format!("  {} {}{}\n", entry.operation.symbol(), entry.address, note(entry)));
        if entry.operation == ChangeAction::Delete {
            continue;
        }
        for change in &entry.changes {
            let before = change.before.as_ref().map_or("(none)".to_string(), |v| v.to_string());
            let after = match &change.after {
                _ if change.known_after_apply => "(known after apply)".to_string(),
                Some(v) => v.to_string(),
                None => "(removed)".to_string(),
            };
            let forces = if change.forces_replacement { "  # forces replacement" } else { "" };
            out.push_str(&format!("      {}: {} -> {}{}\n", change.name, before, after, forces));
        }
    }
    out.push_str(&format!("\nPlan: {}.\n", plan.summary()));
    out
}

fn note(entry: &PlanEntry) -> String {
    match (entry.action, entry.operation) {
        (ChangeAction::Replace { .. }, ChangeAction::Create) => " (replacement)".to_string(),
        (ChangeAction::Replace { .. }, ChangeAction::Delete) if entry.deposed => {
            " (deposed, replaced)".to_string()
        }
        (ChangeAction::Replace { .. }, ChangeAction::Delete) => " (replaced)".to_string(),
        (ChangeAction::Delete, _) if entry.deposed => " (deposed)".to_string(),
        _ => String::new(),
    }
}

/// Render the per-entry results of an apply.
pub fn render_report(report: &ApplyReport) -> String {
    let mut out = String::new();
    for outcome in report.outcomes.iter().filter(|o| o.operation.is_change()) {
        let deposed = if outcome.deposed { " (deposed)" } else { "" };
        out.push_str(&format!(
            "  {:<9} {} {}{}",
            outcome.status.to_string(),
            outcome.operation.symbol(),
            outcome.address,
            deposed
        ));
        if let Some(message) = &outcome.message {
            out.push_str(&format!(": {message}"));
        }
        out.push('\n');
    }

    let count = |status: NodeStatus| {
        report
            .outcomes
            .iter()
            .filter(|o| o.operation.is_change() && o.status == status)
            .count()
    };
    out.push_str(&format!(
        "\nApply finished: {} succeeded, {} failed, {} blocked, {} skipped (serial {}).\n",
        count(NodeStatus::Succeeded),
        count(NodeStatus::Failed),
        count(NodeStatus::Blocked),
        count(NodeStatus::Skipped),
        report.serial
    ));
    if let Some(reason) = &report.aborted {
        out.push_str(&format!("Aborted: {reason}\n"));
    }
    if report.cancelled {
        out.push_str("Cancelled: operations that had not started were skipped.\n");
    }
    out
}

/// Render the graph as plain text, one node per line in apply order.
pub fn render_graph_text(graph: &DependencyGraph) -> String {
    let mut out = String::new();
    for node in graph.iter() {
        let orphan = if node.is_orphan() { " (orphan)" } else { "" };
        out.push_str(&format!("{}{}\n", node.address, orphan));
        for dep in graph.dependencies(&node.address) {
            out.push_str(&format!("  <- {dep}\n"));
        }
    }
    out
}

pub fn render_state(workspace: &str, snapshot: &StateSnapshot) -> String {
    let mut out = format!(
        "Workspace '{}' (lineage {}, serial {}): {} resource(s)\n",
        workspace,
        snapshot.lineage,
        snapshot.serial,
        snapshot.entities.len()
    );
    for entity in snapshot.entities.values() {
        out.push_str(&format!("  {} [{}]\n", entity.address, entity.provider_id));
    }
    for entity in &snapshot.deposed {
        out.push_str(&format!("  {} [{}] (deposed)\n", entity.address, entity.provider_id));
    }
    out
}
