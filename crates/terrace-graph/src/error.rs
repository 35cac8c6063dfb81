use terrace_domain::Address;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    #[error("dependency cycle detected: {}", render_cycle(.0))]
    Cycle(Vec<Address>),

    #[error("dangling reference: '{from}' depends on '{to}', which is not declared")]
    DanglingReference { from: Address, to: Address },

    #[error("duplicate resource address '{0}'")]
    DuplicateAddress(Address),
}

fn render_cycle(cycle: &[Address]) -> String {
    let mut parts: Vec<&str> = cycle.iter().map(Address::as_str).collect();
    if let Some(first) = cycle.first() {
        parts.push(first.as_str());
    }
    parts.join(" -> ")
}
