mod error;
mod graph;

pub use error::GraphError;
pub use graph::{validate_specs, DependencyGraph, EdgeKind, GraphNode, NodeView};
