//! Error types for graph construction.

use thiserror::Error;

/// Result type alias for graph operations.
pub type GraphResult<T> = Result<T, GraphError>;

/// Errors raised while assembling a dependency graph.
#[derive(Debug, Error)]
pub enum GraphError {
    /// Two nodes claim to produce the same value.
    #[error("value {specification} already produced by another node")]
    DuplicateProducer { specification: String },

    /// A node consumes a value that no node produces.
    #[error("no node produces input {specification}")]
    UnresolvedInput { specification: String },

    /// A terminal output is not produced by any node.
    #[error("terminal output {specification} is not produced by the graph")]
    UnknownTerminalOutput { specification: String },

    /// A node declares no outputs.
    #[error("node for {function} on {target} declares no outputs")]
    NoOutputs { function: String, target: String },

    /// The nodes do not form a DAG.
    #[error("dependency cycle through node {node}")]
    Cycle { node: usize },
}
