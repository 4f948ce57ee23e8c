//! Core domain types shared across the calcflow workspace.
//!
//! - **Targets**: the business objects computed on ([`ComputationTarget`]) and
//!   their hashable handles ([`ComputationTargetSpecification`]).
//! - **Values**: what functions produce ([`ValueSpecification`]) and what callers
//!   request ([`ValueRequirement`]).
//! - **Graphs**: per calculation configuration DAGs of function applications
//!   ([`DependencyGraph`]).

mod adjust;
mod error;
mod function;
mod graph;
mod id;
mod target;
mod value;

pub use adjust::{AdjustedTargets, Adjustment, TargetTypeAdjuster};
pub use error::{GraphError, GraphResult};
pub use function::{FunctionParameters, ParameterizedFunction};
pub use graph::{DependencyGraph, DependencyGraphBuilder, DependencyNode, NodeId};
pub use id::{FunctionId, UniqueId, MARKET_DATA_SOURCING_FUNCTION};
pub use target::{
    ComputationTarget, ComputationTargetResolver, ComputationTargetSpecification,
    ComputationTargetType, InMemoryComputationTargetResolver, TargetKind,
};
pub use value::{ValueProperties, ValueRequirement, ValueSpecification};
