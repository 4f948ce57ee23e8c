//! Function resolution for the calcflow engine.
//!
//! ## Core Concepts
//!
//! - **FunctionDefinition**: an uncompiled function, compiled per instant into a
//!   [`CompiledFunctionDefinition`]
//! - **ResolutionRule**: a compiled function with a priority and a target filter
//! - **FunctionResolver**: registry of rules; `compile(at)` yields a
//!   [`CompiledFunctionResolver`] answering "which function produces this value
//!   on this target"
//! - **FunctionBlacklistQuery**: runtime veto on function/target pairs
//!
//! ## Resolution order
//!
//! ```text
//! priority buckets (highest first)
//!   └─ within a bucket: function id, then parameter hash
//!        └─ per rule: first maximal result satisfying the request, filter last
//! ```

mod blacklist;
mod definition;
mod error;
mod resolver;
mod rule;

pub use blacklist::{
    DefaultFunctionBlacklistQuery, EmptyFunctionBlacklist, FunctionBlacklistQuery,
    FunctionBlacklistRule,
};
pub use definition::{
    CompiledFunctionDefinition, FunctionCompilationContext, FunctionDefinition,
    FunctionRepository, StaticFunctionDefinition,
};
pub use error::{ResolutionError, ResolutionResult};
pub use resolver::{
    CompiledFunctionResolver, FunctionResolver, ResolvedFunction, ResolvedFunctions, TargetRules,
};
pub use rule::{
    ApplyToAllTargets, ComputationTargetFilter, DefaultFunctionPriority, FixedFunctionPriority,
    FunctionPriority, PredicateTargetFilter, ResolutionRule,
};
