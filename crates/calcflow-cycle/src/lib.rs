//! Computation cycles for the calcflow engine.
//!
//! A [`SingleComputationCycle`] evaluates a [`CompiledViewDefinition`] once:
//!
//! ```text
//! pre_execute   caches, market data, function parameters, delta reuse
//! execute       submit executable graphs, stream job results to the listener
//! post_execute  stamp timings
//! release       optional cache dump, free caches
//! ```
//!
//! Execution itself is delegated to a [`DependencyGraphExecutor`];
//! [`LocalGraphExecutor`] runs graphs on background threads.
//!
//! ## Example
//!
//! ```rust,ignore
//! let mut cycle = SingleComputationCycle::new(id, context, view, options, listener);
//! if cycle.pre_execute(previous.as_ref(), &snapshot, true)? {
//!     cycle.execute()?;
//! }
//! cycle.post_execute()?;
//! ```

mod cache;
mod context;
mod cycle;
mod cycle_executor;
mod delta;
mod error;
mod graph_executor;
mod job;
mod local;
mod log;
mod market_data;
mod result;
mod state;
mod view;

pub use cache::{
    CachedValue, ComputedValue, InMemoryViewComputationCacheSource, MissingInput, MissingOutput,
    ViewComputationCache, ViewComputationCacheSource,
};
pub use context::ViewProcessContext;
pub use cycle::{ComputationCycleQuery, InterruptHandle, SingleComputationCycle};
pub use delta::{DeltaCalculator, DeltaPartition, FunctionParametersDelta};
pub use error::{CycleError, CycleResult};
pub use graph_executor::{
    DependencyGraphExecutor, ExecutableGraph, ExecutionEvent, ExecutionEventSink, ExecutionHandle,
};
pub use job::{
    CalculationJob, CalculationJobItem, CalculationJobResult, CalculationJobResultItem,
    CalculationJobSpecification, DependencyNodeJobExecutionResult,
    DependencyNodeJobExecutionResultCache, InvocationResult,
};
pub use local::{
    FunctionInputs, FunctionInvocation, FunctionInvoker, LocalExecutorConfig, LocalGraphExecutor,
};
pub use log::{
    AggregatedExecutionLog, ExecutionLog, ExecutionLogMode, ExecutionLogModeSource,
    ExecutionLogWithContext, LogEvent, LogLevel,
};
pub use market_data::{
    InMemoryMarketDataSnapshot, MarketDataSnapshot, OverrideOperation, OverrideOperationCompiler,
    ShiftOperation, ShiftOperationCompiler, MARKET_DATA_SHIFT,
};
pub use result::{
    ComputationResultListener, ComputedValueResult, NoopResultListener, ViewComputationResultModel,
};
pub use state::{NodeStateFlag, ViewCycleState};
pub use view::{
    CompiledCalculationConfiguration, CompiledViewDefinition, MarketDataSelector,
    ViewCycleExecutionOptions, ViewDefinition,
};
