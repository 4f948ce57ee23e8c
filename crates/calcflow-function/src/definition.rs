//! Function definitions and their compiled, time-sliced forms.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::SystemTime;

use calcflow_core::{
    ComputationTarget, ComputationTargetResolver, ComputationTargetType, FunctionId,
    FunctionParameters, InMemoryComputationTargetResolver, ParameterizedFunction,
    ValueSpecification,
};
use serde_json::Value;

/// Context handed to functions while compiling and resolving.
#[derive(Clone)]
pub struct FunctionCompilationContext {
    target_resolver: Arc<dyn ComputationTargetResolver>,
    globals: HashMap<String, Value>,
}

impl Default for FunctionCompilationContext {
    fn default() -> Self {
        Self::new(Arc::new(InMemoryComputationTargetResolver::new()))
    }
}

impl FunctionCompilationContext {
    pub fn new(target_resolver: Arc<dyn ComputationTargetResolver>) -> Self {
        Self {
            target_resolver,
            globals: HashMap::new(),
        }
    }

    /// Set a context value visible to every function.
    pub fn with_global(mut self, key: impl Into<String>, value: Value) -> Self {
        self.globals.insert(key.into(), value);
        self
    }

    pub fn global(&self, key: &str) -> Option<&Value> {
        self.globals.get(key)
    }

    pub fn target_resolver(&self) -> &Arc<dyn ComputationTargetResolver> {
        &self.target_resolver
    }
}

impl fmt::Debug for FunctionCompilationContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionCompilationContext")
            .field("globals", &self.globals.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// A function compiled for a particular instant.
///
/// Resolution asks it which values it can produce on a target; the answer is
/// the function's maximal result set.
pub trait CompiledFunctionDefinition: Send + Sync {
    /// Unique identifier for this function.
    fn function_id(&self) -> FunctionId;

    /// Parameters this instance was configured with.
    fn parameters(&self) -> FunctionParameters {
        FunctionParameters::empty()
    }

    /// The type of target this function is declared on.
    fn target_type(&self) -> ComputationTargetType;

    /// Finer applicability check, run after the type check.
    fn can_apply_to(&self, context: &FunctionCompilationContext, target: &ComputationTarget) -> bool {
        let _ = (context, target);
        true
    }

    /// Everything this function could produce on `target`.
    fn results(
        &self,
        context: &FunctionCompilationContext,
        target: &ComputationTarget,
    ) -> anyhow::Result<Vec<ValueSpecification>>;

    fn earliest_invocation_time(&self) -> Option<SystemTime> {
        None
    }

    fn latest_invocation_time(&self) -> Option<SystemTime> {
        None
    }

    /// Whether the compiled form may be used at `at`.
    fn is_valid_at(&self, at: SystemTime) -> bool {
        self.earliest_invocation_time().map_or(true, |from| from <= at)
            && self.latest_invocation_time().map_or(true, |to| at <= to)
    }

    fn parameterized_function(&self) -> ParameterizedFunction {
        ParameterizedFunction::new(self.function_id(), self.parameters())
    }
}

/// An uncompiled function.
pub trait FunctionDefinition: Send + Sync {
    fn function_id(&self) -> FunctionId;

    /// Compile for use at `at`.
    fn compile(
        &self,
        context: &FunctionCompilationContext,
        at: SystemTime,
    ) -> anyhow::Result<Arc<dyn CompiledFunctionDefinition>>;
}

/// A definition whose compiled form does not depend on the instant.
#[derive(Clone)]
pub struct StaticFunctionDefinition(Arc<dyn CompiledFunctionDefinition>);

impl StaticFunctionDefinition {
    pub fn new(function: Arc<dyn CompiledFunctionDefinition>) -> Self {
        Self(function)
    }
}

impl FunctionDefinition for StaticFunctionDefinition {
    fn function_id(&self) -> FunctionId {
        self.0.function_id()
    }

    fn compile(
        &self,
        _context: &FunctionCompilationContext,
        _at: SystemTime,
    ) -> anyhow::Result<Arc<dyn CompiledFunctionDefinition>> {
        Ok(Arc::clone(&self.0))
    }
}

/// All function definitions known to a process.
#[derive(Clone, Default)]
pub struct FunctionRepository {
    functions: Vec<Arc<dyn FunctionDefinition>>,
}

impl FunctionRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, function: Arc<dyn FunctionDefinition>) {
        self.functions.push(function);
    }

    /// Add a function (builder pattern).
    pub fn with_function(mut self, function: Arc<dyn FunctionDefinition>) -> Self {
        self.add(function);
        self
    }

    pub fn functions(&self) -> &[Arc<dyn FunctionDefinition>] {
        &self.functions
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }
}

impl fmt::Debug for FunctionRepository {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionRepository")
            .field(
                "functions",
                &self.functions.iter().map(|d| d.function_id()).collect::<Vec<_>>(),
            )
            .finish()
    }
}
