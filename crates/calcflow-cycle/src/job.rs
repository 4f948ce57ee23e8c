//! Calculation jobs and their results.

use std::sync::Arc;
use std::time::Duration;

use calcflow_core::{
    ComputationTargetSpecification, NodeId, ParameterizedFunction, UniqueId, ValueSpecification,
};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::log::{AggregatedExecutionLog, ExecutionLog};

/// Identifies one job within a cycle.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CalculationJobSpecification {
    pub cycle_id: UniqueId,
    pub calculation_configuration: String,
    pub valuation_time: u64,
    pub job_id: u64,
}

/// One node's worth of work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalculationJobItem {
    pub node: NodeId,
    pub function: ParameterizedFunction,
    pub target: ComputationTargetSpecification,
    pub inputs: Vec<ValueSpecification>,
    pub outputs: Vec<ValueSpecification>,
}

impl CalculationJobItem {
    pub fn primary_output(&self) -> Option<&ValueSpecification> {
        self.outputs.first()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalculationJob {
    pub specification: CalculationJobSpecification,
    pub items: Vec<CalculationJobItem>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InvocationResult {
    Success,
    FunctionThrewException,
    MissingInputs,
    Suppressed,
}

impl InvocationResult {
    pub fn is_success(self) -> bool {
        self == Self::Success
    }
}

/// Outcome of one job item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalculationJobResultItem {
    pub result: InvocationResult,
    pub log: ExecutionLog,
    pub missing_inputs: Vec<ValueSpecification>,
    pub missing_outputs: Vec<ValueSpecification>,
}

impl CalculationJobResultItem {
    pub fn success(log: ExecutionLog, missing_outputs: Vec<ValueSpecification>) -> Self {
        Self {
            result: InvocationResult::Success,
            log,
            missing_inputs: Vec::new(),
            missing_outputs,
        }
    }

    pub fn failure(log: ExecutionLog, missing_outputs: Vec<ValueSpecification>) -> Self {
        Self {
            result: InvocationResult::FunctionThrewException,
            log,
            missing_inputs: Vec::new(),
            missing_outputs,
        }
    }

    pub fn missing_inputs(
        missing_inputs: Vec<ValueSpecification>,
        outputs: Vec<ValueSpecification>,
    ) -> Self {
        Self {
            result: InvocationResult::MissingInputs,
            log: ExecutionLog::new(),
            missing_inputs,
            missing_outputs: outputs,
        }
    }

    pub fn suppressed() -> Self {
        Self {
            result: InvocationResult::Suppressed,
            log: ExecutionLog::new(),
            missing_inputs: Vec::new(),
            missing_outputs: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalculationJobResult {
    pub specification: CalculationJobSpecification,
    pub items: Vec<CalculationJobResultItem>,
    pub compute_node_id: String,
    pub duration: Duration,
}

/// Execution record kept for every output of an executed node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyNodeJobExecutionResult {
    pub compute_node_id: String,
    pub job_result: CalculationJobResultItem,
    pub aggregated_log: Arc<AggregatedExecutionLog>,
}

impl DependencyNodeJobExecutionResult {
    pub fn new(
        compute_node_id: impl Into<String>,
        job_result: CalculationJobResultItem,
        aggregated_log: AggregatedExecutionLog,
    ) -> Self {
        Self {
            compute_node_id: compute_node_id.into(),
            job_result,
            aggregated_log: Arc::new(aggregated_log),
        }
    }
}

/// Per-configuration map of output specification to execution record.
#[derive(Debug, Default)]
pub struct DependencyNodeJobExecutionResultCache {
    results: DashMap<ValueSpecification, Arc<DependencyNodeJobExecutionResult>>,
}

impl DependencyNodeJobExecutionResultCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, specification: ValueSpecification, result: Arc<DependencyNodeJobExecutionResult>) {
        self.results.insert(specification, result);
    }

    pub fn get(&self, specification: &ValueSpecification) -> Option<Arc<DependencyNodeJobExecutionResult>> {
        self.results
            .get(specification)
            .map(|entry| Arc::clone(entry.value()))
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }
}
