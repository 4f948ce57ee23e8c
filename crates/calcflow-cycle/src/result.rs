//! Result model and listeners.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use calcflow_core::{UniqueId, ValueRequirement, ValueSpecification};
use crossbeam_channel::Sender;
use tracing::debug;

use crate::cache::{CachedValue, ComputedValue};
use crate::job::{DependencyNodeJobExecutionResult, InvocationResult};
use crate::log::AggregatedExecutionLog;

/// A cached value joined with its execution record.
#[derive(Debug, Clone, PartialEq)]
pub struct ComputedValueResult {
    pub specification: ValueSpecification,
    pub value: CachedValue,
    pub aggregated_log: Option<Arc<AggregatedExecutionLog>>,
    pub compute_node_id: Option<String>,
    pub missing_inputs: Vec<ValueSpecification>,
    pub missing_outputs: Vec<ValueSpecification>,
    pub invocation_result: Option<InvocationResult>,
}

impl ComputedValueResult {
    /// A value with no execution record (market data, suppressed outputs).
    pub fn of(value: ComputedValue) -> Self {
        Self {
            specification: value.specification,
            value: value.value,
            aggregated_log: None,
            compute_node_id: None,
            missing_inputs: Vec::new(),
            missing_outputs: Vec::new(),
            invocation_result: None,
        }
    }

    pub fn with_record(value: ComputedValue, record: &DependencyNodeJobExecutionResult) -> Self {
        Self {
            specification: value.specification,
            value: value.value,
            aggregated_log: Some(Arc::clone(&record.aggregated_log)),
            compute_node_id: Some(record.compute_node_id.clone()),
            missing_inputs: record.job_result.missing_inputs.clone(),
            missing_outputs: record.job_result.missing_outputs.clone(),
            invocation_result: Some(record.job_result.result),
        }
    }
}

/// Values computed by a cycle, grouped by calculation configuration.
///
/// Used both for the cumulative model and for streamed fragments.
#[derive(Debug, Clone, Default)]
pub struct ViewComputationResultModel {
    pub cycle_id: Option<UniqueId>,
    pub process_id: Option<UniqueId>,
    pub valuation_time: u64,
    /// Epoch milliseconds at `post_execute`.
    pub calculation_time: Option<u64>,
    pub duration: Option<Duration>,
    results: BTreeMap<String, HashMap<ValueSpecification, ComputedValueResult>>,
    market_data: HashMap<ValueSpecification, ComputedValueResult>,
    requirements: HashMap<ValueSpecification, BTreeSet<ValueRequirement>>,
}

impl ViewComputationResultModel {
    pub fn new(cycle_id: UniqueId, valuation_time: u64) -> Self {
        Self {
            cycle_id: Some(cycle_id),
            valuation_time,
            ..Default::default()
        }
    }

    /// An empty model carrying this model's identity.
    pub fn fragment(&self) -> Self {
        Self {
            cycle_id: self.cycle_id.clone(),
            process_id: self.process_id.clone(),
            valuation_time: self.valuation_time,
            ..Default::default()
        }
    }

    pub fn add_value(&mut self, calculation_configuration: &str, result: ComputedValueResult) {
        self.results
            .entry(calculation_configuration.to_string())
            .or_default()
            .insert(result.specification.clone(), result);
    }

    /// Add a value and remember which requirements it satisfies.
    pub fn add_terminal_value(
        &mut self,
        calculation_configuration: &str,
        result: ComputedValueResult,
        requirements: &BTreeSet<ValueRequirement>,
    ) {
        self.requirements
            .entry(result.specification.clone())
            .or_default()
            .extend(requirements.iter().cloned());
        self.add_value(calculation_configuration, result);
    }

    pub fn add_market_data(&mut self, result: ComputedValueResult) {
        self.market_data.insert(result.specification.clone(), result);
    }

    /// Merge `other` into this model.
    pub fn merge(&mut self, other: &ViewComputationResultModel) {
        for (config, values) in &other.results {
            let entry = self.results.entry(config.clone()).or_default();
            for (spec, value) in values {
                entry.insert(spec.clone(), value.clone());
            }
        }
        for (spec, value) in &other.market_data {
            self.market_data.insert(spec.clone(), value.clone());
        }
        for (spec, requirements) in &other.requirements {
            self.requirements
                .entry(spec.clone())
                .or_default()
                .extend(requirements.iter().cloned());
        }
    }

    pub fn value(&self, calculation_configuration: &str, specification: &ValueSpecification) -> Option<&ComputedValueResult> {
        self.results
            .get(calculation_configuration)
            .and_then(|values| values.get(specification))
    }

    pub fn values(&self, calculation_configuration: &str) -> Option<&HashMap<ValueSpecification, ComputedValueResult>> {
        self.results.get(calculation_configuration)
    }

    pub fn calculation_configurations(&self) -> impl Iterator<Item = &str> {
        self.results.keys().map(String::as_str)
    }

    pub fn market_data(&self) -> &HashMap<ValueSpecification, ComputedValueResult> {
        &self.market_data
    }

    pub fn requirements(&self, specification: &ValueSpecification) -> Option<&BTreeSet<ValueRequirement>> {
        self.requirements.get(specification)
    }

    /// Number of result values across all configurations.
    pub fn len(&self) -> usize {
        self.results.values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0 && self.market_data.is_empty()
    }
}

/// Receives result fragments as the cycle progresses.
pub trait ComputationResultListener: Send + Sync {
    fn result_available(&self, fragment: ViewComputationResultModel);
}

impl<F> ComputationResultListener for F
where
    F: Fn(ViewComputationResultModel) + Send + Sync,
{
    fn result_available(&self, fragment: ViewComputationResultModel) {
        self(fragment)
    }
}

impl ComputationResultListener for Sender<ViewComputationResultModel> {
    fn result_available(&self, fragment: ViewComputationResultModel) {
        if self.send(fragment).is_err() {
            debug!("result_listener_disconnected");
        }
    }
}

/// Discards every fragment.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopResultListener;

impl ComputationResultListener for NoopResultListener {
    fn result_available(&self, _fragment: ViewComputationResultModel) {}
}
