//! A single computation cycle over a compiled view.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use calcflow_core::{
    FunctionParameters, NodeId, ParameterizedFunction, UniqueId, ValueSpecification,
};
use crossbeam_channel::{Receiver, Sender};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::cache::{CachedValue, ComputedValue, ViewComputationCache};
use crate::context::ViewProcessContext;
use crate::cycle_executor::CycleExecutor;
use crate::delta::{DeltaCalculator, FunctionParametersDelta};
use crate::error::{CycleError, CycleResult};
use crate::job::{
    CalculationJobResultItem, DependencyNodeJobExecutionResult,
    DependencyNodeJobExecutionResultCache, InvocationResult,
};
use crate::log::{
    AggregatedExecutionLog, ExecutionLog, ExecutionLogMode, ExecutionLogWithContext, LogLevel,
};
use crate::market_data::MarketDataSnapshot;
use crate::result::{ComputationResultListener, ComputedValueResult, ViewComputationResultModel};
use crate::state::{NodeStateFlag, ViewCycleState};
use crate::view::{CompiledCalculationConfiguration, CompiledViewDefinition, ViewCycleExecutionOptions};

/// Compute node id recorded against market data entries.
const MARKET_DATA_NODE: &str = "market-data";

/// Names a set of values within one calculation configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComputationCycleQuery {
    pub calculation_configuration: String,
    pub specifications: Vec<ValueSpecification>,
}

impl ComputationCycleQuery {
    pub fn new(
        calculation_configuration: impl Into<String>,
        specifications: impl IntoIterator<Item = ValueSpecification>,
    ) -> Self {
        Self {
            calculation_configuration: calculation_configuration.into(),
            specifications: specifications.into_iter().collect(),
        }
    }
}

/// Interrupts a cycle from another thread.
#[derive(Debug, Clone)]
pub struct InterruptHandle {
    sender: Sender<()>,
}

impl InterruptHandle {
    pub fn interrupt(&self) {
        // A pending interrupt is enough.
        let _ = self.sender.try_send(());
    }
}

/// Cycle-scoped state of one calculation configuration.
#[derive(Debug)]
pub(crate) struct ConfigurationState {
    pub(crate) cache: Arc<ViewComputationCache>,
    pub(crate) job_results: DependencyNodeJobExecutionResultCache,
    pub(crate) node_states: DashMap<NodeId, NodeStateFlag>,
}

/// One evaluation of a compiled view at a valuation instant.
///
/// ```text
/// new -> pre_execute -> execute -> post_execute -> release
/// ```
///
/// Node states, caches and execution records live here rather than on the
/// graph, so one compiled view can serve any number of cycles.
pub struct SingleComputationCycle {
    pub(crate) cycle_id: UniqueId,
    pub(crate) context: Arc<ViewProcessContext>,
    pub(crate) view: Arc<CompiledViewDefinition>,
    pub(crate) options: ViewCycleExecutionOptions,
    pub(crate) listener: Arc<dyn ComputationResultListener>,
    pub(crate) configurations: BTreeMap<String, ConfigurationState>,
    pub(crate) function_parameters: HashMap<String, HashMap<ValueSpecification, FunctionParameters>>,
    pub(crate) result_model: ViewComputationResultModel,
    pub(crate) interrupts: Receiver<()>,
    interrupt_sender: Sender<()>,
    state: ViewCycleState,
    executed: bool,
    started: Option<Instant>,
    duration: Option<Duration>,
}

impl SingleComputationCycle {
    pub fn new(
        cycle_id: UniqueId,
        context: Arc<ViewProcessContext>,
        view: Arc<CompiledViewDefinition>,
        options: ViewCycleExecutionOptions,
        listener: Arc<dyn ComputationResultListener>,
    ) -> Self {
        let (interrupt_sender, interrupts) = crossbeam_channel::bounded(1);
        let result_model = ViewComputationResultModel::new(cycle_id.clone(), options.valuation_time);
        Self {
            cycle_id,
            context,
            view,
            options,
            listener,
            configurations: BTreeMap::new(),
            function_parameters: HashMap::new(),
            result_model,
            interrupts,
            interrupt_sender,
            state: ViewCycleState::AwaitingExecution,
            executed: false,
            started: None,
            duration: None,
        }
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Prepare caches, market data and delta reuse.
    ///
    /// Returns `Ok(false)` when execution was suppressed for lack of market
    /// data; the suppressed terminal outputs are already in the result model.
    pub fn pre_execute(
        &mut self,
        previous: Option<&SingleComputationCycle>,
        snapshot: &dyn MarketDataSnapshot,
        suppress_on_no_market_data: bool,
    ) -> CycleResult<bool> {
        if self.state != ViewCycleState::AwaitingExecution {
            return Err(CycleError::InvalidState {
                operation: "pre-execute",
                state: self.state,
            });
        }
        if let Some(previous) = previous {
            if previous.state != ViewCycleState::Executed {
                return Err(CycleError::PreviousCycleNotExecuted {
                    state: previous.state,
                });
            }
        }

        self.started = Some(Instant::now());
        self.state = ViewCycleState::Executing;
        info!(
            cycle = %self.cycle_id,
            view = %self.view.definition().name,
            valuation_time = self.options.valuation_time,
            reuse = previous.is_some(),
            "cycle_pre_execute"
        );

        self.create_caches();
        if !self.prepare_inputs(snapshot, suppress_on_no_market_data) {
            return Ok(false);
        }
        self.function_parameters = self.build_function_parameters();
        if let Some(previous) = previous {
            self.reuse_previous(previous);
        }
        Ok(true)
    }

    /// Run every outstanding node. At most once per cycle.
    pub fn execute(&mut self) -> CycleResult<()> {
        if self.executed {
            return Err(CycleError::AlreadyExecuted);
        }
        if self.state != ViewCycleState::Executing {
            return Err(CycleError::InvalidState {
                operation: "execute",
                state: self.state,
            });
        }
        self.executed = true;

        let outcome = CycleExecutor::new(self).execute();
        match outcome {
            Err(CycleError::Interrupted) => {
                self.state = ViewCycleState::ExecutionInterrupted;
                warn!(cycle = %self.cycle_id, "cycle_interrupted");
                Err(CycleError::Interrupted)
            }
            other => other,
        }
    }

    /// Stamp timings and mark the cycle executed.
    pub fn post_execute(&mut self) -> CycleResult<()> {
        if self.state != ViewCycleState::Executing {
            return Err(CycleError::InvalidState {
                operation: "post-execute",
                state: self.state,
            });
        }
        let duration = self.started.map(|started| started.elapsed()).unwrap_or_default();
        let calculation_time = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_millis() as u64)
            .unwrap_or_default();
        self.duration = Some(duration);
        self.result_model.calculation_time = Some(calculation_time);
        self.result_model.duration = Some(duration);
        self.state = ViewCycleState::Executed;
        info!(
            cycle = %self.cycle_id,
            duration_ms = duration.as_millis() as u64,
            results = self.result_model.len(),
            "cycle_executed"
        );
        Ok(())
    }

    /// Dump caches if configured, then drop them.
    pub fn release(&mut self) -> CycleResult<()> {
        if self.state == ViewCycleState::Destroyed {
            return Err(CycleError::AlreadyReleased);
        }
        if self.view.definition().dump_computation_cache_to_disk && self.state.has_caches() {
            if let Err(err) = self.dump_computation_caches() {
                warn!(cycle = %self.cycle_id, error = %err, "computation_cache_dump_failed");
            }
        }
        self.context.cache_source().release_caches(&self.cycle_id);
        self.configurations.clear();
        self.state = ViewCycleState::Destroyed;
        info!(cycle = %self.cycle_id, "cycle_released");
        Ok(())
    }

    /// Write each configuration's cache as sorted JSON to a temp file.
    pub fn dump_computation_caches(&self) -> CycleResult<Vec<PathBuf>> {
        let directory = self.view.definition().dump_directory.as_ref();
        let mut paths = Vec::with_capacity(self.configurations.len());
        for (name, state) in &self.configurations {
            let values: BTreeMap<String, CachedValue> = state
                .cache
                .all_values()
                .into_iter()
                .map(|value| (value.specification.to_string(), value.value))
                .collect();

            let prefix = format!("computation-cache-{name}-");
            let mut builder = tempfile::Builder::new();
            builder.prefix(&prefix).suffix(".txt");
            let mut file = match directory {
                Some(directory) => builder.tempfile_in(directory)?,
                None => builder.tempfile()?,
            };
            serde_json::to_writer_pretty(&mut file, &values)?;
            let (_, path) = file.keep().map_err(|err| err.error)?;

            info!(
                cycle = %self.cycle_id,
                config = %name,
                entries = values.len(),
                path = %path.display(),
                "computation_cache_dumped"
            );
            paths.push(path);
        }
        Ok(paths)
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// Cached values for the query's specifications; absent entries are skipped.
    pub fn query_computation_caches(&self, query: &ComputationCycleQuery) -> CycleResult<Vec<ComputedValue>> {
        let state = self.configuration_state("query", &query.calculation_configuration)?;
        Ok(state
            .cache
            .get_values(&query.specifications)
            .into_iter()
            .filter_map(|(spec, value)| value.map(|value| ComputedValue::new(spec, value)))
            .collect())
    }

    /// Cached values joined with their execution records.
    pub fn query_results(
        &self,
        query: &ComputationCycleQuery,
    ) -> CycleResult<HashMap<ValueSpecification, ComputedValueResult>> {
        let state = self.configuration_state("query", &query.calculation_configuration)?;
        Ok(Self::results_for(state, &query.specifications))
    }

    fn results_for(
        state: &ConfigurationState,
        specifications: &[ValueSpecification],
    ) -> HashMap<ValueSpecification, ComputedValueResult> {
        specifications
            .iter()
            .map(|spec| {
                let value = state
                    .cache
                    .get_value(spec)
                    .unwrap_or_else(CachedValue::evaluation_error);
                let computed = ComputedValue::new(spec.clone(), value);
                let result = match state.job_results.get(spec) {
                    Some(record) => ComputedValueResult::with_record(computed, &record),
                    None => ComputedValueResult::of(computed),
                };
                (spec.clone(), result)
            })
            .collect()
    }

    fn configuration_state(&self, operation: &'static str, name: &str) -> CycleResult<&ConfigurationState> {
        if !self.state.has_caches() {
            return Err(CycleError::InvalidState {
                operation,
                state: self.state,
            });
        }
        self.configurations
            .get(name)
            .ok_or_else(|| CycleError::UnknownCalculationConfiguration {
                name: name.to_string(),
            })
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn cycle_id(&self) -> &UniqueId {
        &self.cycle_id
    }

    pub fn state(&self) -> ViewCycleState {
        self.state
    }

    /// Wall time from `pre_execute` to `post_execute`.
    pub fn duration(&self) -> Option<Duration> {
        self.duration
    }

    pub fn result_model(&self) -> &ViewComputationResultModel {
        &self.result_model
    }

    pub fn view(&self) -> &Arc<CompiledViewDefinition> {
        &self.view
    }

    pub fn node_state(&self, calculation_configuration: &str, node: NodeId) -> Option<NodeStateFlag> {
        self.configurations
            .get(calculation_configuration)?
            .node_states
            .get(&node)
            .map(|flag| *flag)
    }

    pub fn computation_cache(&self, calculation_configuration: &str) -> Option<Arc<ViewComputationCache>> {
        self.configurations
            .get(calculation_configuration)
            .map(|state| Arc::clone(&state.cache))
    }

    /// Parameters attached to `specification`'s producer for this cycle.
    pub fn function_parameters(
        &self,
        calculation_configuration: &str,
        specification: &ValueSpecification,
    ) -> Option<&FunctionParameters> {
        self.function_parameters
            .get(calculation_configuration)?
            .get(specification)
    }

    pub fn interrupt_handle(&self) -> InterruptHandle {
        InterruptHandle {
            sender: self.interrupt_sender.clone(),
        }
    }

    // =========================================================================
    // Preparation
    // =========================================================================

    fn create_caches(&mut self) {
        for config in self.view.configurations() {
            let cache = self
                .context
                .cache_source()
                .get_cache(&self.cycle_id, config.name());
            self.configurations.insert(
                config.name().to_string(),
                ConfigurationState {
                    cache,
                    job_results: DependencyNodeJobExecutionResultCache::new(),
                    node_states: DashMap::new(),
                },
            );
        }
    }

    /// Load market data into every configuration's shared tier.
    fn prepare_inputs(&mut self, snapshot: &dyn MarketDataSnapshot, suppress_on_no_market_data: bool) -> bool {
        let view = Arc::clone(&self.view);
        let requirements: HashSet<ValueSpecification> = view
            .configurations()
            .flat_map(|config| config.graph().market_data_requirements())
            .collect();
        let data = if requirements.is_empty() {
            HashMap::new()
        } else {
            snapshot.query(&requirements)
        };
        info!(
            cycle = %self.cycle_id,
            requested = requirements.len(),
            available = data.len(),
            "market_data_loaded"
        );

        if suppress_on_no_market_data && data.is_empty() && !requirements.is_empty() {
            warn!(cycle = %self.cycle_id, "cycle_suppressed_no_market_data");
            self.suppress_terminal_outputs();
            return false;
        }

        let mut fragment = self.result_model.fragment();
        for config in view.configurations() {
            let operation = config.market_data_shift().and_then(|expression| {
                match self.context.override_compiler().compile(expression) {
                    Ok(operation) => Some(operation),
                    Err(err) => {
                        warn!(
                            config = config.name(),
                            expression,
                            error = %err,
                            "market_data_shift_invalid"
                        );
                        None
                    }
                }
            });
            let Some(state) = self.configurations.get(config.name()) else {
                continue;
            };
            let graph = config.graph();
            let mut values = Vec::new();
            for spec in graph.market_data_requirements() {
                let value = match (data.get(&spec).cloned(), &operation) {
                    (None, _) => Err("missing market data"),
                    (Some(value), Some(operation)) => operation
                        .apply(&spec, value)
                        .ok_or("market data discarded by shift"),
                    (Some(value), None) => Ok(value),
                };
                let result = match value {
                    Ok(value) => {
                        let computed = ComputedValue::new(spec.clone(), value);
                        values.push(computed.clone());
                        ComputedValueResult::of(computed)
                    }
                    Err(reason) => {
                        let computed = ComputedValue::new(spec.clone(), CachedValue::missing_market_data());
                        values.push(computed.clone());
                        let record = self.missing_market_data_record(&spec, reason);
                        state.job_results.put(spec.clone(), Arc::clone(&record));
                        ComputedValueResult::with_record(computed, &record)
                    }
                };

                if let Some(requirements) = graph.terminal_outputs().get(&spec) {
                    fragment.add_terminal_value(config.name(), result.clone(), requirements);
                    self.result_model
                        .add_terminal_value(config.name(), result.clone(), requirements);
                }
                fragment.add_market_data(result.clone());
                self.result_model.add_market_data(result);
            }
            debug!(config = config.name(), values = values.len(), "market_data_cached");
            state.cache.put_shared_values(values);
        }
        self.listener.result_available(fragment);
        true
    }

    fn missing_market_data_record(
        &self,
        spec: &ValueSpecification,
        reason: &str,
    ) -> Arc<DependencyNodeJobExecutionResult> {
        let log = ExecutionLog::single(LogLevel::Warn, format!("{reason} {spec}"));
        let mode = self.context.log_mode_source().mode(spec);
        let aggregated = AggregatedExecutionLog::aggregate(
            mode,
            ExecutionLogWithContext::new(
                ParameterizedFunction::market_data_sourcing(),
                spec.target().clone(),
                log.clone(),
            ),
            &[],
            &[],
            &[],
        );
        let job_result = CalculationJobResultItem {
            result: InvocationResult::MissingInputs,
            log,
            missing_inputs: Vec::new(),
            missing_outputs: vec![spec.clone()],
        };
        Arc::new(DependencyNodeJobExecutionResult::new(
            MARKET_DATA_NODE,
            job_result,
            aggregated,
        ))
    }

    fn suppress_terminal_outputs(&mut self) {
        let mut fragment = self.result_model.fragment();
        let view = Arc::clone(&self.view);
        for config in view.configurations() {
            for (spec, requirements) in config.graph().terminal_outputs() {
                let result =
                    ComputedValueResult::of(ComputedValue::new(spec.clone(), CachedValue::suppressed()));
                fragment.add_terminal_value(config.name(), result.clone(), requirements);
                self.result_model
                    .add_terminal_value(config.name(), result, requirements);
            }
        }
        self.listener.result_available(fragment);
    }

    /// Per-configuration parameters for specifications named by a selector.
    fn build_function_parameters(&self) -> HashMap<String, HashMap<ValueSpecification, FunctionParameters>> {
        self.view
            .configurations()
            .map(|config| (config.name().to_string(), self.selection_parameters(config)))
            .collect()
    }

    fn selection_parameters(
        &self,
        config: &CompiledCalculationConfiguration,
    ) -> HashMap<ValueSpecification, FunctionParameters> {
        let mut parameters = HashMap::new();
        for (selector, specifications) in config.market_data_selections() {
            let selected = self
                .options
                .function_parameters
                .get(selector)
                .or_else(|| config.selection_parameters().get(selector))
                .cloned()
                .unwrap_or_else(FunctionParameters::empty);
            for spec in specifications {
                if config.graph().producer_of(spec).is_some() {
                    parameters.insert(spec.clone(), selected.clone());
                }
            }
        }
        parameters
    }

    // =========================================================================
    // Delta reuse
    // =========================================================================

    fn reuse_previous(&mut self, previous: &SingleComputationCycle) {
        let empty = HashMap::new();
        let mut fragment = self.result_model.fragment();
        let view = Arc::clone(&self.view);

        for config in view.configurations() {
            let name = config.name();
            let (Some(previous_state), Some(previous_config), Some(state)) = (
                previous.configurations.get(name),
                previous.view.configuration(name),
                self.configurations.get(name),
            ) else {
                continue;
            };
            let graph = config.graph();
            let previous_graph = previous_config.graph();

            let dirty = FunctionParametersDelta::compute(
                previous.function_parameters.get(name).unwrap_or(&empty),
                self.function_parameters.get(name).unwrap_or(&empty),
            );
            let delta =
                DeltaCalculator::new(graph, &state.cache, &previous_state.cache, &dirty).compute_delta();
            info!(
                config = name,
                changed = delta.changed.len(),
                total = graph.node_count(),
                dirty = dirty.len(),
                "delta_reuse"
            );

            let mut reused = 0usize;
            for &node_id in graph.topological_order() {
                if !delta.unchanged.contains(&node_id) {
                    continue;
                }
                let Some(node) = graph.node(node_id) else {
                    continue;
                };
                if node.is_market_data_sourcing() {
                    continue;
                }
                let Some(previous_node) = node
                    .primary_output()
                    .and_then(|output| previous_graph.producer_of(output))
                else {
                    continue;
                };
                let Some(flag) = previous_state.node_states.get(&previous_node).map(|flag| *flag) else {
                    continue;
                };

                let mode = self.context.log_mode_source().mode_for(node.outputs());
                let captured = node
                    .primary_output()
                    .and_then(|output| previous_state.job_results.get(output))
                    .is_some_and(|record| record.aggregated_log.has_captured_events());
                if mode == ExecutionLogMode::Full && !captured {
                    continue;
                }

                state.node_states.insert(node_id, flag);
                for output in node.outputs() {
                    if let Some(record) = previous_state.job_results.get(output) {
                        state.job_results.put(output.clone(), record);
                    }
                }

                match flag {
                    NodeStateFlag::Executed => {
                        let results = Self::results_for(previous_state, node.outputs());
                        for (spec, result) in results {
                            state
                                .cache
                                .put_shared_value(ComputedValue::new(spec.clone(), result.value.clone()));
                            if let Some(requirements) = graph.terminal_outputs().get(&spec) {
                                fragment.add_terminal_value(name, result.clone(), requirements);
                                self.result_model.add_terminal_value(name, result, requirements);
                            }
                        }
                    }
                    NodeStateFlag::Failed | NodeStateFlag::Suppressed => {
                        state.cache.put_shared_values(
                            node.outputs()
                                .iter()
                                .map(|output| ComputedValue::new(output.clone(), CachedValue::suppressed())),
                        );
                    }
                }
                reused += 1;
            }
            debug!(config = name, reused, "delta_nodes_reused");
        }

        if !fragment.is_empty() {
            self.listener.result_available(fragment);
        }
    }
}
