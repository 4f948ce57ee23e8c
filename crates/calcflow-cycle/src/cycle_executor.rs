//! Drives one cycle's executable graphs to completion.
//!
//! Graphs for every configuration are submitted up front. Progress comes
//! back as [`ExecutionEvent`]s on a single channel consumed here, so the
//! result model is only touched from the calling thread.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::select;
use tracing::{debug, error, info, warn};

use crate::cache::{CachedValue, ComputedValue, ViewComputationCache};
use crate::cycle::SingleComputationCycle;
use crate::error::{CycleError, CycleResult};
use crate::graph_executor::{ExecutableGraph, ExecutionEvent, ExecutionEventSink, ExecutionHandle};
use crate::job::{
    CalculationJob, CalculationJobItem, CalculationJobResult, CalculationJobResultItem,
    CalculationJobSpecification, DependencyNodeJobExecutionResult,
};
use crate::log::{AggregatedExecutionLog, ExecutionLog, ExecutionLogWithContext};
use crate::result::ComputedValueResult;
use crate::state::NodeStateFlag;
use crate::view::CompiledCalculationConfiguration;

/// Compute node id recorded against blacklisted nodes.
const BLACKLIST_NODE: &str = "blacklist";

/// Compute node id recorded against nodes whose graph never completed.
const EXECUTOR_NODE: &str = "executor";

pub(crate) struct CycleExecutor<'a> {
    cycle: &'a mut SingleComputationCycle,
}

impl<'a> CycleExecutor<'a> {
    pub(crate) fn new(cycle: &'a mut SingleComputationCycle) -> Self {
        Self { cycle }
    }

    pub(crate) fn execute(mut self) -> CycleResult<()> {
        let (sender, events) = crossbeam_channel::unbounded();
        let sink = ExecutionEventSink::new(sender);
        let view = Arc::clone(&self.cycle.view);

        let mut handles: HashMap<String, Box<dyn ExecutionHandle>> = HashMap::new();
        let mut pending: HashSet<String> = HashSet::new();
        let mut submitted: HashMap<String, ExecutableGraph> = HashMap::new();
        for config in view.configurations() {
            let Some(graph) = self.executable_graph(config) else {
                continue;
            };
            if graph.is_empty() {
                debug!(config = config.name(), "executable_graph_empty");
                continue;
            }
            let Some(cache) = self.cycle.computation_cache(config.name()) else {
                continue;
            };
            info!(
                cycle = %self.cycle.cycle_id,
                config = config.name(),
                nodes = graph.len(),
                total = config.graph().node_count(),
                "graph_submitted"
            );
            let handle = self
                .cycle
                .context
                .graph_executor()
                .execute(graph.clone(), cache, sink.clone());
            handles.insert(config.name().to_string(), handle);
            pending.insert(config.name().to_string());
            submitted.insert(config.name().to_string(), graph);
        }
        drop(sink);

        let interrupts = self.cycle.interrupts.clone();
        while !pending.is_empty() {
            if interrupts.try_recv().is_ok() {
                return Err(Self::cancel(&handles));
            }
            select! {
                recv(events) -> event => match event {
                    Ok(ExecutionEvent::JobCompleted { job, result }) => {
                        self.job_completed(&job, &result);
                    }
                    Ok(ExecutionEvent::GraphCompleted { calculation_configuration }) => {
                        debug!(config = %calculation_configuration, "graph_completed");
                        pending.remove(&calculation_configuration);
                    }
                    Ok(ExecutionEvent::GraphFailed { calculation_configuration, message }) => {
                        error!(config = %calculation_configuration, message = %message, "graph_failed");
                        if pending.remove(&calculation_configuration) {
                            if let Some(graph) = submitted.get(&calculation_configuration) {
                                self.fail_outstanding(graph, &message);
                            }
                        }
                    }
                    Err(_) => {
                        error!(outstanding = pending.len(), "execution_events_disconnected");
                        for name in pending.drain() {
                            if let Some(graph) = submitted.get(&name) {
                                self.fail_outstanding(graph, "executor stopped before completing the graph");
                            }
                        }
                    }
                },
                recv(interrupts) -> _ => {
                    return Err(Self::cancel(&handles));
                }
            }
        }
        Ok(())
    }

    fn cancel(handles: &HashMap<String, Box<dyn ExecutionHandle>>) -> CycleError {
        let cancelled = handles
            .values()
            .filter(|handle| !handle.is_done())
            .filter(|handle| handle.cancel(true))
            .count();
        warn!(cancelled, "execution_cancelled");
        CycleError::Interrupted
    }

    /// The configuration's graph minus market data, reused and blacklisted nodes.
    fn executable_graph(&mut self, config: &CompiledCalculationConfiguration) -> Option<ExecutableGraph> {
        let name = config.name();
        let graph = config.graph();
        let state = self.cycle.configurations.get(name)?;
        let blacklist = Arc::clone(self.cycle.context.blacklist());
        let log_modes = self.cycle.context.log_mode_source();
        let overrides = self.cycle.function_parameters.get(name);

        let mut fragment = self.cycle.result_model.fragment();
        let mut nodes = Vec::new();
        let mut parameters = HashMap::new();
        for &id in graph.topological_order() {
            let Some(node) = graph.node(id) else {
                continue;
            };
            if node.is_market_data_sourcing() {
                state.node_states.insert(id, NodeStateFlag::Executed);
                continue;
            }
            if state.node_states.contains_key(&id) {
                continue;
            }

            if !blacklist.is_empty() && blacklist.is_blacklisted_node(node) {
                debug!(config = name, node = %node, "node_blacklisted");
                state.cache.put_private_values(
                    node.outputs()
                        .iter()
                        .map(|output| ComputedValue::new(output.clone(), CachedValue::suppressed())),
                );
                state.node_states.insert(id, NodeStateFlag::Suppressed);
                let record = Arc::new(DependencyNodeJobExecutionResult::new(
                    BLACKLIST_NODE,
                    CalculationJobResultItem::suppressed(),
                    AggregatedExecutionLog::empty(log_modes.mode_for(node.outputs())),
                ));
                for output in node.outputs() {
                    state.job_results.put(output.clone(), Arc::clone(&record));
                    if let Some(requirements) = graph.terminal_outputs().get(output) {
                        let result = ComputedValueResult::with_record(
                            ComputedValue::new(output.clone(), CachedValue::suppressed()),
                            &record,
                        );
                        fragment.add_terminal_value(name, result.clone(), requirements);
                        self.cycle
                            .result_model
                            .add_terminal_value(name, result, requirements);
                    }
                }
                continue;
            }

            if let Some(selected) = overrides
                .and_then(|overrides| node.outputs().iter().find_map(|output| overrides.get(output)))
            {
                parameters.insert(id, selected.clone());
            }
            nodes.push(id);
        }

        if !fragment.is_empty() {
            self.cycle.listener.result_available(fragment);
        }

        Some(ExecutableGraph {
            calculation_configuration: name.to_string(),
            cycle_id: self.cycle.cycle_id.clone(),
            valuation_time: self.cycle.options.valuation_time,
            graph: Arc::clone(graph),
            nodes,
            parameters,
        })
    }

    /// Record every submitted node without a state as failed, as if its job
    /// had returned a failure.
    fn fail_outstanding(&mut self, graph: &ExecutableGraph, message: &str) {
        let name = graph.calculation_configuration.as_str();
        let Some(state) = self.cycle.configurations.get(name) else {
            return;
        };
        let items: Vec<CalculationJobItem> = graph
            .nodes
            .iter()
            .filter(|node| !state.node_states.contains_key(*node))
            .filter_map(|node| graph.job_item(*node))
            .collect();
        if items.is_empty() {
            return;
        }
        warn!(config = name, nodes = items.len(), "outstanding_nodes_failed");
        write_evaluation_errors(&state.cache, &items);

        let results = items
            .iter()
            .map(|item| {
                let mut log = ExecutionLog::new();
                log.set_exception(message);
                CalculationJobResultItem::failure(log, item.outputs.clone())
            })
            .collect();
        let job = CalculationJob {
            specification: CalculationJobSpecification {
                cycle_id: graph.cycle_id.clone(),
                calculation_configuration: name.to_string(),
                valuation_time: graph.valuation_time,
                job_id: 0,
            },
            items,
        };
        let result = CalculationJobResult {
            specification: job.specification.clone(),
            items: results,
            compute_node_id: EXECUTOR_NODE.to_string(),
            duration: Duration::ZERO,
        };
        self.job_completed(&job, &result);
    }

    fn job_completed(&mut self, job: &CalculationJob, result: &CalculationJobResult) {
        let name = job.specification.calculation_configuration.as_str();
        let view = Arc::clone(&self.cycle.view);
        let Some(config) = view.configuration(name) else {
            warn!(config = name, job = job.specification.job_id, "job_for_unknown_configuration");
            return;
        };
        let Some(state) = self.cycle.configurations.get(name) else {
            return;
        };
        let graph = config.graph();
        let log_modes = self.cycle.context.log_mode_source();

        debug!(
            config = name,
            job = job.specification.job_id,
            items = job.items.len(),
            compute_node = %result.compute_node_id,
            "job_completed"
        );

        let mut fragment = self.cycle.result_model.fragment();
        for (item, item_result) in job.items.iter().zip(&result.items) {
            let Some(node_id) = item.primary_output().and_then(|output| graph.producer_of(output)) else {
                warn!(config = name, function = %item.function, "job_item_without_node");
                continue;
            };
            let flag = if item_result.result.is_success() {
                NodeStateFlag::Executed
            } else {
                NodeStateFlag::Failed
            };
            state.node_states.insert(node_id, flag);

            let mut input_records: Vec<Arc<DependencyNodeJobExecutionResult>> = Vec::new();
            for input in &item.inputs {
                let from_function = graph
                    .producer_of(input)
                    .and_then(|producer| graph.node(producer))
                    .is_some_and(|producer| !producer.is_market_data_sourcing());
                if !from_function {
                    continue;
                }
                if let Some(record) = state.job_results.get(input) {
                    if !input_records.iter().any(|seen| Arc::ptr_eq(seen, &record)) {
                        input_records.push(record);
                    }
                }
            }
            let input_logs: Vec<&AggregatedExecutionLog> = input_records
                .iter()
                .map(|record| record.aggregated_log.as_ref())
                .collect();
            let aggregated = AggregatedExecutionLog::aggregate(
                log_modes.mode_for(&item.outputs),
                ExecutionLogWithContext::new(
                    item.function.clone(),
                    item.target.clone(),
                    item_result.log.clone(),
                ),
                &input_logs,
                &item_result.missing_inputs,
                &item_result.missing_outputs,
            );
            let record = Arc::new(DependencyNodeJobExecutionResult::new(
                result.compute_node_id.clone(),
                item_result.clone(),
                aggregated,
            ));

            for output in &item.outputs {
                state.job_results.put(output.clone(), Arc::clone(&record));
                let Some(requirements) = graph.terminal_outputs().get(output) else {
                    continue;
                };
                let Some(value) = state.cache.get_value(output) else {
                    continue;
                };
                let computed = ComputedValueResult::with_record(ComputedValue::new(output.clone(), value), &record);
                fragment.add_terminal_value(name, computed.clone(), requirements);
                self.cycle
                    .result_model
                    .add_terminal_value(name, computed, requirements);
            }
        }

        if !fragment.is_empty() {
            self.cycle.listener.result_available(fragment);
        }
    }
}

fn write_evaluation_errors(cache: &ViewComputationCache, items: &[CalculationJobItem]) {
    cache.put_private_values(items.iter().flat_map(|item| {
        item.outputs
            .iter()
            .map(|output| ComputedValue::new(output.clone(), CachedValue::evaluation_error()))
    }));
}
