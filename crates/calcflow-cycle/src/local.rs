//! In-process graph executor.
//!
//! Each submitted graph runs on its own thread. Nodes are taken in
//! topological order and batched into jobs; every item is dispatched to the
//! [`FunctionInvoker`] registered for its function id. A panicking invoker
//! fails its own item only.

use std::any::Any;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use calcflow_core::{ComputationTargetSpecification, FunctionId, FunctionParameters, ValueSpecification};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::cache::{CachedValue, ComputedValue, ViewComputationCache};
use crate::graph_executor::{
    DependencyGraphExecutor, ExecutableGraph, ExecutionEventSink, ExecutionHandle,
};
use crate::job::{
    CalculationJob, CalculationJobItem, CalculationJobResult, CalculationJobResultItem,
    CalculationJobSpecification,
};
use crate::log::ExecutionLog;

/// Configuration for [`LocalGraphExecutor`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalExecutorConfig {
    /// Reported as the compute node of every job result.
    pub compute_node_id: String,
    /// Maximum items per job.
    pub max_job_items: usize,
}

impl Default for LocalExecutorConfig {
    fn default() -> Self {
        Self {
            compute_node_id: "local".to_string(),
            max_job_items: 16,
        }
    }
}

impl LocalExecutorConfig {
    /// One node per job; every node streams its own event.
    pub fn fine_grained() -> Self {
        Self {
            max_job_items: 1,
            ..Default::default()
        }
    }

    /// Whole graph in one job.
    pub fn single_job() -> Self {
        Self {
            max_job_items: usize::MAX,
            ..Default::default()
        }
    }

    pub fn with_compute_node_id(mut self, compute_node_id: impl Into<String>) -> Self {
        self.compute_node_id = compute_node_id.into();
        self
    }
}

/// Input values for one invocation.
#[derive(Debug, Clone, Default)]
pub struct FunctionInputs {
    values: HashMap<ValueSpecification, Value>,
}

impl FunctionInputs {
    pub fn get(&self, specification: &ValueSpecification) -> Option<&Value> {
        self.values.get(specification)
    }

    /// First input with the given value name.
    pub fn value(&self, value_name: &str) -> Option<&Value> {
        self.values
            .iter()
            .find(|(spec, _)| spec.value_name() == value_name)
            .map(|(_, value)| value)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ValueSpecification, &Value)> {
        self.values.iter()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Everything a function sees when it runs.
#[derive(Debug)]
pub struct FunctionInvocation<'a> {
    pub inputs: &'a FunctionInputs,
    pub target: &'a ComputationTargetSpecification,
    pub desired_outputs: &'a [ValueSpecification],
    pub parameters: &'a FunctionParameters,
}

/// Executes one function.
pub trait FunctionInvoker: Send + Sync {
    /// Compute `desired_outputs`. Outputs left out of the result are recorded
    /// as missing.
    fn execute(
        &self,
        invocation: &FunctionInvocation<'_>,
        log: &mut ExecutionLog,
    ) -> anyhow::Result<Vec<ComputedValue>>;
}

/// Executor running graphs on background threads.
pub struct LocalGraphExecutor {
    config: LocalExecutorConfig,
    invokers: HashMap<FunctionId, Arc<dyn FunctionInvoker>>,
    next_job_id: Arc<AtomicU64>,
}

impl LocalGraphExecutor {
    pub fn new(config: LocalExecutorConfig) -> Self {
        Self {
            config,
            invokers: HashMap::new(),
            next_job_id: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn with_invoker(
        mut self,
        function_id: impl Into<FunctionId>,
        invoker: impl FunctionInvoker + 'static,
    ) -> Self {
        self.invokers.insert(function_id.into(), Arc::new(invoker));
        self
    }

    pub fn config(&self) -> &LocalExecutorConfig {
        &self.config
    }
}

impl Default for LocalGraphExecutor {
    fn default() -> Self {
        Self::new(LocalExecutorConfig::default())
    }
}

impl DependencyGraphExecutor for LocalGraphExecutor {
    fn execute(
        &self,
        graph: ExecutableGraph,
        cache: Arc<ViewComputationCache>,
        sink: ExecutionEventSink,
    ) -> Box<dyn ExecutionHandle> {
        let handle = LocalExecutionHandle::default();
        let worker = Worker {
            config: self.config.clone(),
            invokers: self.invokers.clone(),
            next_job_id: Arc::clone(&self.next_job_id),
            cancelled: Arc::clone(&handle.cancelled),
            done: Arc::clone(&handle.done),
        };
        debug!(
            config = %graph.calculation_configuration,
            nodes = graph.len(),
            "local_executor_submit"
        );
        thread::spawn(move || worker.run(graph, cache, sink));
        Box::new(handle)
    }
}

#[derive(Debug, Default)]
struct LocalExecutionHandle {
    cancelled: Arc<AtomicBool>,
    done: Arc<AtomicBool>,
}

impl ExecutionHandle for LocalExecutionHandle {
    fn cancel(&self, _may_interrupt: bool) -> bool {
        if self.done.load(Ordering::Acquire) {
            return false;
        }
        !self.cancelled.swap(true, Ordering::AcqRel)
    }

    fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }
}

struct Worker {
    config: LocalExecutorConfig,
    invokers: HashMap<FunctionId, Arc<dyn FunctionInvoker>>,
    next_job_id: Arc<AtomicU64>,
    cancelled: Arc<AtomicBool>,
    done: Arc<AtomicBool>,
}

impl Worker {
    fn run(self, graph: ExecutableGraph, cache: Arc<ViewComputationCache>, sink: ExecutionEventSink) {
        let batch = self.config.max_job_items.max(1);
        for chunk in graph.nodes.chunks(batch) {
            if self.cancelled.load(Ordering::Acquire) {
                debug!(config = %graph.calculation_configuration, "local_executor_cancelled");
                self.done.store(true, Ordering::Release);
                return;
            }

            let job = CalculationJob {
                specification: CalculationJobSpecification {
                    cycle_id: graph.cycle_id.clone(),
                    calculation_configuration: graph.calculation_configuration.clone(),
                    valuation_time: graph.valuation_time,
                    job_id: self.next_job_id.fetch_add(1, Ordering::Relaxed),
                },
                items: chunk.iter().filter_map(|node| graph.job_item(*node)).collect(),
            };

            let started = Instant::now();
            let items = job
                .items
                .iter()
                .map(|item| self.execute_item(item, &cache))
                .collect();
            let result = CalculationJobResult {
                specification: job.specification.clone(),
                items,
                compute_node_id: self.config.compute_node_id.clone(),
                duration: started.elapsed(),
            };
            sink.job_completed(job, result);
        }

        self.done.store(true, Ordering::Release);
        sink.graph_completed(graph.calculation_configuration);
    }

    fn execute_item(&self, item: &CalculationJobItem, cache: &ViewComputationCache) -> CalculationJobResultItem {
        let mut inputs = FunctionInputs::default();
        let mut missing_inputs = Vec::new();
        for input in &item.inputs {
            match cache.get_value(input) {
                Some(CachedValue::Value(value)) => {
                    inputs.values.insert(input.clone(), value);
                }
                _ => missing_inputs.push(input.clone()),
            }
        }

        if !missing_inputs.is_empty() {
            cache.put_private_values(
                item.outputs
                    .iter()
                    .map(|output| ComputedValue::new(output.clone(), CachedValue::missing_inputs())),
            );
            return CalculationJobResultItem::missing_inputs(missing_inputs, item.outputs.clone());
        }

        let mut log = ExecutionLog::new();
        let function_id = item.function.function_id();
        let outcome = match self.invokers.get(function_id) {
            Some(invoker) => {
                let invocation = FunctionInvocation {
                    inputs: &inputs,
                    target: &item.target,
                    desired_outputs: &item.outputs,
                    parameters: item.function.parameters(),
                };
                panic::catch_unwind(AssertUnwindSafe(|| invoker.execute(&invocation, &mut log)))
                    .unwrap_or_else(|payload| {
                        Err(anyhow::anyhow!("function panicked: {}", panic_message(payload.as_ref())))
                    })
            }
            None => Err(anyhow::anyhow!("no invoker registered for {function_id}")),
        };

        match outcome {
            Ok(values) => {
                let mut produced: HashMap<ValueSpecification, CachedValue> = values
                    .into_iter()
                    .map(|value| (value.specification, value.value))
                    .collect();
                let mut missing_outputs = Vec::new();
                let mut computed = Vec::with_capacity(item.outputs.len());
                for output in &item.outputs {
                    match produced.remove(output) {
                        Some(value) => computed.push(ComputedValue::new(output.clone(), value)),
                        None => {
                            missing_outputs.push(output.clone());
                            computed.push(ComputedValue::new(
                                output.clone(),
                                CachedValue::evaluation_error(),
                            ));
                        }
                    }
                }
                if !produced.is_empty() {
                    debug!(
                        function = %function_id,
                        extra = produced.len(),
                        "unrequested_outputs_discarded"
                    );
                }
                cache.put_private_values(computed);
                CalculationJobResultItem::success(log, missing_outputs)
            }
            Err(err) => {
                warn!(function = %function_id, target = %item.target, error = %err, "function_invocation_failed");
                log.set_exception(err.to_string());
                cache.put_private_values(item.outputs.iter().map(|output| {
                    ComputedValue::new(output.clone(), CachedValue::evaluation_error())
                }));
                CalculationJobResultItem::failure(log, item.outputs.clone())
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        *message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.as_str()
    } else {
        "unknown panic payload"
    }
}
