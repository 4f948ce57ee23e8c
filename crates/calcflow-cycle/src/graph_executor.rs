//! The seam between a cycle and whatever runs its jobs.

use std::collections::HashMap;
use std::sync::Arc;

use calcflow_core::{DependencyGraph, FunctionParameters, NodeId, UniqueId};
use crossbeam_channel::Sender;
use tracing::debug;

use crate::cache::ViewComputationCache;
use crate::job::{CalculationJob, CalculationJobItem, CalculationJobResult};

/// The subset of a configuration's graph a cycle still needs to run.
#[derive(Debug, Clone)]
pub struct ExecutableGraph {
    pub calculation_configuration: String,
    pub cycle_id: UniqueId,
    pub valuation_time: u64,
    pub graph: Arc<DependencyGraph>,
    /// Nodes to execute, topologically ordered.
    pub nodes: Vec<NodeId>,
    /// Parameters replacing the graph's own for this cycle.
    pub parameters: HashMap<NodeId, FunctionParameters>,
}

impl ExecutableGraph {
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Job item for `node`, carrying cycle-specific parameters when present.
    pub fn job_item(&self, node: NodeId) -> Option<CalculationJobItem> {
        let dependency_node = self.graph.node(node)?;
        let function = match self.parameters.get(&node) {
            Some(parameters) => dependency_node.function().with_parameters(parameters.clone()),
            None => dependency_node.function().clone(),
        };
        Some(CalculationJobItem {
            node,
            function,
            target: dependency_node.target().clone(),
            inputs: dependency_node.inputs().to_vec(),
            outputs: dependency_node.outputs().to_vec(),
        })
    }
}

/// Progress events sent from executor workers to the cycle.
#[derive(Debug, Clone)]
pub enum ExecutionEvent {
    JobCompleted {
        job: CalculationJob,
        result: CalculationJobResult,
    },
    GraphCompleted {
        calculation_configuration: String,
    },
    GraphFailed {
        calculation_configuration: String,
        message: String,
    },
}

/// Producer end of the cycle's event queue.
#[derive(Debug, Clone)]
pub struct ExecutionEventSink {
    sender: Sender<ExecutionEvent>,
}

impl ExecutionEventSink {
    pub fn new(sender: Sender<ExecutionEvent>) -> Self {
        Self { sender }
    }

    pub fn job_completed(&self, job: CalculationJob, result: CalculationJobResult) {
        self.send(ExecutionEvent::JobCompleted { job, result });
    }

    pub fn graph_completed(&self, calculation_configuration: impl Into<String>) {
        self.send(ExecutionEvent::GraphCompleted {
            calculation_configuration: calculation_configuration.into(),
        });
    }

    pub fn graph_failed(&self, calculation_configuration: impl Into<String>, message: impl Into<String>) {
        self.send(ExecutionEvent::GraphFailed {
            calculation_configuration: calculation_configuration.into(),
            message: message.into(),
        });
    }

    fn send(&self, event: ExecutionEvent) {
        // The cycle stops listening once interrupted.
        if self.sender.send(event).is_err() {
            debug!("execution_event_dropped");
        }
    }
}

/// Handle on one submitted graph.
pub trait ExecutionHandle: Send {
    /// Request cancellation. Returns false if the graph had already finished.
    fn cancel(&self, may_interrupt: bool) -> bool;

    fn is_done(&self) -> bool;
}

/// Runs executable graphs, reporting through the sink.
pub trait DependencyGraphExecutor: Send + Sync {
    fn execute(
        &self,
        graph: ExecutableGraph,
        cache: Arc<ViewComputationCache>,
        sink: ExecutionEventSink,
    ) -> Box<dyn ExecutionHandle>;
}
