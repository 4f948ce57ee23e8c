//! Dependency graphs: one DAG of function applications per calculation
//! configuration.
//!
//! Nodes live in a petgraph arena and are addressed by [`NodeId`]. Edges run
//! from producer to consumer and carry the value specification flowing along
//! them. Topology is immutable once built; per-cycle execution state is kept
//! by the cycle, keyed by `NodeId`.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;

use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use serde::{Deserialize, Serialize};

use crate::error::{GraphError, GraphResult};
use crate::function::ParameterizedFunction;
use crate::target::ComputationTargetSpecification;
use crate::value::{ValueRequirement, ValueSpecification};

/// Identifier of a node within a [`DependencyGraph`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub usize);

impl NodeId {
    fn index(self) -> NodeIndex {
        NodeIndex::new(self.0)
    }
}

impl From<NodeIndex> for NodeId {
    fn from(index: NodeIndex) -> Self {
        Self(index.index())
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// One scheduled function application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyNode {
    function: ParameterizedFunction,
    target: ComputationTargetSpecification,
    inputs: Vec<ValueSpecification>,
    outputs: Vec<ValueSpecification>,
}

impl DependencyNode {
    pub fn new(
        function: ParameterizedFunction,
        target: ComputationTargetSpecification,
        inputs: Vec<ValueSpecification>,
        outputs: Vec<ValueSpecification>,
    ) -> Self {
        Self {
            function,
            target,
            inputs,
            outputs,
        }
    }

    /// Leaf node sourcing a single market data value.
    pub fn market_data(output: ValueSpecification) -> Self {
        Self::new(
            ParameterizedFunction::market_data_sourcing(),
            output.target().clone(),
            Vec::new(),
            vec![output],
        )
    }

    pub fn function(&self) -> &ParameterizedFunction {
        &self.function
    }

    pub fn target(&self) -> &ComputationTargetSpecification {
        &self.target
    }

    pub fn inputs(&self) -> &[ValueSpecification] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[ValueSpecification] {
        &self.outputs
    }

    /// First output; identifies the node in job results.
    pub fn primary_output(&self) -> Option<&ValueSpecification> {
        self.outputs.first()
    }

    pub fn is_market_data_sourcing(&self) -> bool {
        self.function.function_id().is_market_data_sourcing()
    }
}

impl fmt::Display for DependencyNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} on {}", self.function, self.target)
    }
}

/// DAG of dependency nodes for one calculation configuration.
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    calculation_configuration: String,
    graph: DiGraph<DependencyNode, ValueSpecification>,
    producers: HashMap<ValueSpecification, NodeId>,
    terminal_outputs: HashMap<ValueSpecification, BTreeSet<ValueRequirement>>,
    topological_order: Vec<NodeId>,
}

impl DependencyGraph {
    pub fn calculation_configuration_name(&self) -> &str {
        &self.calculation_configuration
    }

    pub fn node(&self, id: NodeId) -> Option<&DependencyNode> {
        self.graph.node_weight(id.index())
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    pub fn node_ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.graph.node_indices().map(NodeId::from)
    }

    pub fn nodes(&self) -> impl Iterator<Item = (NodeId, &DependencyNode)> + '_ {
        self.graph
            .node_indices()
            .map(|idx| (NodeId::from(idx), &self.graph[idx]))
    }

    /// The node producing `specification`.
    pub fn producer_of(&self, specification: &ValueSpecification) -> Option<NodeId> {
        self.producers.get(specification).copied()
    }

    /// Nodes whose outputs `id` consumes.
    pub fn input_nodes(&self, id: NodeId) -> Vec<NodeId> {
        let mut seen = HashSet::new();
        self.graph
            .neighbors_directed(id.index(), Direction::Incoming)
            .map(NodeId::from)
            .filter(|n| seen.insert(*n))
            .collect()
    }

    /// Nodes consuming outputs of `id`.
    pub fn dependent_nodes(&self, id: NodeId) -> Vec<NodeId> {
        let mut seen = HashSet::new();
        self.graph
            .neighbors_directed(id.index(), Direction::Outgoing)
            .map(NodeId::from)
            .filter(|n| seen.insert(*n))
            .collect()
    }

    /// Nodes nothing else consumes.
    pub fn root_nodes(&self) -> Vec<NodeId> {
        self.graph
            .externals(Direction::Outgoing)
            .map(NodeId::from)
            .collect()
    }

    /// Producers before consumers.
    pub fn topological_order(&self) -> &[NodeId] {
        &self.topological_order
    }

    /// Terminal outputs and the requirements each satisfies.
    pub fn terminal_outputs(&self) -> &HashMap<ValueSpecification, BTreeSet<ValueRequirement>> {
        &self.terminal_outputs
    }

    pub fn is_terminal_output(&self, specification: &ValueSpecification) -> bool {
        self.terminal_outputs.contains_key(specification)
    }

    /// Outputs of every market data sourcing node.
    pub fn market_data_requirements(&self) -> HashSet<ValueSpecification> {
        self.graph
            .node_weights()
            .filter(|node| node.is_market_data_sourcing())
            .flat_map(|node| node.outputs().iter().cloned())
            .collect()
    }

    /// Every value produced by the graph.
    pub fn output_specifications(&self) -> impl Iterator<Item = &ValueSpecification> + '_ {
        self.producers.keys()
    }
}

/// Builder for constructing a [`DependencyGraph`] from explicit nodes.
#[derive(Debug, Default)]
pub struct DependencyGraphBuilder {
    calculation_configuration: String,
    graph: DiGraph<DependencyNode, ValueSpecification>,
    producers: HashMap<ValueSpecification, NodeId>,
    terminal_outputs: HashMap<ValueSpecification, BTreeSet<ValueRequirement>>,
}

impl DependencyGraphBuilder {
    pub fn new(calculation_configuration: impl Into<String>) -> Self {
        Self {
            calculation_configuration: calculation_configuration.into(),
            ..Default::default()
        }
    }

    /// Add a node; its outputs must not already have a producer.
    pub fn add_node(&mut self, node: DependencyNode) -> GraphResult<NodeId> {
        if node.outputs().is_empty() {
            return Err(GraphError::NoOutputs {
                function: node.function().to_string(),
                target: node.target().to_string(),
            });
        }
        if let Some(duplicate) = node
            .outputs()
            .iter()
            .find(|spec| self.producers.contains_key(*spec))
        {
            return Err(GraphError::DuplicateProducer {
                specification: duplicate.to_string(),
            });
        }
        let outputs = node.outputs().to_vec();
        let id = NodeId::from(self.graph.add_node(node));
        for spec in outputs {
            self.producers.insert(spec, id);
        }
        Ok(id)
    }

    /// Add a market data leaf for `output`.
    pub fn add_market_data(&mut self, output: ValueSpecification) -> GraphResult<NodeId> {
        self.add_node(DependencyNode::market_data(output))
    }

    /// Record that `specification` satisfies `requirement` for the view.
    pub fn add_terminal_output(
        &mut self,
        specification: ValueSpecification,
        requirement: ValueRequirement,
    ) -> &mut Self {
        self.terminal_outputs
            .entry(specification)
            .or_default()
            .insert(requirement);
        self
    }

    /// Wire inputs to producers, check terminal outputs and acyclicity.
    pub fn build(mut self) -> GraphResult<DependencyGraph> {
        let mut edges = Vec::new();
        for idx in self.graph.node_indices() {
            for input in self.graph[idx].inputs() {
                let producer =
                    self.producers
                        .get(input)
                        .ok_or_else(|| GraphError::UnresolvedInput {
                            specification: input.to_string(),
                        })?;
                edges.push((producer.index(), idx, input.clone()));
            }
        }
        for (from, to, spec) in edges {
            self.graph.add_edge(from, to, spec);
        }

        if let Some(missing) = self
            .terminal_outputs
            .keys()
            .find(|spec| !self.producers.contains_key(*spec))
        {
            return Err(GraphError::UnknownTerminalOutput {
                specification: missing.to_string(),
            });
        }

        let topological_order = toposort(&self.graph, None)
            .map_err(|cycle| GraphError::Cycle {
                node: cycle.node_id().index(),
            })?
            .into_iter()
            .map(NodeId::from)
            .collect();

        Ok(DependencyGraph {
            calculation_configuration: self.calculation_configuration,
            graph: self.graph,
            producers: self.producers,
            terminal_outputs: self.terminal_outputs,
            topological_order,
        })
    }
}
