//! Change detection between consecutive cycles.

use std::collections::{HashMap, HashSet};

use calcflow_core::{DependencyGraph, FunctionParameters, NodeId, ValueSpecification};
use tracing::debug;

use crate::cache::ViewComputationCache;

/// Nodes split by whether their outputs may differ from the previous cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeltaPartition {
    pub changed: HashSet<NodeId>,
    pub unchanged: HashSet<NodeId>,
}

/// Classifies a graph's nodes against the previous cycle's market data.
///
/// A market data leaf is unchanged when every output compares equal between
/// the two shared tiers. Any other node is changed when an input node changed
/// or one of its outputs is dirty.
pub struct DeltaCalculator<'a> {
    graph: &'a DependencyGraph,
    cache: &'a ViewComputationCache,
    previous_cache: &'a ViewComputationCache,
    dirty: &'a HashSet<ValueSpecification>,
    partition: DeltaPartition,
}

impl<'a> DeltaCalculator<'a> {
    pub fn new(
        graph: &'a DependencyGraph,
        cache: &'a ViewComputationCache,
        previous_cache: &'a ViewComputationCache,
        dirty: &'a HashSet<ValueSpecification>,
    ) -> Self {
        Self {
            graph,
            cache,
            previous_cache,
            dirty,
            partition: DeltaPartition::default(),
        }
    }

    /// Classify every node in one pass over the topological order, so
    /// inputs are always decided before their consumers.
    pub fn compute_delta(mut self) -> DeltaPartition {
        for &node in self.graph.topological_order() {
            if self.is_changed(node) {
                self.partition.changed.insert(node);
            } else {
                self.partition.unchanged.insert(node);
            }
        }
        debug!(
            config = self.graph.calculation_configuration_name(),
            changed = self.partition.changed.len(),
            total = self.graph.node_count(),
            "delta_computed"
        );
        self.partition
    }

    fn is_changed(&self, node: NodeId) -> bool {
        let Some(dependency_node) = self.graph.node(node) else {
            return true;
        };
        if dependency_node.is_market_data_sourcing() {
            return dependency_node.outputs().iter().any(|output| {
                let previous = self.previous_cache.get_shared_value(output);
                let current = self.cache.get_shared_value(output);
                previous.is_none() || previous != current
            });
        }
        self.graph
            .input_nodes(node)
            .iter()
            .any(|input| !self.partition.unchanged.contains(input))
            || dependency_node
                .outputs()
                .iter()
                .any(|output| self.dirty.contains(output))
    }
}

/// Specifications whose function parameters differ between two cycles.
pub struct FunctionParametersDelta;

impl FunctionParametersDelta {
    /// Symmetric difference of the two maps' (specification, parameters) entries.
    pub fn compute(
        previous: &HashMap<ValueSpecification, FunctionParameters>,
        current: &HashMap<ValueSpecification, FunctionParameters>,
    ) -> HashSet<ValueSpecification> {
        let mut dirty = HashSet::new();
        for (spec, parameters) in current {
            if previous.get(spec) != Some(parameters) {
                dirty.insert(spec.clone());
            }
        }
        for (spec, parameters) in previous {
            if current.get(spec) != Some(parameters) {
                dirty.insert(spec.clone());
            }
        }
        dirty
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::ComputedValue;
    use calcflow_core::{
        ComputationTargetSpecification, DependencyGraphBuilder, DependencyNode,
        ParameterizedFunction, TargetKind, UniqueId, ValueProperties,
    };
    use serde_json::json;

    fn spec(name: &str) -> ValueSpecification {
        ValueSpecification::new(
            name,
            ComputationTargetSpecification::of(TargetKind::security(), UniqueId::of("Ticker", "AAPL")),
            ValueProperties::new(),
        )
    }

    fn node(function: &str, inputs: &[&str], output: &str) -> DependencyNode {
        DependencyNode::new(
            ParameterizedFunction::new(function.into(), FunctionParameters::empty()),
            spec(output).target().clone(),
            inputs.iter().map(|name| spec(name)).collect(),
            vec![spec(output)],
        )
    }

    /// Spot, Vol -> PV; Spot -> Delta
    fn graph() -> DependencyGraph {
        let mut builder = DependencyGraphBuilder::new("Default");
        builder.add_market_data(spec("Spot")).unwrap();
        builder.add_market_data(spec("Vol")).unwrap();
        builder.add_node(node("PVFunction", &["Spot", "Vol"], "PV")).unwrap();
        builder.add_node(node("DeltaFunction", &["Spot"], "Delta")).unwrap();
        builder.build().unwrap()
    }

    fn market_data(spot: f64, vol: f64) -> ViewComputationCache {
        let cache = ViewComputationCache::new("Default");
        cache.put_shared_values([
            ComputedValue::new(spec("Spot"), json!(spot)),
            ComputedValue::new(spec("Vol"), json!(vol)),
        ]);
        cache
    }

    fn names(graph: &DependencyGraph, nodes: &HashSet<NodeId>) -> Vec<String> {
        let mut names: Vec<String> = nodes
            .iter()
            .filter_map(|id| graph.node(*id))
            .filter_map(|node| node.primary_output())
            .map(|output| output.value_name().to_string())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn test_identical_market_data_is_unchanged() {
        let graph = graph();
        let previous = market_data(100.0, 0.2);
        let current = market_data(100.0, 0.2);
        let dirty = HashSet::new();
        let delta = DeltaCalculator::new(&graph, &current, &previous, &dirty).compute_delta();
        assert!(delta.changed.is_empty());
        assert_eq!(delta.unchanged.len(), 4);
    }

    #[test]
    fn test_changed_leaf_propagates_to_dependents_only() {
        let graph = graph();
        let previous = market_data(100.0, 0.2);
        let current = market_data(100.0, 0.25);
        let dirty = HashSet::new();
        let delta = DeltaCalculator::new(&graph, &current, &previous, &dirty).compute_delta();
        assert_eq!(names(&graph, &delta.changed), vec!["PV", "Vol"]);
        assert_eq!(names(&graph, &delta.unchanged), vec!["Delta", "Spot"]);
    }

    #[test]
    fn test_dirty_output_forces_change() {
        let graph = graph();
        let previous = market_data(100.0, 0.2);
        let current = market_data(100.0, 0.2);
        let dirty = HashSet::from([spec("Delta")]);
        let delta = DeltaCalculator::new(&graph, &current, &previous, &dirty).compute_delta();
        assert_eq!(names(&graph, &delta.changed), vec!["Delta"]);
    }

    #[test]
    fn test_delta_is_idempotent() {
        let graph = graph();
        let previous = market_data(100.0, 0.2);
        let current = market_data(101.0, 0.2);
        let dirty = HashSet::new();
        let first = DeltaCalculator::new(&graph, &current, &previous, &dirty).compute_delta();
        let second = DeltaCalculator::new(&graph, &current, &previous, &dirty).compute_delta();
        assert_eq!(first, second);
        assert_eq!(names(&graph, &first.changed), vec!["Delta", "PV", "Spot"]);
    }

    #[test]
    fn test_deep_chain_is_classified_without_recursion() {
        const DEPTH: usize = 50_000;
        let mut builder = DependencyGraphBuilder::new("Default");
        builder.add_market_data(spec("Level0")).unwrap();
        for level in 1..DEPTH {
            let input = format!("Level{}", level - 1);
            let output = format!("Level{level}");
            builder
                .add_node(node("StepFunction", &[input.as_str()], &output))
                .unwrap();
        }
        let graph = builder.build().unwrap();

        let previous = ViewComputationCache::new("Default");
        previous.put_shared_value(ComputedValue::new(spec("Level0"), json!(1.0)));
        let current = ViewComputationCache::new("Default");
        current.put_shared_value(ComputedValue::new(spec("Level0"), json!(1.0)));

        let dirty = HashSet::from([spec(&format!("Level{}", DEPTH / 2))]);
        let delta = DeltaCalculator::new(&graph, &current, &previous, &dirty).compute_delta();
        assert_eq!(delta.changed.len(), DEPTH / 2);
        assert_eq!(delta.unchanged.len(), DEPTH / 2);
        let top = graph.producer_of(&spec(&format!("Level{}", DEPTH - 1))).unwrap();
        let bottom = graph.producer_of(&spec("Level1")).unwrap();
        assert!(delta.changed.contains(&top));
        assert!(delta.unchanged.contains(&bottom));
    }

    #[test]
    fn test_parameters_delta_is_symmetric() {
        let previous = HashMap::from([
            (spec("Spot"), FunctionParameters::new(json!({"shift": 1}))),
            (spec("Vol"), FunctionParameters::empty()),
        ]);
        let current = HashMap::from([
            (spec("Spot"), FunctionParameters::new(json!({"shift": 2}))),
            (spec("Rate"), FunctionParameters::empty()),
        ]);
        let mut dirty: Vec<String> = FunctionParametersDelta::compute(&previous, &current)
            .into_iter()
            .map(|spec| spec.value_name().to_string())
            .collect();
        dirty.sort();
        assert_eq!(dirty, vec!["Rate", "Spot", "Vol"]);
        assert!(FunctionParametersDelta::compute(&current, &current).is_empty());
    }
}
