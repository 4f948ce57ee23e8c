//! Function blacklists: runtime circuit breakers for function/target pairs.

use std::collections::BTreeSet;

use calcflow_core::{
    ComputationTargetSpecification, DependencyNode, FunctionId, FunctionParameters,
    ParameterizedFunction, ValueSpecification,
};
use dashmap::DashSet;
use serde::{Deserialize, Serialize};
use tracing::info;

/// Query side of a function blacklist.
pub trait FunctionBlacklistQuery: Send + Sync {
    /// True if no rule is active; lets callers skip per-rule checks.
    fn is_empty(&self) -> bool;

    /// Whether `function` must not be used on `target`.
    fn is_blacklisted(
        &self,
        function: &ParameterizedFunction,
        target: &ComputationTargetSpecification,
    ) -> bool;

    /// Whether `node` must not be executed.
    fn is_blacklisted_node(&self, node: &DependencyNode) -> bool;
}

/// A blacklist that never matches.
#[derive(Debug, Default, Clone, Copy)]
pub struct EmptyFunctionBlacklist;

impl FunctionBlacklistQuery for EmptyFunctionBlacklist {
    fn is_empty(&self) -> bool {
        true
    }

    fn is_blacklisted(
        &self,
        _function: &ParameterizedFunction,
        _target: &ComputationTargetSpecification,
    ) -> bool {
        false
    }

    fn is_blacklisted_node(&self, _node: &DependencyNode) -> bool {
        false
    }
}

/// One blacklist entry. `None` fields match anything.
///
/// Rules naming inputs or outputs only match whole nodes; they never match a
/// bare function/target query.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FunctionBlacklistRule {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function_id: Option<FunctionId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<FunctionParameters>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<ComputationTargetSpecification>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inputs: Option<BTreeSet<ValueSpecification>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outputs: Option<BTreeSet<ValueSpecification>>,
}

impl FunctionBlacklistRule {
    /// Block `function` everywhere.
    pub fn for_function(function_id: impl Into<FunctionId>) -> Self {
        Self {
            function_id: Some(function_id.into()),
            ..Default::default()
        }
    }

    /// Block exactly `function` on `target`.
    pub fn for_function_on(
        function: &ParameterizedFunction,
        target: ComputationTargetSpecification,
    ) -> Self {
        Self {
            function_id: Some(function.function_id().clone()),
            parameters: Some(function.parameters().clone()),
            target: Some(target),
            ..Default::default()
        }
    }

    /// Block one specific node.
    pub fn for_node(node: &DependencyNode) -> Self {
        Self {
            function_id: Some(node.function().function_id().clone()),
            parameters: Some(node.function().parameters().clone()),
            target: Some(node.target().clone()),
            inputs: Some(node.inputs().iter().cloned().collect()),
            outputs: Some(node.outputs().iter().cloned().collect()),
        }
    }

    fn matches_function(
        &self,
        function: &ParameterizedFunction,
        target: &ComputationTargetSpecification,
    ) -> bool {
        self.function_id
            .as_ref()
            .map_or(true, |id| id == function.function_id())
            && self
                .parameters
                .as_ref()
                .map_or(true, |p| p == function.parameters())
            && self.target.as_ref().map_or(true, |t| t == target)
    }

    fn matches_node(&self, node: &DependencyNode) -> bool {
        let same_set = |wanted: &Option<BTreeSet<ValueSpecification>>, actual: &[ValueSpecification]| {
            wanted.as_ref().map_or(true, |wanted| {
                wanted.len() == actual.len() && actual.iter().all(|spec| wanted.contains(spec))
            })
        };
        self.matches_function(node.function(), node.target())
            && same_set(&self.inputs, node.inputs())
            && same_set(&self.outputs, node.outputs())
    }
}

/// Concurrent, mutable set of blacklist rules.
#[derive(Debug, Default)]
pub struct DefaultFunctionBlacklistQuery {
    rules: DashSet<FunctionBlacklistRule>,
}

impl DefaultFunctionBlacklistQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_rule(&self, rule: FunctionBlacklistRule) {
        info!(rule = ?rule, "blacklist_rule_added");
        self.rules.insert(rule);
    }

    pub fn add_rules(&self, rules: impl IntoIterator<Item = FunctionBlacklistRule>) {
        for rule in rules {
            self.add_rule(rule);
        }
    }

    pub fn remove_rule(&self, rule: &FunctionBlacklistRule) -> bool {
        self.rules.remove(rule).is_some()
    }

    pub fn rules(&self) -> Vec<FunctionBlacklistRule> {
        self.rules.iter().map(|r| r.clone()).collect()
    }
}

impl FunctionBlacklistQuery for DefaultFunctionBlacklistQuery {
    fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    fn is_blacklisted(
        &self,
        function: &ParameterizedFunction,
        target: &ComputationTargetSpecification,
    ) -> bool {
        self.rules.iter().any(|rule| {
            rule.inputs.is_none() && rule.outputs.is_none() && rule.matches_function(function, target)
        })
    }

    fn is_blacklisted_node(&self, node: &DependencyNode) -> bool {
        self.rules.iter().any(|rule| rule.matches_node(node))
    }
}
