//! Resolution rules.
//!
//! A rule binds one compiled function to a priority and a target filter, and
//! answers whether (and with which output) the function can satisfy a request
//! on a target.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use calcflow_core::{
    AdjustedTargets, ComputationTarget, FunctionId, ParameterizedFunction, ValueProperties,
    ValueSpecification,
};
use tracing::{error, warn};

use crate::definition::{CompiledFunctionDefinition, FunctionCompilationContext};

// =============================================================================
// Target filters
// =============================================================================

/// Last-chance veto on the targets a rule applies to.
pub trait ComputationTargetFilter: Send + Sync {
    fn accept(&self, target: &ComputationTarget) -> bool;
}

/// Default filter: accepts every target.
#[derive(Debug, Default, Clone, Copy)]
pub struct ApplyToAllTargets;

impl ComputationTargetFilter for ApplyToAllTargets {
    fn accept(&self, _target: &ComputationTarget) -> bool {
        true
    }
}

/// Filter backed by a predicate.
pub struct PredicateTargetFilter<F>(F);

impl<F> PredicateTargetFilter<F>
where
    F: Fn(&ComputationTarget) -> bool + Send + Sync,
{
    pub fn new(predicate: F) -> Self {
        Self(predicate)
    }
}

impl<F> ComputationTargetFilter for PredicateTargetFilter<F>
where
    F: Fn(&ComputationTarget) -> bool + Send + Sync,
{
    fn accept(&self, target: &ComputationTarget) -> bool {
        (self.0)(target)
    }
}

// =============================================================================
// Priorities
// =============================================================================

/// Strategy assigning priorities to compiled functions (higher = earlier).
pub trait FunctionPriority: Send + Sync {
    fn priority(&self, function: &dyn CompiledFunctionDefinition) -> i32;
}

/// Every function gets priority 0.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultFunctionPriority;

impl FunctionPriority for DefaultFunctionPriority {
    fn priority(&self, _function: &dyn CompiledFunctionDefinition) -> i32 {
        0
    }
}

/// Priorities looked up by function id, with a fallback.
#[derive(Debug, Default, Clone)]
pub struct FixedFunctionPriority {
    priorities: HashMap<FunctionId, i32>,
    fallback: i32,
}

impl FixedFunctionPriority {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_priority(mut self, function_id: impl Into<FunctionId>, priority: i32) -> Self {
        self.priorities.insert(function_id.into(), priority);
        self
    }

    pub fn with_fallback(mut self, fallback: i32) -> Self {
        self.fallback = fallback;
        self
    }
}

impl FunctionPriority for FixedFunctionPriority {
    fn priority(&self, function: &dyn CompiledFunctionDefinition) -> i32 {
        self.priorities
            .get(&function.function_id())
            .copied()
            .unwrap_or(self.fallback)
    }
}

// =============================================================================
// Resolution rule
// =============================================================================

/// A compiled function with its priority and target filter.
#[derive(Clone)]
pub struct ResolutionRule {
    function: Arc<dyn CompiledFunctionDefinition>,
    parameterized: ParameterizedFunction,
    filter: Arc<dyn ComputationTargetFilter>,
    priority: i32,
}

impl ResolutionRule {
    /// A rule applying to all targets.
    pub fn new(function: Arc<dyn CompiledFunctionDefinition>, priority: i32) -> Self {
        Self::with_filter(function, Arc::new(ApplyToAllTargets), priority)
    }

    pub fn with_filter(
        function: Arc<dyn CompiledFunctionDefinition>,
        filter: Arc<dyn ComputationTargetFilter>,
        priority: i32,
    ) -> Self {
        let parameterized = function.parameterized_function();
        Self {
            function,
            parameterized,
            filter,
            priority,
        }
    }

    pub fn function(&self) -> &Arc<dyn CompiledFunctionDefinition> {
        &self.function
    }

    pub fn parameterized_function(&self) -> &ParameterizedFunction {
        &self.parameterized
    }

    pub fn priority(&self) -> i32 {
        self.priority
    }

    /// Maximal result set of the function on `target`.
    ///
    /// `None` when the declared type does not apply, the function declines the
    /// target, the function fails, or a result names a different target.
    pub fn results(
        &self,
        context: &FunctionCompilationContext,
        adjusted: &mut AdjustedTargets<'_>,
    ) -> Option<Vec<ValueSpecification>> {
        let target = adjusted.get(&self.function.target_type())?;
        if !self.function.can_apply_to(context, &target) {
            return None;
        }
        let results = match self.function.results(context, &target) {
            Ok(results) => results,
            Err(e) => {
                warn!(
                    function = %self.parameterized,
                    target = %target.specification(),
                    error = %e,
                    "function_results_failed"
                );
                return None;
            }
        };
        if let Some(bad) = results
            .iter()
            .find(|spec| !spec.target().same_identity(target.specification()))
        {
            error!(
                function = %self.parameterized,
                target = %target.specification(),
                result = %bad,
                "function_result_target_mismatch"
            );
            return None;
        }

        // Results are reported against the target the caller asked about.
        let original = adjusted.target().specification();
        if target.specification() == original {
            Some(results)
        } else {
            Some(
                results
                    .into_iter()
                    .map(|spec| spec.with_target(original.clone()))
                    .collect(),
            )
        }
    }

    /// First specification in `maximal` satisfying the request, subject to the
    /// rule's target filter.
    pub fn result(
        &self,
        value_name: &str,
        target: &ComputationTarget,
        constraints: &ValueProperties,
        maximal: &[ValueSpecification],
    ) -> Option<ValueSpecification> {
        let wants_id = target.unique_id().is_some();
        let found = maximal.iter().find(|spec| {
            spec.value_name() == value_name
                && spec.target().unique_id().is_some() == wants_id
                && constraints.is_satisfied_by(spec.properties())
        })?;
        if !self.filter.accept(target) {
            return None;
        }
        Some(found.clone())
    }
}

impl fmt::Debug for ResolutionRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolutionRule")
            .field("function", &self.parameterized)
            .field("priority", &self.priority)
            .finish()
    }
}

impl fmt::Display for ResolutionRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (priority {})", self.parameterized, self.priority)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use calcflow_core::{
        ComputationTargetSpecification, ComputationTargetType, TargetKind, TargetTypeAdjuster,
        UniqueId,
    };
    use serde_json::json;

    struct PresentValue;

    impl CompiledFunctionDefinition for PresentValue {
        fn function_id(&self) -> FunctionId {
            FunctionId::new("PresentValue")
        }

        fn target_type(&self) -> ComputationTargetType {
            ComputationTargetType::of(TargetKind::position())
        }

        fn results(
            &self,
            _context: &FunctionCompilationContext,
            target: &ComputationTarget,
        ) -> anyhow::Result<Vec<ValueSpecification>> {
            Ok(vec![
                ValueSpecification::new(
                    "PV",
                    target.specification().clone(),
                    ValueProperties::new().with("Currency", "USD"),
                ),
                ValueSpecification::new(
                    "PV",
                    target.specification().clone(),
                    ValueProperties::new().with("Currency", "EUR"),
                ),
            ])
        }
    }

    struct Failing;

    impl CompiledFunctionDefinition for Failing {
        fn function_id(&self) -> FunctionId {
            FunctionId::new("Failing")
        }

        fn target_type(&self) -> ComputationTargetType {
            ComputationTargetType::of(TargetKind::position())
        }

        fn results(
            &self,
            _context: &FunctionCompilationContext,
            _target: &ComputationTarget,
        ) -> anyhow::Result<Vec<ValueSpecification>> {
            anyhow::bail!("pricing library unavailable")
        }
    }

    struct WrongTarget;

    impl CompiledFunctionDefinition for WrongTarget {
        fn function_id(&self) -> FunctionId {
            FunctionId::new("WrongTarget")
        }

        fn target_type(&self) -> ComputationTargetType {
            ComputationTargetType::of(TargetKind::position())
        }

        fn results(
            &self,
            _context: &FunctionCompilationContext,
            _target: &ComputationTarget,
        ) -> anyhow::Result<Vec<ValueSpecification>> {
            let other = ComputationTargetSpecification::of(
                TargetKind::position(),
                UniqueId::of("Pos", "elsewhere"),
            );
            Ok(vec![ValueSpecification::new("PV", other, ValueProperties::new())])
        }
    }

    fn position_in_node() -> ComputationTarget {
        let spec =
            ComputationTargetSpecification::of(TargetKind::position(), UniqueId::of("Pos", "1"))
                .with_parent(ComputationTargetSpecification::of(
                    TargetKind::portfolio_node(),
                    UniqueId::of("Node", "root"),
                ));
        ComputationTarget::new(spec, json!({}))
    }

    fn maximal(rule: &ResolutionRule, target: &ComputationTarget) -> Option<Vec<ValueSpecification>> {
        let adjuster = TargetTypeAdjuster::new();
        let mut adjusted = AdjustedTargets::new(&adjuster, target);
        rule.results(&FunctionCompilationContext::default(), &mut adjusted)
    }

    #[test]
    fn test_results_are_reported_on_original_target() {
        let rule = ResolutionRule::new(Arc::new(PresentValue), 0);
        let target = position_in_node();
        let results = maximal(&rule, &target).unwrap();
        assert_eq!(results.len(), 2);
        assert!(results
            .iter()
            .all(|spec| spec.target() == target.specification()));
    }

    #[test]
    fn test_incompatible_type_produces_nothing() {
        let rule = ResolutionRule::new(Arc::new(PresentValue), 0);
        let security = ComputationTarget::new(
            ComputationTargetSpecification::of(TargetKind::security(), UniqueId::of("Ticker", "X")),
            json!({}),
        );
        assert!(maximal(&rule, &security).is_none());
    }

    #[test]
    fn test_function_fault_produces_nothing() {
        let rule = ResolutionRule::new(Arc::new(Failing), 0);
        assert!(maximal(&rule, &position_in_node()).is_none());
    }

    #[test]
    fn test_target_mismatch_produces_nothing() {
        let rule = ResolutionRule::new(Arc::new(WrongTarget), 0);
        assert!(maximal(&rule, &position_in_node()).is_none());
    }

    #[test]
    fn test_result_scans_in_order() {
        let rule = ResolutionRule::new(Arc::new(PresentValue), 0);
        let target = position_in_node();
        let results = maximal(&rule, &target).unwrap();

        let any = rule
            .result("PV", &target, &ValueProperties::new(), &results)
            .unwrap();
        assert_eq!(any.properties().first_value("Currency"), Some("USD"));

        let eur = rule
            .result("PV", &target, &ValueProperties::new().with("Currency", "EUR"), &results)
            .unwrap();
        assert_eq!(eur.properties().first_value("Currency"), Some("EUR"));

        assert!(rule
            .result("Delta", &target, &ValueProperties::new(), &results)
            .is_none());
    }

    #[test]
    fn test_filter_applied_after_match() {
        let rule = ResolutionRule::with_filter(
            Arc::new(PresentValue),
            Arc::new(PredicateTargetFilter::new(|_: &ComputationTarget| false)),
            0,
        );
        let target = position_in_node();
        let results = maximal(&rule, &target).unwrap();
        assert!(rule
            .result("PV", &target, &ValueProperties::new(), &results)
            .is_none());
    }

    #[test]
    fn test_fixed_priority() {
        let priority = FixedFunctionPriority::new()
            .with_priority("PresentValue", 10)
            .with_fallback(-1);
        assert_eq!(priority.priority(&PresentValue), 10);
        assert_eq!(priority.priority(&Failing), -1);
        assert_eq!(DefaultFunctionPriority.priority(&PresentValue), 0);
    }
}
