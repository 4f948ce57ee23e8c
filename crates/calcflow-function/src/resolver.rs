//! Function resolver.
//!
//! [`FunctionResolver::compile`] slices the function repository at an instant
//! and indexes the resulting rules by declared target type, highest priority
//! first. The compiled resolver answers "which functions can produce this
//! value on this target" with a lazy, priority-ordered candidate iterator.
//!
//! Per target, the ordered `(rule, maximal results)` list is computed once and
//! cached weakly: the entry lives as long as some iterator holds it, and is
//! recomputed on the next miss.

use std::cmp::{Ordering, Reverse};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
use std::sync::{Arc, Weak};
use std::time::SystemTime;

use calcflow_core::{
    AdjustedTargets, Adjustment, ComputationTarget, ComputationTargetSpecification,
    ComputationTargetType, ParameterizedFunction, TargetTypeAdjuster, ValueProperties,
    ValueRequirement, ValueSpecification,
};
use dashmap::DashMap;
use tracing::{debug, info, warn};

use crate::blacklist::{EmptyFunctionBlacklist, FunctionBlacklistQuery};
use crate::definition::{CompiledFunctionDefinition, FunctionCompilationContext, FunctionRepository};
use crate::error::{ResolutionError, ResolutionResult};
use crate::rule::{DefaultFunctionPriority, FunctionPriority, ResolutionRule};

/// Dead weak entries are purged after this many cache inserts.
const PURGE_INTERVAL: usize = 256;

// =============================================================================
// Uncompiled resolver
// =============================================================================

/// Rule registry plus the strategies used when compiling it.
///
/// Registration takes `&mut self`; a compiled resolver is immutable and can be
/// shared across threads.
pub struct FunctionResolver {
    repository: FunctionRepository,
    context: FunctionCompilationContext,
    priority: Arc<dyn FunctionPriority>,
    blacklist: Arc<dyn FunctionBlacklistQuery>,
    adjuster: Arc<TargetTypeAdjuster>,
    default_rules: Vec<ResolutionRule>,
}

impl FunctionResolver {
    pub fn new(repository: FunctionRepository) -> Self {
        Self {
            repository,
            context: FunctionCompilationContext::default(),
            priority: Arc::new(DefaultFunctionPriority),
            blacklist: Arc::new(EmptyFunctionBlacklist),
            adjuster: Arc::new(TargetTypeAdjuster::new()),
            default_rules: Vec::new(),
        }
    }

    pub fn with_context(mut self, context: FunctionCompilationContext) -> Self {
        self.context = context;
        self
    }

    pub fn with_priority(mut self, priority: Arc<dyn FunctionPriority>) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_blacklist(mut self, blacklist: Arc<dyn FunctionBlacklistQuery>) -> Self {
        self.blacklist = blacklist;
        self
    }

    /// Share a type adjustment memo with other resolvers.
    pub fn with_adjuster(mut self, adjuster: Arc<TargetTypeAdjuster>) -> Self {
        self.adjuster = adjuster;
        self
    }

    /// Register a rule used by every compiled resolver.
    pub fn add_rule(&mut self, rule: ResolutionRule) {
        self.default_rules.push(rule);
    }

    pub fn add_rules(&mut self, rules: impl IntoIterator<Item = ResolutionRule>) {
        self.default_rules.extend(rules);
    }

    pub fn default_rules(&self) -> &[ResolutionRule] {
        &self.default_rules
    }

    /// Compile every function for `at` and index the rules.
    pub fn compile(&self, at: SystemTime) -> CompiledFunctionResolver {
        let mut rules = Vec::with_capacity(self.repository.len() + self.default_rules.len());
        for definition in self.repository.functions() {
            match definition.compile(&self.context, at) {
                Ok(compiled) if compiled.is_valid_at(at) => {
                    let priority = self.priority.priority(compiled.as_ref());
                    rules.push(ResolutionRule::new(compiled, priority));
                }
                Ok(_) => {
                    debug!(function = %definition.function_id(), "function_not_valid_at_instant");
                }
                Err(e) => {
                    warn!(function = %definition.function_id(), error = %e, "function_compile_failed");
                }
            }
        }
        rules.extend(self.default_rules.iter().cloned());

        let mut grouped: HashMap<ComputationTargetType, BTreeMap<Reverse<i32>, Vec<ResolutionRule>>> =
            HashMap::new();
        for rule in &rules {
            grouped
                .entry(rule.function().target_type())
                .or_default()
                .entry(Reverse(rule.priority()))
                .or_default()
                .push(rule.clone());
        }
        let by_declared_type: Vec<_> = grouped
            .into_iter()
            .map(|(declared, buckets)| (declared, into_buckets(buckets)))
            .collect();

        info!(
            rules = rules.len(),
            target_types = by_declared_type.len(),
            "function_resolver_compiled"
        );

        CompiledFunctionResolver {
            valuation_time: at,
            context: self.context.clone(),
            rules,
            by_declared_type,
            by_concrete_type: DashMap::new(),
            target_cache: DashMap::new(),
            cache_inserts: AtomicUsize::new(0),
            blacklist: Arc::clone(&self.blacklist),
            adjuster: Arc::clone(&self.adjuster),
        }
    }
}

impl fmt::Debug for FunctionResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionResolver")
            .field("repository", &self.repository)
            .field("default_rules", &self.default_rules)
            .finish()
    }
}

#[derive(Clone)]
struct PriorityBucket {
    priority: i32,
    rules: Vec<ResolutionRule>,
}

fn into_buckets(grouped: BTreeMap<Reverse<i32>, Vec<ResolutionRule>>) -> Vec<PriorityBucket> {
    grouped
        .into_iter()
        .map(|(Reverse(priority), rules)| PriorityBucket { priority, rules })
        .collect()
}

/// Order within a priority bucket: function id, then parameter hash.
fn rule_order(a: &ResolutionRule, b: &ResolutionRule) -> Ordering {
    let (fa, fb) = (a.parameterized_function(), b.parameterized_function());
    fa.function_id()
        .cmp(fb.function_id())
        .then_with(|| {
            fa.parameters()
                .parameter_hash()
                .cmp(&fb.parameters().parameter_hash())
        })
}

// =============================================================================
// Compiled resolver
// =============================================================================

struct TargetRule {
    rule: ResolutionRule,
    results: Arc<[ValueSpecification]>,
}

/// Ordered rules applicable to one target, with their maximal results.
pub struct TargetRules {
    entries: Vec<TargetRule>,
}

impl TargetRules {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Immutable, time-sliced rule index.
pub struct CompiledFunctionResolver {
    valuation_time: SystemTime,
    context: FunctionCompilationContext,
    rules: Vec<ResolutionRule>,
    by_declared_type: Vec<(ComputationTargetType, Vec<PriorityBucket>)>,
    by_concrete_type: DashMap<ComputationTargetType, Arc<Vec<PriorityBucket>>>,
    target_cache: DashMap<ComputationTargetSpecification, Weak<TargetRules>>,
    cache_inserts: AtomicUsize,
    blacklist: Arc<dyn FunctionBlacklistQuery>,
    adjuster: Arc<TargetTypeAdjuster>,
}

impl CompiledFunctionResolver {
    /// The instant the functions were compiled for.
    pub fn valuation_time(&self) -> SystemTime {
        self.valuation_time
    }

    pub fn context(&self) -> &FunctionCompilationContext {
        &self.context
    }

    /// Every rule, compiled and statically registered.
    pub fn all_resolution_rules(&self) -> &[ResolutionRule] {
        &self.rules
    }

    /// Candidates producing `value_name` on `target` under `constraints`,
    /// highest priority first.
    pub fn resolve_function(
        &self,
        value_name: &str,
        target: &ComputationTarget,
        constraints: &ValueProperties,
    ) -> ResolutionResult<ResolvedFunctions> {
        let rules = self.target_rules(target)?;
        if rules.is_empty() {
            debug!(target = %target.specification(), value = value_name, "no_resolution_rules");
        }
        Ok(ResolvedFunctions {
            rules,
            next: 0,
            value_name: value_name.to_string(),
            constraints: constraints.clone(),
            target: target.clone(),
            blacklist: Arc::clone(&self.blacklist),
        })
    }

    /// Candidates for `requirement`, resolved against `target`.
    pub fn resolve_requirement(
        &self,
        requirement: &ValueRequirement,
        target: &ComputationTarget,
    ) -> ResolutionResult<ResolvedFunctions> {
        self.resolve_function(requirement.value_name(), target, requirement.constraints())
    }

    /// Ordered `(rule, maximal results)` list for `target`, cached weakly.
    pub fn target_rules(&self, target: &ComputationTarget) -> ResolutionResult<Arc<TargetRules>> {
        let spec = target.specification();
        if let Some(entry) = self.target_cache.get(spec) {
            if let Some(rules) = entry.upgrade() {
                return Ok(rules);
            }
        }

        let rules = Arc::new(self.build_target_rules(target)?);
        self.target_cache.insert(spec.clone(), Arc::downgrade(&rules));
        if self.cache_inserts.fetch_add(1, AtomicOrdering::Relaxed) % PURGE_INTERVAL
            == PURGE_INTERVAL - 1
        {
            self.purge_target_cache();
        }
        Ok(rules)
    }

    /// Number of targets whose rule lists are still referenced.
    pub fn cached_target_count(&self) -> usize {
        self.target_cache
            .iter()
            .filter(|entry| entry.value().strong_count() > 0)
            .count()
    }

    /// Drop cache entries nobody references any more.
    pub fn purge_target_cache(&self) {
        let before = self.target_cache.len();
        self.target_cache.retain(|_, rules| rules.strong_count() > 0);
        debug!(
            purged = before.saturating_sub(self.target_cache.len()),
            "target_rule_cache_purged"
        );
    }

    fn buckets_for(&self, concrete: &ComputationTargetType) -> Arc<Vec<PriorityBucket>> {
        if let Some(hit) = self.by_concrete_type.get(concrete) {
            return Arc::clone(hit.value());
        }
        let mut merged: BTreeMap<Reverse<i32>, Vec<ResolutionRule>> = BTreeMap::new();
        for (declared, buckets) in &self.by_declared_type {
            if let Adjustment::Compatible { .. } = self.adjuster.adjustment(declared, concrete) {
                for bucket in buckets {
                    merged
                        .entry(Reverse(bucket.priority))
                        .or_default()
                        .extend(bucket.rules.iter().cloned());
                }
            }
        }
        let buckets = Arc::new(into_buckets(merged));
        self.by_concrete_type
            .insert(concrete.clone(), Arc::clone(&buckets));
        buckets
    }

    fn build_target_rules(&self, target: &ComputationTarget) -> ResolutionResult<TargetRules> {
        let buckets = self.buckets_for(&target.target_type());
        let mut adjusted = AdjustedTargets::new(&self.adjuster, target);
        let mut entries = Vec::new();

        for bucket in buckets.iter() {
            let mut applicable: Vec<TargetRule> = bucket
                .rules
                .iter()
                .filter_map(|rule| {
                    rule.results(&self.context, &mut adjusted)
                        .filter(|results| !results.is_empty())
                        .map(|results| TargetRule {
                            rule: rule.clone(),
                            results: results.into(),
                        })
                })
                .collect();

            if applicable.len() > 1 {
                applicable.sort_by(|a, b| rule_order(&a.rule, &b.rule));
                if let Some(pair) = applicable
                    .windows(2)
                    .find(|pair| rule_order(&pair[0].rule, &pair[1].rule) == Ordering::Equal)
                {
                    return Err(ResolutionError::AmbiguousPriority {
                        priority: bucket.priority,
                        function_id: pair[0].rule.parameterized_function().function_id().clone(),
                        target: target.specification().to_string(),
                    });
                }
            }
            entries.extend(applicable);
        }

        debug!(
            target = %target.specification(),
            rules = entries.len(),
            "target_rules_built"
        );
        Ok(TargetRules { entries })
    }
}

impl fmt::Debug for CompiledFunctionResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompiledFunctionResolver")
            .field("valuation_time", &self.valuation_time)
            .field("rule_count", &self.rules.len())
            .field("cached_targets", &self.target_cache.len())
            .finish()
    }
}

// =============================================================================
// Candidates
// =============================================================================

/// One resolution candidate.
#[derive(Clone)]
pub struct ResolvedFunction {
    rule: ResolutionRule,
    specification: ValueSpecification,
    results: Arc<[ValueSpecification]>,
}

impl ResolvedFunction {
    pub fn function(&self) -> &ParameterizedFunction {
        self.rule.parameterized_function()
    }

    pub fn compiled(&self) -> &Arc<dyn CompiledFunctionDefinition> {
        self.rule.function()
    }

    pub fn rule(&self) -> &ResolutionRule {
        &self.rule
    }

    pub fn priority(&self) -> i32 {
        self.rule.priority()
    }

    /// The output satisfying the request.
    pub fn specification(&self) -> &ValueSpecification {
        &self.specification
    }

    /// Everything the function could produce on the target.
    pub fn results(&self) -> &[ValueSpecification] {
        &self.results
    }
}

impl fmt::Debug for ResolvedFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolvedFunction")
            .field("function", self.function())
            .field("priority", &self.priority())
            .field("specification", &self.specification)
            .finish()
    }
}

/// Lazy candidate iterator returned by resolution.
///
/// Holds the target's rule list alive; candidates are matched one rule at a
/// time as the caller pulls them.
pub struct ResolvedFunctions {
    rules: Arc<TargetRules>,
    next: usize,
    value_name: String,
    constraints: ValueProperties,
    target: ComputationTarget,
    blacklist: Arc<dyn FunctionBlacklistQuery>,
}

impl Iterator for ResolvedFunctions {
    type Item = ResolvedFunction;

    fn next(&mut self) -> Option<Self::Item> {
        while let Some(entry) = self.rules.entries.get(self.next) {
            self.next += 1;
            if !self.blacklist.is_empty()
                && self
                    .blacklist
                    .is_blacklisted(entry.rule.parameterized_function(), self.target.specification())
            {
                debug!(
                    function = %entry.rule.parameterized_function(),
                    target = %self.target.specification(),
                    "rule_blacklisted"
                );
                continue;
            }
            if let Some(specification) =
                entry
                    .rule
                    .result(&self.value_name, &self.target, &self.constraints, &entry.results)
            {
                return Some(ResolvedFunction {
                    rule: entry.rule.clone(),
                    specification,
                    results: Arc::clone(&entry.results),
                });
            }
        }
        None
    }
}

impl fmt::Debug for ResolvedFunctions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolvedFunctions")
            .field("value_name", &self.value_name)
            .field("target", self.target.specification())
            .field("remaining_rules", &(self.rules.len() - self.next.min(self.rules.len())))
            .finish()
    }
}
