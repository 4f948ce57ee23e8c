//! Target-type adjustment.
//!
//! Before a function sees a target, the target is narrowed to the function's
//! declared type: context parents the declared type does not mention are cut
//! away. The outcome only depends on (declared type, concrete type), so it is
//! memoized, including the negative outcome.

use std::collections::HashMap;

use dashmap::DashMap;

use crate::target::{ComputationTarget, ComputationTargetType};

/// Memoized outcome of adjusting a concrete type to a declared type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Adjustment {
    /// The declared type applies; keep this many context parents.
    Compatible { parents: usize },
    /// The declared type does not apply.
    Incompatible,
}

/// Process-scoped memo of type adjustments.
///
/// Shared behind an `Arc` by every resolver compiled in a process. Entries are
/// never evicted; the key space is bounded by the number of distinct types.
#[derive(Debug, Default)]
pub struct TargetTypeAdjuster {
    memo: DashMap<(ComputationTargetType, ComputationTargetType), Adjustment>,
}

impl TargetTypeAdjuster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adjustment of `concrete` to `declared`, computed once per pair.
    pub fn adjustment(
        &self,
        declared: &ComputationTargetType,
        concrete: &ComputationTargetType,
    ) -> Adjustment {
        let key = (declared.clone(), concrete.clone());
        if let Some(hit) = self.memo.get(&key) {
            return *hit;
        }
        let adjustment = match declared.context_depth_for(concrete) {
            Some(parents) => Adjustment::Compatible { parents },
            None => Adjustment::Incompatible,
        };
        self.memo.insert(key, adjustment);
        adjustment
    }

    /// Adjust `target` to `declared`, or `None` when incompatible.
    pub fn adjust(
        &self,
        declared: &ComputationTargetType,
        target: &ComputationTarget,
    ) -> Option<ComputationTarget> {
        match self.adjustment(declared, &target.target_type()) {
            Adjustment::Compatible { parents } => Some(target.with_context_depth(parents)),
            Adjustment::Incompatible => None,
        }
    }

    /// Number of memoized pairs.
    pub fn len(&self) -> usize {
        self.memo.len()
    }

    pub fn is_empty(&self) -> bool {
        self.memo.is_empty()
    }
}

/// Adjusted forms of one target, cached by declared type for a single
/// resolution pass.
pub struct AdjustedTargets<'a> {
    adjuster: &'a TargetTypeAdjuster,
    target: &'a ComputationTarget,
    adjusted: HashMap<ComputationTargetType, Option<ComputationTarget>>,
}

impl<'a> AdjustedTargets<'a> {
    pub fn new(adjuster: &'a TargetTypeAdjuster, target: &'a ComputationTarget) -> Self {
        Self {
            adjuster,
            target,
            adjusted: HashMap::new(),
        }
    }

    /// The target the pass is resolving for.
    pub fn target(&self) -> &ComputationTarget {
        self.target
    }

    /// The target as seen by a function declared on `declared`.
    pub fn get(&mut self, declared: &ComputationTargetType) -> Option<ComputationTarget> {
        if let Some(cached) = self.adjusted.get(declared) {
            return cached.clone();
        }
        let adjusted = self.adjuster.adjust(declared, self.target);
        self.adjusted.insert(declared.clone(), adjusted.clone());
        adjusted
    }
}
