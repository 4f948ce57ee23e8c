//! Computation caches.
//!
//! One [`ViewComputationCache`] per (cycle, calculation configuration). The
//! shared tier holds market data and values reused from a previous cycle; the
//! private tier holds values computed by this cycle's jobs. Reads consult the
//! private tier first.

use std::fmt;
use std::sync::Arc;

use calcflow_core::{UniqueId, ValueSpecification};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

/// Why an input is unavailable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MissingInput {
    MissingMarketData,
}

/// Why an output was not computed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MissingOutput {
    /// Deliberately not computed this cycle.
    Suppressed,
    /// The producing function failed or did not return it.
    EvaluationError,
    /// The producing function could not run for lack of inputs.
    MissingInputs,
}

/// A cache entry: a value or an explicit sentinel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum CachedValue {
    Value(Value),
    MissingInput(MissingInput),
    MissingOutput(MissingOutput),
}

impl CachedValue {
    pub fn suppressed() -> Self {
        Self::MissingOutput(MissingOutput::Suppressed)
    }

    pub fn evaluation_error() -> Self {
        Self::MissingOutput(MissingOutput::EvaluationError)
    }

    pub fn missing_inputs() -> Self {
        Self::MissingOutput(MissingOutput::MissingInputs)
    }

    pub fn missing_market_data() -> Self {
        Self::MissingInput(MissingInput::MissingMarketData)
    }

    pub fn as_value(&self) -> Option<&Value> {
        match self {
            Self::Value(value) => Some(value),
            _ => None,
        }
    }

    pub fn is_value(&self) -> bool {
        matches!(self, Self::Value(_))
    }

    pub fn is_suppressed(&self) -> bool {
        matches!(self, Self::MissingOutput(MissingOutput::Suppressed))
    }
}

impl From<Value> for CachedValue {
    fn from(value: Value) -> Self {
        Self::Value(value)
    }
}

impl fmt::Display for CachedValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Value(value) => write!(f, "{value}"),
            Self::MissingInput(missing) => write!(f, "{missing:?}"),
            Self::MissingOutput(missing) => write!(f, "{missing:?}"),
        }
    }
}

/// A specification with its cached value.
#[derive(Debug, Clone, PartialEq)]
pub struct ComputedValue {
    pub specification: ValueSpecification,
    pub value: CachedValue,
}

impl ComputedValue {
    pub fn new(specification: ValueSpecification, value: impl Into<CachedValue>) -> Self {
        Self {
            specification,
            value: value.into(),
        }
    }
}

/// Two-tier value store for one (cycle, calculation configuration).
#[derive(Debug, Default)]
pub struct ViewComputationCache {
    calculation_configuration: String,
    shared: DashMap<ValueSpecification, CachedValue>,
    private: DashMap<ValueSpecification, CachedValue>,
}

impl ViewComputationCache {
    pub fn new(calculation_configuration: impl Into<String>) -> Self {
        Self {
            calculation_configuration: calculation_configuration.into(),
            ..Default::default()
        }
    }

    pub fn calculation_configuration(&self) -> &str {
        &self.calculation_configuration
    }

    /// Value for `specification`, private tier first.
    pub fn get_value(&self, specification: &ValueSpecification) -> Option<CachedValue> {
        self.private
            .get(specification)
            .or_else(|| self.shared.get(specification))
            .map(|entry| entry.value().clone())
    }

    /// Values for many specifications, in request order.
    pub fn get_values<'a>(
        &self,
        specifications: impl IntoIterator<Item = &'a ValueSpecification>,
    ) -> Vec<(ValueSpecification, Option<CachedValue>)> {
        specifications
            .into_iter()
            .map(|spec| (spec.clone(), self.get_value(spec)))
            .collect()
    }

    /// Value in the shared tier only.
    pub fn get_shared_value(&self, specification: &ValueSpecification) -> Option<CachedValue> {
        self.shared
            .get(specification)
            .map(|entry| entry.value().clone())
    }

    pub fn put_shared_value(&self, value: ComputedValue) {
        self.shared.insert(value.specification, value.value);
    }

    pub fn put_shared_values(&self, values: impl IntoIterator<Item = ComputedValue>) {
        for value in values {
            self.put_shared_value(value);
        }
    }

    pub fn put_private_value(&self, value: ComputedValue) {
        self.private.insert(value.specification, value.value);
    }

    pub fn put_private_values(&self, values: impl IntoIterator<Item = ComputedValue>) {
        for value in values {
            self.put_private_value(value);
        }
    }

    /// Every entry, private values shadowing shared ones.
    pub fn all_values(&self) -> Vec<ComputedValue> {
        let mut values: Vec<ComputedValue> = self
            .shared
            .iter()
            .filter(|entry| !self.private.contains_key(entry.key()))
            .map(|entry| ComputedValue::new(entry.key().clone(), entry.value().clone()))
            .collect();
        values.extend(
            self.private
                .iter()
                .map(|entry| ComputedValue::new(entry.key().clone(), entry.value().clone())),
        );
        values
    }

    pub fn len(&self) -> usize {
        self.all_values().len()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.is_empty() && self.private.is_empty()
    }
}

/// Hands out and releases computation caches.
pub trait ViewComputationCacheSource: Send + Sync {
    /// Cache for one (cycle, configuration), created on first use.
    fn get_cache(&self, cycle_id: &UniqueId, calculation_configuration: &str)
        -> Arc<ViewComputationCache>;

    /// Discard every cache of `cycle_id`.
    fn release_caches(&self, cycle_id: &UniqueId);
}

/// In-process cache source.
#[derive(Debug, Default)]
pub struct InMemoryViewComputationCacheSource {
    caches: DashMap<(UniqueId, String), Arc<ViewComputationCache>>,
}

impl InMemoryViewComputationCacheSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live caches.
    pub fn cache_count(&self) -> usize {
        self.caches.len()
    }
}

impl ViewComputationCacheSource for InMemoryViewComputationCacheSource {
    fn get_cache(
        &self,
        cycle_id: &UniqueId,
        calculation_configuration: &str,
    ) -> Arc<ViewComputationCache> {
        let key = (cycle_id.clone(), calculation_configuration.to_string());
        Arc::clone(
            self.caches
                .entry(key)
                .or_insert_with(|| Arc::new(ViewComputationCache::new(calculation_configuration)))
                .value(),
        )
    }

    fn release_caches(&self, cycle_id: &UniqueId) {
        let before = self.caches.len();
        self.caches.retain(|(id, _), _| id != cycle_id);
        debug!(
            cycle = %cycle_id,
            released = before - self.caches.len(),
            "computation_caches_released"
        );
    }
}
