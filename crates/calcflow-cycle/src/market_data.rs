//! Market data snapshots and override operations.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use anyhow::{anyhow, bail, Context};
use calcflow_core::ValueSpecification;
use serde_json::Value;
use tracing::warn;

/// Default-property name holding a configuration's market data shift.
pub const MARKET_DATA_SHIFT: &str = "MARKET_DATA_SHIFT";

/// Source of market data values for a cycle.
pub trait MarketDataSnapshot: Send + Sync {
    /// Values for the requested specifications; absent entries are unavailable.
    fn query(&self, specifications: &HashSet<ValueSpecification>) -> HashMap<ValueSpecification, Value>;
}

#[derive(Debug, Clone, Default)]
pub struct InMemoryMarketDataSnapshot {
    values: HashMap<ValueSpecification, Value>,
}

impl InMemoryMarketDataSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_value(mut self, specification: ValueSpecification, value: impl Into<Value>) -> Self {
        self.values.insert(specification, value.into());
        self
    }

    pub fn insert(&mut self, specification: ValueSpecification, value: impl Into<Value>) {
        self.values.insert(specification, value.into());
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl MarketDataSnapshot for InMemoryMarketDataSnapshot {
    fn query(&self, specifications: &HashSet<ValueSpecification>) -> HashMap<ValueSpecification, Value> {
        specifications
            .iter()
            .filter_map(|spec| self.values.get(spec).map(|value| (spec.clone(), value.clone())))
            .collect()
    }
}

/// Transforms a market data value before it enters the cache.
///
/// Returning `None` discards the value, which is then treated as missing.
pub trait OverrideOperation: Send + Sync {
    fn apply(&self, specification: &ValueSpecification, value: Value) -> Option<Value>;
}

/// Compiles override expressions into operations.
pub trait OverrideOperationCompiler: Send + Sync {
    fn compile(&self, expression: &str) -> anyhow::Result<Arc<dyn OverrideOperation>>;
}

/// Numeric shift: `*<factor>` scales, `+<offset>` and `-<offset>` add.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ShiftOperation {
    Multiply(f64),
    Add(f64),
}

impl OverrideOperation for ShiftOperation {
    fn apply(&self, specification: &ValueSpecification, value: Value) -> Option<Value> {
        let Some(number) = value.as_f64() else {
            return Some(value);
        };
        let shifted = match self {
            Self::Multiply(factor) => number * factor,
            Self::Add(offset) => number + offset,
        };
        let shifted = serde_json::Number::from_f64(shifted).map(Value::Number);
        if shifted.is_none() {
            warn!(
                specification = %specification,
                value = number,
                shift = ?self,
                "market_data_shift_not_finite"
            );
        }
        shifted
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ShiftOperationCompiler;

impl ShiftOperationCompiler {
    fn parse(expression: &str) -> anyhow::Result<ShiftOperation> {
        let expression = expression.trim();
        let mut chars = expression.chars();
        let operator = chars
            .next()
            .ok_or_else(|| anyhow!("empty shift expression"))?;
        let operand = chars.as_str().trim();
        let parse_operand = || {
            operand
                .parse::<f64>()
                .with_context(|| format!("invalid shift operand in {expression:?}"))
        };
        match operator {
            '*' => Ok(ShiftOperation::Multiply(parse_operand()?)),
            '+' => Ok(ShiftOperation::Add(parse_operand()?)),
            '-' => Ok(ShiftOperation::Add(-parse_operand()?)),
            other => bail!("unsupported shift operator {other:?} in {expression:?}"),
        }
    }
}

impl OverrideOperationCompiler for ShiftOperationCompiler {
    fn compile(&self, expression: &str) -> anyhow::Result<Arc<dyn OverrideOperation>> {
        Ok(Arc::new(Self::parse(expression)?))
    }
}
