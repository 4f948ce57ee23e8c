//! Function identity: id plus parameters.

use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::id::FunctionId;

/// Opaque function parameters.
///
/// Stored as JSON. Equality is JSON equality; [`FunctionParameters::parameter_hash`]
/// is stable for a given document and orders parameters when priorities tie.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FunctionParameters(Value);

impl FunctionParameters {
    /// The empty parameter set.
    pub fn empty() -> Self {
        Self(Value::Null)
    }

    pub fn new(value: Value) -> Self {
        Self(value)
    }

    pub fn value(&self) -> &Value {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_null()
    }

    /// Stable hash of the canonical JSON text.
    pub fn parameter_hash(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.0.to_string().hash(&mut hasher);
        hasher.finish()
    }
}

impl Hash for FunctionParameters {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.parameter_hash().hash(state);
    }
}

impl fmt::Display for FunctionParameters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Value> for FunctionParameters {
    fn from(value: Value) -> Self {
        Self(value)
    }
}

/// A function id bound to its parameters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ParameterizedFunction {
    function_id: FunctionId,
    #[serde(default)]
    parameters: FunctionParameters,
}

impl ParameterizedFunction {
    pub fn new(function_id: FunctionId, parameters: FunctionParameters) -> Self {
        Self {
            function_id,
            parameters,
        }
    }

    /// The market data sourcing function with empty parameters.
    pub fn market_data_sourcing() -> Self {
        Self::new(FunctionId::market_data_sourcing(), FunctionParameters::empty())
    }

    pub fn function_id(&self) -> &FunctionId {
        &self.function_id
    }

    pub fn parameters(&self) -> &FunctionParameters {
        &self.parameters
    }

    /// Same function with different parameters.
    pub fn with_parameters(&self, parameters: FunctionParameters) -> Self {
        Self::new(self.function_id.clone(), parameters)
    }
}

impl fmt::Display for ParameterizedFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.parameters.is_empty() {
            write!(f, "{}", self.function_id)
        } else {
            write!(f, "{}({})", self.function_id, self.parameters)
        }
    }
}
