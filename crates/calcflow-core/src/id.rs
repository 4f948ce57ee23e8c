//! Identifiers for business objects and functions.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Scheme-qualified identifier of a business object, with an optional version.
///
/// Displayed as `Scheme~Value` or `Scheme~Value~Version`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UniqueId {
    scheme: String,
    value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    version: Option<String>,
}

impl UniqueId {
    /// Create an unversioned identifier.
    pub fn of(scheme: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            scheme: scheme.into(),
            value: value.into(),
            version: None,
        }
    }

    /// Attach a version.
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    pub fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }

    /// The same identifier with the version stripped.
    pub fn object_id(&self) -> Self {
        Self {
            scheme: self.scheme.clone(),
            value: self.value.clone(),
            version: None,
        }
    }

    /// Compare scheme and value, ignoring versions.
    pub fn same_object(&self, other: &UniqueId) -> bool {
        self.scheme == other.scheme && self.value == other.value
    }
}

impl fmt::Display for UniqueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}~{}", self.scheme, self.value)?;
        if let Some(version) = &self.version {
            write!(f, "~{version}")?;
        }
        Ok(())
    }
}

/// Identifier of a function implementation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FunctionId(String);

impl FunctionId {
    /// Reserved id of the leaf nodes that source market data.
    pub fn market_data_sourcing() -> Self {
        Self(MARKET_DATA_SOURCING_FUNCTION.to_string())
    }

    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn name(&self) -> &str {
        &self.0
    }

    pub fn is_market_data_sourcing(&self) -> bool {
        self.0 == MARKET_DATA_SOURCING_FUNCTION
    }
}

/// Function id carried by market data leaf nodes.
pub const MARKET_DATA_SOURCING_FUNCTION: &str = "MarketDataSourcingFunction";

impl fmt::Display for FunctionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for FunctionId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for FunctionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}
