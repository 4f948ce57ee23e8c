//! Value identifiers: what a function can produce and what a caller asks for.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::target::ComputationTargetSpecification;

// =============================================================================
// Properties
// =============================================================================

/// Sorted property map. An empty value set stands for "any value".
///
/// Used both as the concrete property set of a [`ValueSpecification`] and as
/// the constraint set of a [`ValueRequirement`]. Constraints may additionally
/// mark properties optional.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ValueProperties {
    #[serde(default)]
    properties: BTreeMap<String, BTreeSet<String>>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    optional: BTreeSet<String>,
}

impl ValueProperties {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `value` to property `name`.
    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties
            .entry(name.into())
            .or_default()
            .insert(value.into());
        self
    }

    /// Declare `name` with any value.
    pub fn with_any(mut self, name: impl Into<String>) -> Self {
        self.properties.insert(name.into(), BTreeSet::new());
        self
    }

    /// Mark `name` optional: a candidate lacking it still satisfies.
    pub fn with_optional(mut self, name: impl Into<String>) -> Self {
        let name = name.into();
        self.properties.entry(name.clone()).or_default();
        self.optional.insert(name);
        self
    }

    /// Values of `name`; an empty set means any value.
    pub fn values(&self, name: &str) -> Option<&BTreeSet<String>> {
        self.properties.get(name)
    }

    /// First value of `name`, if it has a concrete one.
    pub fn first_value(&self, name: &str) -> Option<&str> {
        self.properties
            .get(name)
            .and_then(|values| values.iter().next())
            .map(String::as_str)
    }

    pub fn is_optional(&self, name: &str) -> bool {
        self.optional.contains(name)
    }

    pub fn property_names(&self) -> impl Iterator<Item = &str> {
        self.properties.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.properties.is_empty()
    }

    /// Whether `properties` meets every constraint in `self`.
    pub fn is_satisfied_by(&self, properties: &ValueProperties) -> bool {
        self.properties.iter().all(|(name, wanted)| {
            match properties.values(name) {
                None => self.is_optional(name),
                Some(offered) => {
                    wanted.is_empty()
                        || offered.is_empty()
                        || wanted.iter().any(|value| offered.contains(value))
                }
            }
        })
    }
}

impl fmt::Display for ValueProperties {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, (name, values)) in self.properties.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{name}")?;
            if self.is_optional(name) {
                write!(f, "?")?;
            }
            if !values.is_empty() {
                let joined: Vec<&str> = values.iter().map(String::as_str).collect();
                write!(f, "=[{}]", joined.join(","))?;
            }
        }
        write!(f, "}}")
    }
}

// =============================================================================
// Specifications
// =============================================================================

#[derive(Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
struct SpecificationData {
    value_name: String,
    target: ComputationTargetSpecification,
    properties: ValueProperties,
}

/// A concrete producible value: name, target and property set.
///
/// Reference counted, so clones are cheap and share storage. Equality and
/// hashing are structural; equality short-circuits on shared storage.
#[derive(Clone)]
pub struct ValueSpecification(Arc<SpecificationData>);

impl ValueSpecification {
    pub fn new(
        value_name: impl Into<String>,
        target: ComputationTargetSpecification,
        properties: ValueProperties,
    ) -> Self {
        Self(Arc::new(SpecificationData {
            value_name: value_name.into(),
            target,
            properties,
        }))
    }

    pub fn value_name(&self) -> &str {
        &self.0.value_name
    }

    pub fn target(&self) -> &ComputationTargetSpecification {
        &self.0.target
    }

    pub fn properties(&self) -> &ValueProperties {
        &self.0.properties
    }

    /// Same name and properties on a different target.
    pub fn with_target(&self, target: ComputationTargetSpecification) -> Self {
        Self::new(self.value_name(), target, self.properties().clone())
    }

    /// Whether `self` and `other` share storage.
    pub fn ptr_eq(&self, other: &ValueSpecification) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl PartialEq for ValueSpecification {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other) || self.0 == other.0
    }
}

impl Eq for ValueSpecification {}

impl Hash for ValueSpecification {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.hash(state);
    }
}

impl PartialOrd for ValueSpecification {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ValueSpecification {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        if self.ptr_eq(other) {
            return std::cmp::Ordering::Equal;
        }
        self.0.cmp(&other.0)
    }
}

impl fmt::Debug for ValueSpecification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ValueSpecification({self})")
    }
}

impl fmt::Display for ValueSpecification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}@{}{}",
            self.value_name(),
            self.target(),
            self.properties()
        )
    }
}

impl Serialize for ValueSpecification {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.0.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for ValueSpecification {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        SpecificationData::deserialize(deserializer).map(|data| Self(Arc::new(data)))
    }
}

// =============================================================================
// Requirements
// =============================================================================

/// A request for a value: name, target and constraints.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ValueRequirement {
    value_name: String,
    target: ComputationTargetSpecification,
    #[serde(default)]
    constraints: ValueProperties,
}

impl ValueRequirement {
    pub fn new(
        value_name: impl Into<String>,
        target: ComputationTargetSpecification,
        constraints: ValueProperties,
    ) -> Self {
        Self {
            value_name: value_name.into(),
            target,
            constraints,
        }
    }

    /// A requirement with no constraints.
    pub fn unconstrained(value_name: impl Into<String>, target: ComputationTargetSpecification) -> Self {
        Self::new(value_name, target, ValueProperties::new())
    }

    pub fn value_name(&self) -> &str {
        &self.value_name
    }

    pub fn target(&self) -> &ComputationTargetSpecification {
        &self.target
    }

    pub fn constraints(&self) -> &ValueProperties {
        &self.constraints
    }

    /// Whether `specification` would satisfy this request.
    pub fn is_satisfied_by(&self, specification: &ValueSpecification) -> bool {
        self.value_name == specification.value_name()
            && &self.target == specification.target()
            && self.constraints.is_satisfied_by(specification.properties())
    }
}

impl fmt::Display for ValueRequirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}{}", self.value_name, self.target, self.constraints)
    }
}
