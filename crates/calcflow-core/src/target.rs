//! Computation targets: the business objects functions are applied to.
//!
//! A [`ComputationTargetSpecification`] is the lightweight, hashable handle
//! (kind, id and the chain of context parents it was reached through). A
//! [`ComputationTarget`] pairs a specification with its resolved payload.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::id::UniqueId;

// =============================================================================
// Target kinds and types
// =============================================================================

/// A named kind of business object, optionally refining a parent kind.
///
/// `EQUITY_SECURITY` refining `SECURITY` means a function declared on
/// securities also applies to equities.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TargetKind {
    name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    parent: Option<Box<TargetKind>>,
}

impl TargetKind {
    /// A kind with no parent.
    pub fn root(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            parent: None,
        }
    }

    /// A kind refining `parent`.
    pub fn derived(name: impl Into<String>, parent: &TargetKind) -> Self {
        Self {
            name: name.into(),
            parent: Some(Box::new(parent.clone())),
        }
    }

    pub fn portfolio_node() -> Self {
        Self::root("PORTFOLIO_NODE")
    }

    pub fn position() -> Self {
        Self::root("POSITION")
    }

    pub fn trade() -> Self {
        Self::root("TRADE")
    }

    pub fn security() -> Self {
        Self::root("SECURITY")
    }

    pub fn primitive() -> Self {
        Self::root("PRIMITIVE")
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn parent(&self) -> Option<&TargetKind> {
        self.parent.as_deref()
    }

    /// True if `self` is `other` or refines it.
    pub fn is_a(&self, other: &TargetKind) -> bool {
        let mut current = Some(self);
        while let Some(kind) = current {
            if kind == other {
                return true;
            }
            current = kind.parent();
        }
        false
    }
}

impl fmt::Display for TargetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

/// Declared or concrete type of a computation target.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ComputationTargetType {
    /// The empty target, used by functions that take no target.
    Null,
    /// A single kind (and, when declared, anything refining it).
    Simple(TargetKind),
    /// Any of the listed kinds.
    Union(Vec<TargetKind>),
    /// A context path, outermost first, e.g. `PORTFOLIO_NODE/POSITION`.
    Nested(Vec<TargetKind>),
}

impl ComputationTargetType {
    pub fn of(kind: TargetKind) -> Self {
        Self::Simple(kind)
    }

    pub fn union(kinds: impl IntoIterator<Item = TargetKind>) -> Self {
        Self::Union(kinds.into_iter().collect())
    }

    /// A nested path. A single-element path collapses to [`Self::Simple`].
    pub fn nested(path: impl IntoIterator<Item = TargetKind>) -> Self {
        let mut path: Vec<TargetKind> = path.into_iter().collect();
        match path.len() {
            0 => Self::Null,
            1 => Self::Simple(path.remove(0)),
            _ => Self::Nested(path),
        }
    }

    /// The innermost kind of a concrete type.
    pub fn leaf_kind(&self) -> Option<&TargetKind> {
        match self {
            Self::Null | Self::Union(_) => None,
            Self::Simple(kind) => Some(kind),
            Self::Nested(path) => path.last(),
        }
    }

    /// Number of context parents a target of `concrete` type keeps once it is
    /// presented to a function declared on `self`. `None` if the declared type
    /// does not apply.
    ///
    /// This is the uncached computation behind [`crate::TargetTypeAdjuster`].
    pub fn context_depth_for(&self, concrete: &ComputationTargetType) -> Option<usize> {
        match (self, concrete) {
            (Self::Null, Self::Null) => Some(0),
            (Self::Null, _) | (_, Self::Null) | (_, Self::Union(_)) => None,
            (Self::Simple(declared), _) => concrete
                .leaf_kind()
                .filter(|leaf| leaf.is_a(declared))
                .map(|_| 0),
            (Self::Union(declared), _) => concrete
                .leaf_kind()
                .filter(|leaf| declared.iter().any(|d| leaf.is_a(d)))
                .map(|_| 0),
            (Self::Nested(declared), Self::Nested(path)) => {
                if path.len() < declared.len() {
                    return None;
                }
                let suffix = &path[path.len() - declared.len()..];
                suffix
                    .iter()
                    .zip(declared)
                    .all(|(concrete, declared)| concrete.is_a(declared))
                    .then(|| declared.len() - 1)
            }
            (Self::Nested(_), Self::Simple(_)) => None,
        }
    }

    /// Whether a function declared on `self` applies to a target of `concrete` type.
    pub fn is_compatible(&self, concrete: &ComputationTargetType) -> bool {
        self.context_depth_for(concrete).is_some()
    }
}

impl fmt::Display for ComputationTargetType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let join = |kinds: &[TargetKind], sep: &str| {
            kinds
                .iter()
                .map(|k| k.name().to_string())
                .collect::<Vec<_>>()
                .join(sep)
        };
        match self {
            Self::Null => write!(f, "NULL"),
            Self::Simple(kind) => write!(f, "{kind}"),
            Self::Union(kinds) => write!(f, "{}", join(kinds, "|")),
            Self::Nested(path) => write!(f, "{}", join(path, "/")),
        }
    }
}

// =============================================================================
// Specifications and targets
// =============================================================================

/// Hashable handle to a computation target.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ComputationTargetSpecification {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    kind: Option<TargetKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    id: Option<UniqueId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    parent: Option<Box<ComputationTargetSpecification>>,
}

impl ComputationTargetSpecification {
    /// The null target.
    pub fn null() -> Self {
        Self {
            kind: None,
            id: None,
            parent: None,
        }
    }

    pub fn of(kind: TargetKind, id: UniqueId) -> Self {
        Self {
            kind: Some(kind),
            id: Some(id),
            parent: None,
        }
    }

    /// A target of the given kind with no identifier.
    pub fn anonymous(kind: TargetKind) -> Self {
        Self {
            kind: Some(kind),
            id: None,
            parent: None,
        }
    }

    /// Place this target inside a context parent.
    pub fn with_parent(mut self, parent: ComputationTargetSpecification) -> Self {
        self.parent = Some(Box::new(parent));
        self
    }

    pub fn kind(&self) -> Option<&TargetKind> {
        self.kind.as_ref()
    }

    pub fn unique_id(&self) -> Option<&UniqueId> {
        self.id.as_ref()
    }

    pub fn parent(&self) -> Option<&ComputationTargetSpecification> {
        self.parent.as_deref()
    }

    pub fn is_null(&self) -> bool {
        self.kind.is_none()
    }

    /// Number of context parents above this target.
    pub fn context_depth(&self) -> usize {
        let mut depth = 0;
        let mut current = self.parent();
        while let Some(parent) = current {
            depth += 1;
            current = parent.parent();
        }
        depth
    }

    /// Concrete type: the kinds along the context chain, outermost first.
    pub fn target_type(&self) -> ComputationTargetType {
        if self.is_null() {
            return ComputationTargetType::Null;
        }
        let mut path = Vec::new();
        let mut current = Some(self);
        while let Some(spec) = current {
            if let Some(kind) = spec.kind() {
                path.push(kind.clone());
            }
            current = spec.parent();
        }
        path.reverse();
        ComputationTargetType::nested(path)
    }

    /// Copy of this specification keeping at most `parents` context levels.
    pub fn truncated(&self, parents: usize) -> Self {
        Self {
            kind: self.kind.clone(),
            id: self.id.clone(),
            parent: match (parents, &self.parent) {
                (0, _) | (_, None) => None,
                (n, Some(parent)) => Some(Box::new(parent.truncated(n - 1))),
            },
        }
    }

    /// Structural identity check used to validate function results.
    ///
    /// Walks the identifier and the parent chain of `self`; every level present
    /// on `self` must name the same object as the corresponding level of `other`.
    pub fn same_identity(&self, other: &ComputationTargetSpecification) -> bool {
        let mut left = Some(self);
        let mut right = Some(other);
        while let Some(l) = left {
            let Some(r) = right else {
                return false;
            };
            let ids_match = match (l.unique_id(), r.unique_id()) {
                (Some(a), Some(b)) => a.same_object(b),
                (None, None) => true,
                _ => false,
            };
            if !ids_match {
                return false;
            }
            left = l.parent();
            right = r.parent();
        }
        true
    }
}

impl fmt::Display for ComputationTargetSpecification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(parent) = self.parent() {
            write!(f, "{parent}/")?;
        }
        match (&self.kind, &self.id) {
            (None, _) => write!(f, "NULL"),
            (Some(kind), Some(id)) => write!(f, "{kind}~{id}"),
            (Some(kind), None) => write!(f, "{kind}"),
        }
    }
}

/// A resolved computation target: specification plus payload.
#[derive(Debug, Clone, PartialEq)]
pub struct ComputationTarget {
    specification: ComputationTargetSpecification,
    value: Arc<Value>,
}

impl ComputationTarget {
    pub fn new(specification: ComputationTargetSpecification, value: Value) -> Self {
        Self {
            specification,
            value: Arc::new(value),
        }
    }

    pub fn null() -> Self {
        Self::new(ComputationTargetSpecification::null(), Value::Null)
    }

    pub fn specification(&self) -> &ComputationTargetSpecification {
        &self.specification
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    pub fn unique_id(&self) -> Option<&UniqueId> {
        self.specification.unique_id()
    }

    pub fn target_type(&self) -> ComputationTargetType {
        self.specification.target_type()
    }

    /// The same target with its context chain cut to `parents` levels.
    pub fn with_context_depth(&self, parents: usize) -> Self {
        if self.specification.context_depth() <= parents {
            return self.clone();
        }
        Self {
            specification: self.specification.truncated(parents),
            value: Arc::clone(&self.value),
        }
    }
}

// =============================================================================
// Target resolution
// =============================================================================

/// Resolves specifications to live targets.
pub trait ComputationTargetResolver: Send + Sync {
    fn resolve(&self, specification: &ComputationTargetSpecification) -> Option<ComputationTarget>;
}

/// Map-backed resolver.
#[derive(Debug, Default, Clone)]
pub struct InMemoryComputationTargetResolver {
    targets: HashMap<ComputationTargetSpecification, ComputationTarget>,
}

impl InMemoryComputationTargetResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, target: ComputationTarget) {
        self.targets.insert(target.specification().clone(), target);
    }

    pub fn with_target(mut self, target: ComputationTarget) -> Self {
        self.add(target);
        self
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }
}

impl ComputationTargetResolver for InMemoryComputationTargetResolver {
    fn resolve(&self, specification: &ComputationTargetSpecification) -> Option<ComputationTarget> {
        if specification.is_null() {
            return Some(ComputationTarget::null());
        }
        self.targets.get(specification).cloned()
    }
}
