use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::error::DomainError;

/// Attribute name → value. Ordered so that every rendering of a spec, a
/// snapshot or a plan is deterministic.
pub type Attributes = BTreeMap<String, Value>;

// ── Identifiers ──────────────────────────────────────────────────────────────

/// `<type>.<name>`, unique within a workspace.
///
/// Ordering is plain lexicographic order of the rendered address; the plan
/// builder relies on it for stable tie-breaking.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Address(String);

impl Address {
    pub fn new(resource_type: &str, name: &str) -> Self {
        Address(format!("{resource_type}.{name}"))
    }

    pub fn parse(s: &str) -> Result<Self, DomainError> {
        let (ty, name) = s
            .split_once('.')
            .ok_or_else(|| DomainError::InvalidAddress(s.to_string()))?;
        if !is_identifier(ty) || !is_identifier(name) {
            return Err(DomainError::InvalidAddress(s.to_string()));
        }
        Ok(Address(s.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn resource_type(&self) -> &str {
        self.0.split_once('.').map_or(self.0.as_str(), |(ty, _)| ty)
    }

    pub fn name(&self) -> &str {
        self.0.split_once('.').map_or("", |(_, name)| name)
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A pointer at one attribute of another resource: `<type>.<name>.<attribute>`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Reference {
    pub address: Address,
    pub attribute: String,
}

impl Reference {
    pub fn new(address: Address, attribute: impl Into<String>) -> Self {
        Reference { address, attribute: attribute.into() }
    }

    pub fn parse(s: &str) -> Result<Self, DomainError> {
        let mut parts = s.splitn(3, '.');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(ty), Some(name), Some(attr))
                if is_identifier(ty) && is_identifier(name) && !attr.is_empty() =>
            {
                Ok(Reference::new(Address::new(ty, name), attr))
            }
            _ => Err(DomainError::InvalidReference(s.to_string())),
        }
    }
}

impl std::fmt::Display for Reference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.address, self.attribute)
    }
}

/// Identifier rule shared by resource types, resource names and workspace names.
pub fn is_identifier(s: &str) -> bool {
    !s.is_empty()
        && s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

// ── Values ────────────────────────────────────────────────────────────────────

/// A fully evaluated attribute value, or a reference that is resolved once the
/// referenced resource has been applied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Value {
    Null,
    String(String),
    Number(f64),
    Bool(bool),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
    Reference(Reference),
}

impl Value {
    /// True when no reference appears anywhere inside this value.
    pub fn is_known(&self) -> bool {
        let mut refs = Vec::new();
        self.collect_references(&mut refs);
        refs.is_empty()
    }

    pub fn references(&self) -> Vec<&Reference> {
        let mut refs = Vec::new();
        self.collect_references(&mut refs);
        refs
    }

    fn collect_references<'a>(&'a self, out: &mut Vec<&'a Reference>) {
        match self {
            Value::Reference(r) => out.push(r),
            Value::List(items) => items.iter().for_each(|v| v.collect_references(out)),
            Value::Map(map) => map.values().for_each(|v| v.collect_references(out)),
            Value::Null | Value::String(_) | Value::Number(_) | Value::Bool(_) => {}
        }
    }

    /// Substitute every reference through `lookup`.
    ///
    /// Returns the first reference `lookup` could not answer.
    pub fn resolve<F>(&self, lookup: &F) -> Result<Value, Reference>
    where
        F: Fn(&Reference) -> Option<Value>,
    {
        match self {
            Value::Reference(r) => lookup(r).ok_or_else(|| r.clone()),
            Value::List(items) => items
                .iter()
                .map(|v| v.resolve(lookup))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::List),
            Value::Map(map) => map
                .iter()
                .map(|(k, v)| v.resolve(lookup).map(|v| (k.clone(), v)))
                .collect::<Result<BTreeMap<_, _>, _>>()
                .map(Value::Map),
            other => Ok(other.clone()),
        }
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::String(s) => write!(f, "{s:?}"),
            Value::Number(n) => write!(f, "{n}"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::List(items) => {
                write!(f, "[")?;
                for (i, v) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{v}")?;
                }
                write!(f, "]")
            }
            Value::Map(map) => {
                write!(f, "{{")?;
                for (i, (k, v)) in map.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{k} = {v}")?;
                }
                write!(f, "}}")
            }
            Value::Reference(r) => write!(f, "${{{r}}}"),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Number(n as f64)
    }
}

impl From<Reference> for Value {
    fn from(r: Reference) -> Self {
        Value::Reference(r)
    }
}

// ── Resource specifications ──────────────────────────────────────────────────

/// A declared resource, already evaluated by the configuration front end.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceSpec {
    #[serde(rename = "type")]
    pub resource_type: String,
    pub name: String,
    pub attributes: Attributes,
    pub provider_id: String,
    /// Explicit ordering hints in addition to attribute references.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub depends_on: BTreeSet<Address>,
}

impl ResourceSpec {
    pub fn new(
        resource_type: impl Into<String>,
        name: impl Into<String>,
        provider_id: impl Into<String>,
    ) -> Self {
        ResourceSpec {
            resource_type: resource_type.into(),
            name: name.into(),
            attributes: Attributes::new(),
            provider_id: provider_id.into(),
            depends_on: BTreeSet::new(),
        }
    }

    pub fn with_attribute(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }

    pub fn with_depends_on(mut self, address: Address) -> Self {
        self.depends_on.insert(address);
        self
    }

    pub fn address(&self) -> Address {
        Address::new(&self.resource_type, &self.name)
    }

    /// Every reference found in the attributes, in attribute order.
    pub fn references(&self) -> Vec<&Reference> {
        self.attributes.values().flat_map(|v| v.references()).collect()
    }

    /// Addresses this spec must be applied after: referenced resources plus
    /// explicit `depends_on` hints.
    pub fn dependencies(&self) -> BTreeSet<Address> {
        self.references()
            .into_iter()
            .map(|r| r.address.clone())
            .chain(self.depends_on.iter().cloned())
            .collect()
    }
}
