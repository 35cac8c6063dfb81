use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use terrace_domain::{Address, Attributes, Value};
use uuid::Uuid;

use crate::error::StoreError;

/// Version of the persisted snapshot layout.
pub const SNAPSHOT_FORMAT_VERSION: u32 = 1;

/// Opaque provider bookkeeping, stored verbatim.
pub type Private = serde_json::Value;

/// A resource as recorded after its last confirmed operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateEntity {
    pub address: Address,
    pub provider_id: String,
    /// Last-known concrete attribute values, including provider-computed ones.
    pub attributes: Attributes,
    /// Addresses this entity referenced when it was last applied.
    #[serde(default)]
    pub dependencies: BTreeSet<Address>,
    #[serde(default)]
    pub schema_version: u64,
    #[serde(default)]
    pub private: Private,
}

impl StateEntity {
    pub fn new(address: Address, provider_id: impl Into<String>, attributes: Attributes) -> Self {
        StateEntity {
            address,
            provider_id: provider_id.into(),
            attributes,
            dependencies: BTreeSet::new(),
            schema_version: 0,
            private: Private::Null,
        }
    }

    pub fn attribute(&self, name: &str) -> Option<&Value> {
        self.attributes.get(name)
    }
}

/// One versioned record of everything a workspace manages.
///
/// Persisted as a single blob; `serial` and `lineage` travel inside it so any
/// backend can validate a write from the blob plus its compare-and-swap
/// primitive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub version: u32,
    pub lineage: String,
    pub serial: u64,
    pub entities: BTreeMap<Address, StateEntity>,
    /// Old instances of create-before-destroy replacements whose destroy has
    /// not been confirmed yet.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub deposed: Vec<StateEntity>,
    #[serde(default)]
    pub outputs: BTreeMap<String, Value>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl StateSnapshot {
    pub fn new(lineage: impl Into<String>) -> Self {
        StateSnapshot {
            version: SNAPSHOT_FORMAT_VERSION,
            lineage: lineage.into(),
            serial: 0,
            entities: BTreeMap::new(),
            deposed: Vec::new(),
            outputs: BTreeMap::new(),
            updated_at: None,
        }
    }

    /// A snapshot starting a brand new lineage.
    pub fn fresh() -> Self {
        Self::new(Uuid::new_v4().to_string())
    }

    pub fn entity(&self, address: &Address) -> Option<&StateEntity> {
        self.entities.get(address)
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty() && self.deposed.is_empty()
    }

    /// Number of tracked objects, deposed ones included.
    pub fn resource_count(&self) -> usize {
        self.entities.len() + self.deposed.len()
    }

    pub fn upsert(&mut self, entity: StateEntity) {
        self.entities.insert(entity.address.clone(), entity);
    }

    pub fn remove(&mut self, address: &Address) -> Option<StateEntity> {
        self.entities.remove(address)
    }

    /// Equality over everything a write would change; `serial` and
    /// `updated_at` are stamped by the store and ignored here.
    pub fn same_content(&self, other: &StateSnapshot) -> bool {
        self.lineage == other.lineage
            && self.entities == other.entities
            && self.deposed == other.deposed
            && self.outputs == other.outputs
    }
}

/// Compare-and-swap rule shared by every backend.
///
/// Must run inside the backend's atomic section. Returns the snapshot to
/// persist, or `None` when `next` carries nothing new (the write succeeds
/// without bumping `serial`).
pub fn prepare_write(
    key: &str,
    current: Option<&StateSnapshot>,
    next: &StateSnapshot,
    expected_serial: u64,
) -> Result<Option<StateSnapshot>, StoreError> {
    let actual = current.map_or(0, |s| s.serial);
    if actual != expected_serial {
        return Err(StoreError::Conflict {
            key: key.to_string(),
            expected: expected_serial,
            actual,
        });
    }

    if let Some(current) = current {
        if current.lineage != next.lineage {
            return Err(StoreError::LineageMismatch {
                key: key.to_string(),
                expected: next.lineage.clone(),
                actual: current.lineage.clone(),
            });
        }
        if current.same_content(next) {
            return Ok(None);
        }
    }

    let mut out = next.clone();
    out.version = SNAPSHOT_FORMAT_VERSION;
    out.serial = expected_serial + 1;
    out.updated_at = Some(Utc::now());
    Ok(Some(out))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entity(name: &str) -> StateEntity {
        StateEntity::new(Address::new("host", name), "local", Attributes::new())
    }

    #[test]
    fn first_write_creates_serial_one() {
        let next = StateSnapshot::new("lin");
        let out = prepare_write("k", None, &next, 0).unwrap().unwrap();
        assert_eq!(out.serial, 1);
        assert!(out.updated_at.is_some());
    }

    #[test]
    fn stale_serial_is_a_conflict() {
        let mut current = StateSnapshot::new("lin");
        current.serial = 4;
        let err = prepare_write("k", Some(&current), &current, 3).unwrap_err();
        assert!(matches!(err, StoreError::Conflict { expected: 3, actual: 4, .. }));
    }

    #[test]
    fn foreign_lineage_is_rejected() {
        let mut current = StateSnapshot::new("lin-a");
        current.serial = 2;
        let next = StateSnapshot::new("lin-b");
        let err = prepare_write("k", Some(&current), &next, 2).unwrap_err();
        assert!(matches!(err, StoreError::LineageMismatch { .. }));
    }

    #[test]
    fn unchanged_content_keeps_serial() {
        let mut current = StateSnapshot::new("lin");
        current.serial = 7;
        current.upsert(entity("a"));
        let next = current.clone();
        assert!(prepare_write("k", Some(&current), &next, 7).unwrap().is_none());
    }

    #[test]
    fn changed_content_bumps_serial() {
        let mut current = StateSnapshot::new("lin");
        current.serial = 7;
        let mut next = current.clone();
        next.upsert(entity("a"));
        let out = prepare_write("k", Some(&current), &next, 7).unwrap().unwrap();
        assert_eq!(out.serial, 8);
        assert!(out.entity(&Address::new("host", "a")).is_some());
    }

    #[test]
    fn blob_carries_serial_lineage_and_entities() {
        let mut snap = StateSnapshot::new("lin");
        snap.serial = 3;
        snap.upsert(entity("a"));
        let json = serde_json::to_value(&snap).unwrap();
        assert_eq!(json["serial"], 3);
        assert_eq!(json["lineage"], "lin");
        assert!(json["entities"]["host.a"].is_object());
    }
}
