use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// How a change to one attribute is carried out by the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttributeBehavior {
    /// Can be changed on the live resource.
    Updatable,
    /// Changing it destroys and recreates the resource.
    ForcesReplacement,
    /// Set by the provider. Only compared when the configuration sets it.
    Computed,
}

/// Provider-supplied description of one resource kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceSchema {
    pub resource_type: String,
    pub version: u64,
    pub attributes: BTreeMap<String, AttributeBehavior>,
    pub create_before_destroy: bool,
}

impl ResourceSchema {
    pub fn new(resource_type: impl Into<String>) -> Self {
        ResourceSchema {
            resource_type: resource_type.into(),
            version: 0,
            attributes: BTreeMap::new(),
            create_before_destroy: false,
        }
    }

    pub fn with_version(mut self, version: u64) -> Self {
        self.version = version;
        self
    }

    pub fn with_attribute(mut self, name: impl Into<String>, behavior: AttributeBehavior) -> Self {
        self.attributes.insert(name.into(), behavior);
        self
    }

    pub fn with_create_before_destroy(mut self, enabled: bool) -> Self {
        self.create_before_destroy = enabled;
        self
    }

    /// Attributes the schema does not mention are treated as updatable.
    pub fn behavior(&self, attribute: &str) -> AttributeBehavior {
        self.attributes
            .get(attribute)
            .copied()
            .unwrap_or(AttributeBehavior::Updatable)
    }
}
