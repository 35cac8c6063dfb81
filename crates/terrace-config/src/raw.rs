use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Raw YAML representation of one resource document.
#[derive(Debug, Deserialize, Serialize)]
pub struct RawDocument {
    #[serde(default)]
    pub resources: Vec<RawResource>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct RawResource {
    #[serde(rename = "type")]
    pub resource_type: String,
    pub name: String,
    /// Provider id; absent means the built-in `local` provider.
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub attributes: BTreeMap<String, serde_yaml::Value>,
    /// Addresses (`type.name`) this resource must be applied after.
    #[serde(default)]
    pub depends_on: Vec<String>,
}

fn default_provider() -> String {
    "local".into()
}
