use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};

use terrace_domain::types::is_identifier;
use terrace_domain::{Address, Reference, ResourceSpec, Value};
use tracing::debug;

use crate::error::ConfigError;
use crate::raw::{RawDocument, RawResource};

/// Key of the single-entry mapping that marks a reference.
const REF_KEY: &str = "$ref";

/// Load every resource document in `dir`.
///
/// Every `*.yml` / `*.yaml` file directly inside `dir` is read, in file name
/// order, and must look like:
/// ```text
/// resources:
///   - type: host
///     name: web
///     provider: local          # optional, defaults to "local"
///     attributes:
///       size: small
///       subnet: { $ref: net.main.id }
///     depends_on: [dns.zone]   # optional
/// ```
/// Specs are returned in declaration order.
pub fn load_specs(dir: &Path) -> Result<Vec<ResourceSpec>, ConfigError> {
    let entries = std::fs::read_dir(dir).map_err(|e| ConfigError::Io {
        path: dir.display().to_string(),
        source: e,
    })?;

    let mut files: Vec<PathBuf> = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| ConfigError::Io {
            path: dir.display().to_string(),
            source: e,
        })?;
        let path = entry.path();
        let is_yaml = matches!(
            path.extension().and_then(|e| e.to_str()),
            Some("yml") | Some("yaml")
        );
        if path.is_file() && is_yaml {
            files.push(path);
        }
    }
    files.sort();

    let mut specs = Vec::new();
    let mut seen: HashMap<Address, String> = HashMap::new();
    for path in files {
        let content = std::fs::read_to_string(&path).map_err(|e| ConfigError::Io {
            path: path.display().to_string(),
            source: e,
        })?;
        let label = path.display().to_string();
        debug!(path = %label, "loading resource document");
        for spec in parse_specs(&content, &label)? {
            let address = spec.address();
            if let Some(first) = seen.get(&address) {
                return Err(ConfigError::Duplicate {
                    address: address.to_string(),
                    path: label,
                    first: first.clone(),
                });
            }
            seen.insert(address, label.clone());
            specs.push(spec);
        }
    }
    Ok(specs)
}

/// Parse one resource document. `path` is only used in error messages.
pub fn parse_specs(content: &str, path: &str) -> Result<Vec<ResourceSpec>, ConfigError> {
    let raw: RawDocument = serde_yaml::from_str(content).map_err(|e| ConfigError::YamlParse {
        path: path.to_string(),
        source: e,
    })?;
    let mut specs = Vec::with_capacity(raw.resources.len());
    let mut seen: HashSet<Address> = HashSet::new();
    for resource in raw.resources {
        let spec = convert_resource(resource, path)?;
        if !seen.insert(spec.address()) {
            return Err(ConfigError::Duplicate {
                address: spec.address().to_string(),
                path: path.to_string(),
                first: path.to_string(),
            });
        }
        specs.push(spec);
    }
    Ok(specs)
}

fn convert_resource(raw: RawResource, path: &str) -> Result<ResourceSpec, ConfigError> {
    for (what, value) in [("type", &raw.resource_type), ("name", &raw.name), ("provider", &raw.provider)] {
        if !is_identifier(value) {
            return Err(ConfigError::Conversion {
                path: path.to_string(),
                message: format!("invalid resource {what} '{value}'"),
            });
        }
    }

    let mut spec = ResourceSpec::new(raw.resource_type, raw.name, raw.provider);
    for (name, value) in raw.attributes {
        let value = convert_value(value, path)?;
        spec.attributes.insert(name, value);
    }
    for dep in raw.depends_on {
        spec.depends_on.insert(Address::parse(&dep)?);
    }
    Ok(spec)
}

fn convert_value(value: serde_yaml::Value, path: &str) -> Result<Value, ConfigError> {
    use serde_yaml::Value as Y;

    let conversion = |message: String| ConfigError::Conversion {
        path: path.to_string(),
        message,
    };

    match value {
        Y::Null => Ok(Value::Null),
        Y::Bool(b) => Ok(Value::Bool(b)),
        Y::Number(n) => n
            .as_f64()
            .map(Value::Number)
            .ok_or_else(|| conversion(format!("number {n} is out of range"))),
        Y::String(s) => Ok(Value::String(s)),
        Y::Sequence(items) => items
            .into_iter()
            .map(|v| convert_value(v, path))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::List),
        Y::Mapping(map) => {
            if map.len() == 1 {
                if let Some(target) = map.get(REF_KEY) {
                    let target = target
                        .as_str()
                        .ok_or_else(|| conversion(format!("{REF_KEY} must be a string")))?;
                    return Ok(Value::Reference(Reference::parse(target)?));
                }
            }
            let mut out = BTreeMap::new();
            for (k, v) in map {
                let key = match k {
                    Y::String(s) => s,
                    other => return Err(conversion(format!("map key {other:?} is not a string"))),
                };
                out.insert(key, convert_value(v, path)?);
            }
            Ok(Value::Map(out))
        }
        Y::Tagged(tagged) => Err(conversion(format!("unsupported YAML tag {}", tagged.tag))),
    }
}
