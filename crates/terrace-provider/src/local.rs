use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use terrace_domain::{Address, AttributeBehavior, Attributes, ChangeAction, ResourceSchema, Value};
use terrace_store::StateEntity;
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

use crate::error::ProviderError;
use crate::provider::{OperationRequest, Provider};

#[derive(Debug, Default)]
struct Cloud {
    objects: BTreeMap<Address, Attributes>,
    /// Objects removed behind terrace's back.
    vanished: BTreeSet<Address>,
    failing: BTreeSet<Address>,
}

/// A provider that simulates infrastructure in memory.
///
/// - Accepts every resource type; each object gets a computed `id`.
/// - Objects it has never seen are reported as existing unchanged, so a
///   refresh against a fresh process is harmless.
/// - Drift, out-of-band deletion and operation failures can be injected.
#[derive(Debug, Clone, Default)]
pub struct LocalProvider {
    cloud: Arc<RwLock<Cloud>>,
    schemas: BTreeMap<String, ResourceSchema>,
}

impl LocalProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Override the schema of one resource type. `id` stays computed.
    pub fn with_schema(mut self, schema: ResourceSchema) -> Self {
        let schema = if schema.attributes.contains_key("id") {
            schema
        } else {
            schema.with_attribute("id", AttributeBehavior::Computed)
        };
        self.schemas.insert(schema.resource_type.clone(), schema);
        self
    }

    /// Make every later operation on `address` fail.
    pub async fn fail_on(&self, address: Address) {
        self.cloud.write().await.failing.insert(address);
    }

    /// Change an attribute of a live object without going through terrace.
    pub async fn drift(&self, address: &Address, attribute: &str, value: Value) {
        let mut cloud = self.cloud.write().await;
        if let Some(attrs) = cloud.objects.get_mut(address) {
            attrs.insert(attribute.to_string(), value);
        }
    }

    /// Delete a live object without going through terrace.
    pub async fn remove_out_of_band(&self, address: &Address) {
        let mut cloud = self.cloud.write().await;
        cloud.objects.remove(address);
        cloud.vanished.insert(address.clone());
    }

    /// Attributes of a live object.
    pub async fn object(&self, address: &Address) -> Option<Attributes> {
        self.cloud.read().await.objects.get(address).cloned()
    }

    fn failed(request: &OperationRequest<'_>, message: impl Into<String>) -> ProviderError {
        ProviderError::OperationFailed {
            address: request.address.clone(),
            action: request.action,
            message: message.into(),
        }
    }
}

#[async_trait]
impl Provider for LocalProvider {
    fn name(&self) -> &str {
        "local"
    }

    fn schema(&self, resource_type: &str) -> Option<ResourceSchema> {
        let schema = self.schemas.get(resource_type).cloned().unwrap_or_else(|| {
            ResourceSchema::new(resource_type).with_attribute("id", AttributeBehavior::Computed)
        });
        Some(schema)
    }

    async fn apply_operation(
        &self,
        request: OperationRequest<'_>,
    ) -> Result<Option<StateEntity>, ProviderError> {
        debug!(address = %request.address, action = %request.action, "LocalProvider: apply_operation");
        let mut cloud = self.cloud.write().await;
        if cloud.failing.contains(request.address) {
            return Err(Self::failed(&request, "injected failure"));
        }

        let id = match request.action {
            ChangeAction::Create => format!("local-{}", Uuid::new_v4().simple()),
            ChangeAction::Update => {
                let prior = request
                    .prior
                    .ok_or_else(|| Self::failed(&request, "update without a recorded object"))?;
                match prior.attribute("id") {
                    Some(Value::String(id)) => id.clone(),
                    _ => format!("local-{}", Uuid::new_v4().simple()),
                }
            }
            ChangeAction::Delete => {
                // A deposed object shares its address with its replacement.
                let prior_id = request.prior.and_then(|p| p.attribute("id"));
                let live_id = cloud.objects.get(request.address).and_then(|a| a.get("id"));
                if prior_id.is_none() || prior_id == live_id {
                    cloud.objects.remove(request.address);
                } else {
                    debug!(address = %request.address, "LocalProvider: deposed object already gone");
                }
                return Ok(None);
            }
            other => {
                return Err(ProviderError::Internal(format!(
                    "'{other}' is not a provider operation"
                )))
            }
        };

        let spec = request
            .spec
            .ok_or_else(|| Self::failed(&request, "missing resource specification"))?;
        let mut attributes = request.attributes.clone();
        attributes.insert("id".into(), Value::String(id.clone()));
        cloud.objects.insert(request.address.clone(), attributes.clone());
        cloud.vanished.remove(request.address);

        let mut entity = StateEntity::new(request.address.clone(), spec.provider_id.clone(), attributes);
        entity.schema_version = self.schema(&spec.resource_type).map_or(0, |s| s.version);
        entity.private = json!({ "object_id": id });
        Ok(Some(entity))
    }

    async fn read(&self, entity: &StateEntity) -> Result<Option<StateEntity>, ProviderError> {
        debug!(address = %entity.address, "LocalProvider: read");
        let cloud = self.cloud.read().await;
        if cloud.vanished.contains(&entity.address) {
            return Ok(None);
        }
        let mut observed = entity.clone();
        if let Some(attrs) = cloud.objects.get(&entity.address) {
            observed.attributes = attrs.clone();
        }
        Ok(Some(observed))
    }
}
