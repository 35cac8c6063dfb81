use std::collections::HashMap;
use std::sync::Arc;

use terrace_domain::ResourceSchema;

use crate::error::ProviderError;
use crate::provider::Provider;

/// Dispatches provider calls by the `provider_id` carried on every spec and
/// recorded entity.
#[derive(Default, Clone)]
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn Provider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a provider under `id`. Returns `&mut self` for chaining.
    pub fn register(&mut self, id: impl Into<String>, provider: Arc<dyn Provider>) -> &mut Self {
        self.providers.insert(id.into(), provider);
        self
    }

    pub fn get(&self, id: &str) -> Result<Arc<dyn Provider>, ProviderError> {
        self.providers
            .get(id)
            .cloned()
            .ok_or_else(|| ProviderError::NotConfigured(id.to_string()))
    }

    /// Schema of `resource_type` as reported by provider `id`.
    pub fn schema(&self, id: &str, resource_type: &str) -> Result<ResourceSchema, ProviderError> {
        let provider = self.get(id)?;
        provider
            .schema(resource_type)
            .ok_or_else(|| ProviderError::UnsupportedType {
                provider: id.to_string(),
                resource_type: resource_type.to_string(),
            })
    }

    /// Registered provider ids, sorted.
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.providers.keys().cloned().collect();
        ids.sort();
        ids
    }
}
