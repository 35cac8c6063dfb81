use async_trait::async_trait;
use terrace_domain::{Address, Attributes, ChangeAction, ResourceSchema, ResourceSpec};
use terrace_store::StateEntity;

use crate::error::ProviderError;

/// One create, update or delete call against real infrastructure.
#[derive(Debug, Clone, Copy)]
pub struct OperationRequest<'a> {
    /// `Create`, `Update` or `Delete`. Replacements reach the provider as a
    /// separate delete and create.
    pub action: ChangeAction,
    pub address: &'a Address,
    /// Desired configuration; absent for deletes.
    pub spec: Option<&'a ResourceSpec>,
    /// Recorded entity; absent for creates.
    pub prior: Option<&'a StateEntity>,
    /// The spec's attributes with every reference substituted.
    pub attributes: &'a Attributes,
}

#[async_trait]
pub trait Provider: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// Attribute behaviour for `resource_type`, or `None` when this provider
    /// does not manage it.
    fn schema(&self, resource_type: &str) -> Option<ResourceSchema>;

    // ── Mutating ──────────────────────────────────────────────────────────────

    /// Carry out one operation. Returns the entity as it now exists, or `None`
    /// after a delete. Retry policy, if any, lives inside the provider.
    async fn apply_operation(
        &self,
        request: OperationRequest<'_>,
    ) -> Result<Option<StateEntity>, ProviderError>;

    // ── Read-only (refresh) ───────────────────────────────────────────────────

    /// Current real-world view of a recorded entity; `None` when the object no
    /// longer exists.
    async fn read(&self, entity: &StateEntity) -> Result<Option<StateEntity>, ProviderError>;
}
