use terrace_domain::{Address, ChangeAction};
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    #[error("no provider configured for id '{0}'")]
    NotConfigured(String),

    #[error("provider '{provider}' does not manage resource type '{resource_type}'")]
    UnsupportedType {
        provider: String,
        resource_type: String,
    },

    #[error("{action} of {address} failed: {message}")]
    OperationFailed {
        address: Address,
        action: ChangeAction,
        message: String,
    },

    #[error("reading {address} failed: {message}")]
    ReadFailed { address: Address, message: String },

    #[error("internal provider error: {0}")]
    Internal(String),
}
