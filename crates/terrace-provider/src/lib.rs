pub mod error;
pub mod local;
pub mod provider;
pub mod registry;

pub use error::ProviderError;
pub use local::LocalProvider;
pub use provider::{OperationRequest, Provider};
pub use registry::ProviderRegistry;
