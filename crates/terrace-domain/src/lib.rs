pub mod action;
pub mod error;
pub mod schema;
pub mod types;


pub use action::ChangeAction;
pub use error::DomainError;
pub use schema::{AttributeBehavior, ResourceSchema};
pub use types::{Address, Attributes, Reference, ResourceSpec, Value};
