use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DomainError {
    #[error("invalid resource address '{0}': expected <type>.<name>")]
    InvalidAddress(String),

    #[error("invalid reference '{0}': expected <type>.<name>.<attribute>")]
    InvalidReference(String),

    #[error("invalid identifier '{value}' for {kind}: only ASCII letters, digits, '-' and '_' are allowed")]
    InvalidIdentifier { kind: &'static str, value: String },
}
