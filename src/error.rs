use std::fmt;

/// Crate-wide error type for the saga engine.
#[derive(Debug, Clone, PartialEq)]
pub enum SagaError {
    DatabaseError(String),
    SerializationError(String),
    DefinitionError(String),
    MessagingError(String),
    ExecutionError(String),
    ConfigurationError(String),
}

impl fmt::Display for SagaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SagaError::DatabaseError(msg) => write!(f, "Database error: {msg}"),
            SagaError::SerializationError(msg) => write!(f, "Serialization error: {msg}"),
            SagaError::DefinitionError(msg) => write!(f, "Definition error: {msg}"),
            SagaError::MessagingError(msg) => write!(f, "Messaging error: {msg}"),
            SagaError::ExecutionError(msg) => write!(f, "Execution error: {msg}"),
            SagaError::ConfigurationError(msg) => write!(f, "Configuration error: {msg}"),
        }
    }
}

impl std::error::Error for SagaError {}

impl From<sqlx::Error> for SagaError {
    fn from(error: sqlx::Error) -> Self {
        SagaError::DatabaseError(error.to_string())
    }
}

impl From<serde_json::Error> for SagaError {
    fn from(error: serde_json::Error) -> Self {
        SagaError::SerializationError(error.to_string())
    }
}

pub type Result<T> = std::result::Result<T, SagaError>;
