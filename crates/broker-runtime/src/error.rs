//! Error types for broker operations.

use thiserror::Error;

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;

/// Comprehensive error type for all broker operations
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("Message {sequence_number} lock lost: token mismatch or lock expired")]
    MessageLockLost { sequence_number: u64 },

    #[error("Session '{session_id}' lock lost: token mismatch or lock expired")]
    SessionLockLost { session_id: String },

    #[error("Session '{session_id}' is locked by another receiver")]
    SessionCannotBeLocked { session_id: String },

    #[error("No session became available within {waited:?}")]
    ServiceTimeout { waited: std::time::Duration },

    #[error("Entity not found: {name}")]
    EntityNotFound { name: String },

    #[error("Entity already exists: {name}")]
    EntityExists { name: String },

    #[error("Namespace not found: {name}")]
    NamespaceNotFound { name: String },

    #[error("Operation not supported: {message}")]
    NotSupported { message: String },

    #[error("Processor is already running")]
    AlreadyRunning,

    #[error("Processor has been closed")]
    Disposed,

    #[error("Operation was cancelled")]
    Cancelled,

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),
}

impl BrokerError {
    /// Check if the error is transient and the operation can be retried
    pub fn is_transient(&self) -> bool {
        match self {
            Self::MessageLockLost { .. } => false,
            Self::SessionLockLost { .. } => false,
            Self::SessionCannotBeLocked { .. } => true,
            Self::ServiceTimeout { .. } => true,
            Self::EntityNotFound { .. } => false,
            Self::EntityExists { .. } => false,
            Self::NamespaceNotFound { .. } => false,
            Self::NotSupported { .. } => false,
            Self::AlreadyRunning => false,
            Self::Disposed => false,
            Self::Cancelled => false,
            Self::Validation(_) => false,
        }
    }
}

/// Validation errors for producer-side input
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Required field missing: {field}")]
    Required { field: String },

    #[error("Invalid format for {field}: {message}")]
    InvalidFormat { field: String, message: String },

    #[error("Value out of range for {field}: {message}")]
    OutOfRange { field: String, message: String },
}
