//! Error handling for AlarmSrv

use thiserror::Error;
use voltage_alarm_store::{Handle, StoreError};

/// Result type alias
pub type Result<T> = std::result::Result<T, AlarmError>;

#[derive(Error, Debug)]
pub enum AlarmError {
    /// Missing or malformed parameter
    #[error("Invalid input: {0}")]
    Validation(String),

    /// Unknown record, class or watch
    #[error("Not found: {0}")]
    NotFound(String),

    /// The store failed to complete a mutation or query
    #[error("Storage error: {0}")]
    Storage(StoreError),

    /// Alarm raised before startup reconciliation finished
    #[error("Service not steady: {0}")]
    NotSteady(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Invalid handle: {0}")]
    InvalidHandle(Handle),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<StoreError> for AlarmError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(uuid) => AlarmError::NotFound(format!("alarm record {}", uuid)),
            StoreError::InvalidInput(msg) => AlarmError::Validation(msg),
            other => AlarmError::Storage(other),
        }
    }
}

impl From<figment::Error> for AlarmError {
    fn from(err: figment::Error) -> Self {
        AlarmError::Config(err.to_string())
    }
}

/// Helper function to create a validation error
pub fn invalid_input(msg: impl Into<String>) -> AlarmError {
    AlarmError::Validation(msg.into())
}

/// Helper function to create a not found error
pub fn not_found(what: impl Into<String>) -> AlarmError {
    AlarmError::NotFound(what.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_store_not_found_maps_to_not_found() {
        let err: AlarmError = StoreError::NotFound(Uuid::nil()).into();
        assert!(matches!(err, AlarmError::NotFound(_)));
        assert!(err.to_string().contains("00000000-0000-0000-0000-000000000000"));
    }

    #[test]
    fn test_store_failure_maps_to_storage() {
        let err: AlarmError = StoreError::Database("disk I/O error".to_string()).into();
        assert!(matches!(err, AlarmError::Storage(_)));
    }

    #[test]
    fn test_helper_functions() {
        assert!(matches!(invalid_input("bad"), AlarmError::Validation(_)));
        assert!(matches!(not_found("class 3"), AlarmError::NotFound(_)));
        assert_eq!(
            AlarmError::InvalidHandle(Handle(9)).to_string(),
            "Invalid handle: 9"
        );
    }
}
