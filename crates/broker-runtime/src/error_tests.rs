//! Tests for error types.

use super::*;

#[test]
fn test_error_transience() {
    assert!(BrokerError::SessionCannotBeLocked {
        session_id: "test".to_string(),
    }
    .is_transient());

    assert!(BrokerError::ServiceTimeout {
        waited: std::time::Duration::from_secs(5),
    }
    .is_transient());

    assert!(!BrokerError::MessageLockLost { sequence_number: 7 }.is_transient());

    assert!(!BrokerError::SessionLockLost {
        session_id: "test".to_string(),
    }
    .is_transient());

    assert!(!BrokerError::Disposed.is_transient());
    assert!(!BrokerError::AlreadyRunning.is_transient());
}

#[test]
fn test_validation_error_conversion() {
    let err: BrokerError = ValidationError::Required {
        field: "session_id".to_string(),
    }
    .into();

    assert!(matches!(err, BrokerError::Validation(_)));
    assert!(!err.is_transient());
}

#[test]
fn test_error_display() {
    let err = BrokerError::MessageLockLost { sequence_number: 3 };
    assert_eq!(
        err.to_string(),
        "Message 3 lock lost: token mismatch or lock expired"
    );

    let err = BrokerError::EntityNotFound {
        name: "orders".to_string(),
    };
    assert_eq!(err.to_string(), "Entity not found: orders");
}
