//! Before/after extension points invoked around every broker operation.
//!
//! The engine calls [`OperationHooks::before`] and [`OperationHooks::after`]
//! unconditionally around each data-plane operation. A hook may short-circuit
//! the operation by returning an error, which propagates to the caller
//! exactly like a normal failure. Fault-injection frameworks plug in here.

use crate::error::BrokerError;
use async_trait::async_trait;

/// Which broker operation is being intercepted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    Accept,
    Receive,
    Complete,
    Abandon,
    RenewMessageLock,
    AcceptSession,
    RenewSessionLock,
    ReleaseSession,
    GetSessionState,
    SetSessionState,
}

/// Context handed to hooks: which entity, which operation
#[derive(Debug, Clone)]
pub struct OperationInfo {
    pub entity: String,
    pub kind: OperationKind,
}

impl OperationInfo {
    pub fn new(entity: &str, kind: OperationKind) -> Self {
        Self {
            entity: entity.to_string(),
            kind,
        }
    }
}

/// Extension points called around every broker operation.
///
/// Both methods default to no-ops, so implementors override only the side
/// they care about.
#[async_trait]
pub trait OperationHooks: Send + Sync {
    /// Called before the operation mutates any state. Returning an error
    /// aborts the operation.
    async fn before(&self, _op: &OperationInfo) -> Result<(), BrokerError> {
        Ok(())
    }

    /// Called after the operation, whether it succeeded or failed. An error
    /// returned here surfaces to the caller of a successful operation.
    async fn after(&self, _op: &OperationInfo) -> Result<(), BrokerError> {
        Ok(())
    }
}

/// Default hook implementation that intercepts nothing
#[derive(Debug, Default)]
pub struct NoopHooks;

#[async_trait]
impl OperationHooks for NoopHooks {}
