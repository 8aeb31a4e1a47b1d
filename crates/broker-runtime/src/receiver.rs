//! Receiver abstraction over queue and session consumption.
//!
//! The processors drive consumption through the [`Receiver`] trait so the
//! same pump loop works for a plain queue receiver and for a locked-session
//! receiver. Settlement calls take the [`ReceivedMessage`] they operate on
//! and resolve the lock token internally.

use crate::entity::QueueEntity;
use crate::error::BrokerError;
use crate::message::{LockToken, ReceiveMode, ReceivedMessage};
use crate::sessions::SessionHandle;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration as StdDuration;
use tokio_util::sync::CancellationToken;

/// Uniform consumption surface over queue-style entities.
#[async_trait]
pub trait Receiver: Send + Sync {
    /// Name of the entity this receiver consumes from.
    fn entity_name(&self) -> &str;

    /// Receive up to `max_count` messages, waiting up to `max_wait` for the
    /// first one. An empty result means the wait elapsed.
    async fn receive(
        &self,
        max_count: usize,
        max_wait: StdDuration,
        cancel: &CancellationToken,
    ) -> Result<Vec<ReceivedMessage>, BrokerError>;

    /// Settle a message as successfully processed.
    async fn complete(&self, message: &ReceivedMessage) -> Result<(), BrokerError>;

    /// Return a message to the entity for redelivery.
    async fn abandon(&self, message: &ReceivedMessage) -> Result<(), BrokerError>;

    /// Extend the message lock from now.
    async fn renew(&self, message: &ReceivedMessage) -> Result<(), BrokerError>;

    /// Release any long-lived state held by the receiver. The default is a
    /// no-op; session receivers release their session lock here.
    async fn dispose(&self) -> Result<(), BrokerError> {
        Ok(())
    }
}

fn require_token(message: &ReceivedMessage) -> Result<LockToken, BrokerError> {
    message.lock_token.ok_or(BrokerError::MessageLockLost {
        sequence_number: message.sequence_number,
    })
}

/// Receiver bound to a sessionless queue entity.
pub struct QueueReceiver {
    entity: Arc<QueueEntity>,
    mode: ReceiveMode,
}

impl QueueReceiver {
    pub fn new(entity: Arc<QueueEntity>, mode: ReceiveMode) -> Self {
        Self { entity, mode }
    }
}

#[async_trait]
impl Receiver for QueueReceiver {
    fn entity_name(&self) -> &str {
        self.entity.name()
    }

    async fn receive(
        &self,
        max_count: usize,
        max_wait: StdDuration,
        cancel: &CancellationToken,
    ) -> Result<Vec<ReceivedMessage>, BrokerError> {
        self.entity
            .receive(max_count, max_wait, self.mode, cancel)
            .await
    }

    async fn complete(&self, message: &ReceivedMessage) -> Result<(), BrokerError> {
        // Nothing to settle in ReceiveAndDelete mode.
        if self.mode == ReceiveMode::ReceiveAndDelete {
            return Ok(());
        }
        let token = require_token(message)?;
        self.entity.complete(message.sequence_number, token).await
    }

    async fn abandon(&self, message: &ReceivedMessage) -> Result<(), BrokerError> {
        if self.mode == ReceiveMode::ReceiveAndDelete {
            return Ok(());
        }
        let token = require_token(message)?;
        self.entity.abandon(message.sequence_number, token).await
    }

    async fn renew(&self, message: &ReceivedMessage) -> Result<(), BrokerError> {
        let token = require_token(message)?;
        self.entity
            .renew_message(message.sequence_number, token)
            .await
    }
}

/// Receiver bound to one locked session of a session-enabled entity.
///
/// Holds the [`SessionHandle`] proving ownership; every call re-validates it
/// so a lost session lock surfaces as [`BrokerError::SessionLockLost`].
pub struct SessionReceiver {
    entity: Arc<QueueEntity>,
    handle: SessionHandle,
    mode: ReceiveMode,
}

impl SessionReceiver {
    pub fn new(entity: Arc<QueueEntity>, handle: SessionHandle, mode: ReceiveMode) -> Self {
        Self {
            entity,
            handle,
            mode,
        }
    }

    /// Identifier of the locked session.
    pub fn session_id(&self) -> &crate::message::SessionId {
        self.handle.session_id()
    }

    /// Handle for the held session lock.
    pub fn handle(&self) -> &SessionHandle {
        &self.handle
    }

    /// Extend the session lock from now.
    pub async fn renew_session(&self) -> Result<(), BrokerError> {
        self.entity.renew_session(&self.handle).await
    }

    /// Read the session state blob.
    pub async fn get_session_state(&self) -> Result<Option<bytes::Bytes>, BrokerError> {
        self.entity.get_session_state(&self.handle).await
    }

    /// Replace the session state blob.
    pub async fn set_session_state(&self, state: bytes::Bytes) -> Result<(), BrokerError> {
        self.entity.set_session_state(&self.handle, state).await
    }
}

#[async_trait]
impl Receiver for SessionReceiver {
    fn entity_name(&self) -> &str {
        self.entity.name()
    }

    async fn receive(
        &self,
        max_count: usize,
        max_wait: StdDuration,
        cancel: &CancellationToken,
    ) -> Result<Vec<ReceivedMessage>, BrokerError> {
        self.entity
            .receive_session(&self.handle, max_count, max_wait, self.mode, cancel)
            .await
    }

    async fn complete(&self, message: &ReceivedMessage) -> Result<(), BrokerError> {
        if self.mode == ReceiveMode::ReceiveAndDelete {
            return Ok(());
        }
        let token = require_token(message)?;
        self.entity
            .complete_session_message(&self.handle, message.sequence_number, token)
            .await
    }

    async fn abandon(&self, message: &ReceivedMessage) -> Result<(), BrokerError> {
        if self.mode == ReceiveMode::ReceiveAndDelete {
            return Ok(());
        }
        let token = require_token(message)?;
        self.entity
            .abandon_session_message(&self.handle, message.sequence_number, token)
            .await
    }

    async fn renew(&self, message: &ReceivedMessage) -> Result<(), BrokerError> {
        let token = require_token(message)?;
        self.entity
            .renew_session_message(&self.handle, message.sequence_number, token)
            .await
    }

    async fn dispose(&self) -> Result<(), BrokerError> {
        self.entity.release_session(&self.handle).await
    }
}
