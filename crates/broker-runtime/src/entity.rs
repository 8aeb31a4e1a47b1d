//! Queue and topic/subscription entity engines.
//!
//! A [`QueueEntity`] composes the sequence-allocating message store, an
//! optional session lock table, and the operation hooks behind the
//! receive/complete/abandon/renew contract. Whether an entity is
//! session-partitioned is decided once, at construction, from
//! [`EntityOptions::session_enabled`]; the sessionless and session surfaces
//! reject each other with `NotSupported`.
//!
//! A [`Topic`] owns named subscriptions, each a full `QueueEntity`; an
//! accepted message fans out to every subscription.

use crate::clock::SharedClock;
use crate::error::{BrokerError, ValidationError};
use crate::hooks::{OperationHooks, OperationInfo, OperationKind};
use crate::message::{
    LockToken, Message, ReceiveMode, ReceivedMessage, SequenceNumber, SessionId,
};
use crate::sessions::{SessionHandle, SessionTable};
use crate::store::MessageStore;
use bytes::Bytes;
use chrono::Duration;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration as StdDuration;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

#[cfg(test)]
#[path = "entity_tests.rs"]
mod tests;

/// Per-entity configuration fixed at topology-setup time
#[derive(Debug, Clone)]
pub struct EntityOptions {
    /// How long a message or session lock stays valid without renewal.
    pub lock_duration: Duration,
    /// Whether the entity partitions its messages into sessions.
    pub session_enabled: bool,
}

impl Default for EntityOptions {
    fn default() -> Self {
        Self {
            lock_duration: Duration::seconds(60),
            session_enabled: false,
        }
    }
}

impl EntityOptions {
    /// Options for a session-enabled entity with the default lock duration.
    pub fn with_sessions() -> Self {
        Self {
            session_enabled: true,
            ..Self::default()
        }
    }

    /// Override the lock duration.
    pub fn with_lock_duration(mut self, duration: Duration) -> Self {
        self.lock_duration = duration;
        self
    }
}

/// A queue or topic-subscription: the unit of message storage.
///
/// # Example
///
/// ```rust
/// use broker_runtime::clock::SystemClock;
/// use broker_runtime::entity::{EntityOptions, QueueEntity};
/// use broker_runtime::hooks::NoopHooks;
/// use broker_runtime::message::{Message, ReceiveMode};
/// use bytes::Bytes;
/// use std::sync::Arc;
/// use std::time::Duration;
/// use tokio_util::sync::CancellationToken;
///
/// # tokio_test::block_on(async {
/// let entity = QueueEntity::new(
///     "orders".to_string(),
///     EntityOptions::default(),
///     SystemClock::shared(),
///     Arc::new(NoopHooks),
/// );
///
/// entity
///     .accept(Message::new(Bytes::from_static(b"hello")))
///     .await
///     .unwrap();
///
/// let cancel = CancellationToken::new();
/// let messages = entity
///     .receive(1, Duration::from_secs(1), ReceiveMode::PeekLock, &cancel)
///     .await
///     .unwrap();
/// assert_eq!(messages.len(), 1);
/// # });
/// ```
pub struct QueueEntity {
    name: String,
    store: MessageStore,
    sessions: Option<SessionTable>,
    hooks: Arc<dyn OperationHooks>,
    clock: SharedClock,
}

impl QueueEntity {
    /// Create an entity. Called once at topology-setup time.
    pub fn new(
        name: String,
        options: EntityOptions,
        clock: SharedClock,
        hooks: Arc<dyn OperationHooks>,
    ) -> Self {
        let sessions = options
            .session_enabled
            .then(|| SessionTable::new(options.lock_duration, clock.clone()));
        Self {
            name,
            store: MessageStore::new(options.lock_duration, clock.clone()),
            sessions,
            hooks,
            clock,
        }
    }

    /// Entity name, as registered in its namespace.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether this entity requires session locks for consumption.
    pub fn is_session_enabled(&self) -> bool {
        self.sessions.is_some()
    }

    /// The clock every expiry decision for this entity reads from.
    pub fn clock(&self) -> &SharedClock {
        &self.clock
    }

    /// Run `operation` between the before/after hooks. Both hooks are called
    /// unconditionally; a hook failure propagates like a normal failure, with
    /// an operation failure taking precedence over an `after` failure.
    async fn hooked<T, F>(&self, kind: OperationKind, operation: F) -> Result<T, BrokerError>
    where
        F: std::future::Future<Output = Result<T, BrokerError>>,
    {
        let info = OperationInfo::new(&self.name, kind);
        self.hooks.before(&info).await?;
        let result = operation.await;
        let after = self.hooks.after(&info).await;
        match result {
            Err(e) => Err(e),
            Ok(value) => {
                after?;
                Ok(value)
            }
        }
    }

    fn sessions(&self) -> Result<&SessionTable, BrokerError> {
        self.sessions.as_ref().ok_or_else(|| BrokerError::NotSupported {
            message: format!("entity '{}' is not session-enabled", self.name),
        })
    }

    fn require_sessionless(&self) -> Result<(), BrokerError> {
        if self.sessions.is_some() {
            return Err(BrokerError::NotSupported {
                message: format!(
                    "entity '{}' is session-enabled; accept a session first",
                    self.name
                ),
            });
        }
        Ok(())
    }

    // ========================================================================
    // Producer surface
    // ========================================================================

    /// Accept a message: validate, assign the next sequence number, store,
    /// and wake suspended receivers.
    pub async fn accept(&self, message: Message) -> Result<SequenceNumber, BrokerError> {
        self.hooked(OperationKind::Accept, async {
            if self.sessions.is_some() && message.session_id.is_none() {
                return Err(ValidationError::Required {
                    field: "session_id".to_string(),
                }
                .into());
            }

            if let (Some(table), Some(session_id)) = (&self.sessions, &message.session_id) {
                table.ensure_session(session_id).await;
            }

            let sequence_number = self.store.accept(message).await;
            if let Some(table) = &self.sessions {
                table.wake();
            }
            tracing::debug!(entity = %self.name, sequence_number, "message accepted");
            Ok(sequence_number)
        })
        .await
    }

    // ========================================================================
    // Sessionless consumer surface
    // ========================================================================

    /// Receive up to `max_count` messages, waiting up to `max_wait` for the
    /// first one. An empty result is a timeout, not an error.
    pub async fn receive(
        &self,
        max_count: usize,
        max_wait: StdDuration,
        mode: ReceiveMode,
        cancel: &CancellationToken,
    ) -> Result<Vec<ReceivedMessage>, BrokerError> {
        self.hooked(OperationKind::Receive, async {
            self.require_sessionless()?;
            self.store.receive(max_count, max_wait, mode, cancel).await
        })
        .await
    }

    /// Delete a locked message, proving ownership with its token.
    pub async fn complete(
        &self,
        sequence_number: SequenceNumber,
        token: LockToken,
    ) -> Result<(), BrokerError> {
        self.hooked(OperationKind::Complete, async {
            self.require_sessionless()?;
            self.store.complete(sequence_number, token).await
        })
        .await
    }

    /// Return a locked message to the available state, in place.
    pub async fn abandon(
        &self,
        sequence_number: SequenceNumber,
        token: LockToken,
    ) -> Result<(), BrokerError> {
        self.hooked(OperationKind::Abandon, async {
            self.require_sessionless()?;
            self.store.abandon(sequence_number, token).await
        })
        .await
    }

    /// Extend a message lock to `now + lock_duration`.
    pub async fn renew_message(
        &self,
        sequence_number: SequenceNumber,
        token: LockToken,
    ) -> Result<(), BrokerError> {
        self.hooked(OperationKind::RenewMessageLock, async {
            self.require_sessionless()?;
            self.store.renew(sequence_number, token).await
        })
        .await
    }

    // ========================================================================
    // Session consumer surface
    // ========================================================================

    /// Lock the next session that has a visible message, waiting up to
    /// `max_wait`. Failing to find one is `ServiceTimeout`.
    pub async fn accept_next_session(
        &self,
        max_wait: StdDuration,
        cancel: &CancellationToken,
    ) -> Result<SessionHandle, BrokerError> {
        self.hooked(OperationKind::AcceptSession, async {
            self.sessions()?
                .accept_next(&self.store, max_wait, cancel)
                .await
        })
        .await
    }

    /// Lock one specific session, failing immediately with
    /// `SessionCannotBeLocked` if it is validly held.
    pub async fn accept_session(
        &self,
        session_id: &SessionId,
        cancel: &CancellationToken,
    ) -> Result<SessionHandle, BrokerError> {
        self.hooked(OperationKind::AcceptSession, async {
            if cancel.is_cancelled() {
                return Err(BrokerError::Cancelled);
            }
            self.sessions()?.accept_specific(session_id).await
        })
        .await
    }

    /// Extend the session lock held by `handle`.
    pub async fn renew_session(&self, handle: &SessionHandle) -> Result<(), BrokerError> {
        self.hooked(OperationKind::RenewSessionLock, async {
            self.sessions()?.renew(handle).await
        })
        .await
    }

    /// Release the session lock early, making the session immediately
    /// acceptable again.
    pub async fn release_session(&self, handle: &SessionHandle) -> Result<(), BrokerError> {
        self.hooked(OperationKind::ReleaseSession, async {
            self.sessions()?.release(handle).await;
            Ok(())
        })
        .await
    }

    /// Read the opaque session state blob.
    pub async fn get_session_state(
        &self,
        handle: &SessionHandle,
    ) -> Result<Option<Bytes>, BrokerError> {
        self.hooked(OperationKind::GetSessionState, async {
            self.sessions()?.get_state(handle).await
        })
        .await
    }

    /// Replace the opaque session state blob.
    pub async fn set_session_state(
        &self,
        handle: &SessionHandle,
        state: Bytes,
    ) -> Result<(), BrokerError> {
        self.hooked(OperationKind::SetSessionState, async {
            self.sessions()?.set_state(handle, state).await
        })
        .await
    }

    /// Receive messages belonging to the locked session. Gated by the
    /// handle's lock validity in addition to message visibility; the lock is
    /// re-checked whenever the call wakes from waiting, so losing it mid-wait
    /// fails with `SessionLockLost` rather than delivering to a stale owner.
    pub async fn receive_session(
        &self,
        handle: &SessionHandle,
        max_count: usize,
        max_wait: StdDuration,
        mode: ReceiveMode,
        cancel: &CancellationToken,
    ) -> Result<Vec<ReceivedMessage>, BrokerError> {
        self.hooked(OperationKind::Receive, async {
            let sessions = self.sessions()?;
            self.store
                .receive_session(sessions, handle, max_count, max_wait, mode, cancel)
                .await
        })
        .await
    }

    /// Complete a message of the locked session.
    pub async fn complete_session_message(
        &self,
        handle: &SessionHandle,
        sequence_number: SequenceNumber,
        token: LockToken,
    ) -> Result<(), BrokerError> {
        self.hooked(OperationKind::Complete, async {
            self.sessions()?.validate(handle).await?;
            self.store.complete(sequence_number, token).await
        })
        .await
    }

    /// Abandon a message of the locked session.
    pub async fn abandon_session_message(
        &self,
        handle: &SessionHandle,
        sequence_number: SequenceNumber,
        token: LockToken,
    ) -> Result<(), BrokerError> {
        self.hooked(OperationKind::Abandon, async {
            self.sessions()?.validate(handle).await?;
            let result = self.store.abandon(sequence_number, token).await;
            if result.is_ok() {
                // The abandoned message may make this session acceptable to
                // another consumer once the lock is released.
                self.sessions()?.wake();
            }
            result
        })
        .await
    }

    /// Renew a message lock within the locked session.
    pub async fn renew_session_message(
        &self,
        handle: &SessionHandle,
        sequence_number: SequenceNumber,
        token: LockToken,
    ) -> Result<(), BrokerError> {
        self.hooked(OperationKind::RenewMessageLock, async {
            self.sessions()?.validate(handle).await?;
            self.store.renew(sequence_number, token).await
        })
        .await
    }

    // ========================================================================
    // Counts
    // ========================================================================

    /// Number of currently active (unlocked, unexpired) messages.
    pub async fn active_count(&self) -> u64 {
        self.store.active_count().await
    }

    /// Active plus currently locked messages; completed messages are not
    /// counted.
    pub async fn total_count(&self) -> u64 {
        self.store.total_count().await
    }
}

/// A topic: a named fan-out point owning subscription entities.
pub struct Topic {
    name: String,
    subscriptions: RwLock<HashMap<String, Arc<QueueEntity>>>,
    clock: SharedClock,
    hooks: Arc<dyn OperationHooks>,
}

impl Topic {
    pub(crate) fn new(name: String, clock: SharedClock, hooks: Arc<dyn OperationHooks>) -> Self {
        Self {
            name,
            subscriptions: RwLock::new(HashMap::new()),
            clock,
            hooks,
        }
    }

    /// Topic name, as registered in its namespace.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Add a subscription. Each subscription is a full entity with its own
    /// store and lock state.
    pub async fn create_subscription(
        &self,
        name: &str,
        options: EntityOptions,
    ) -> Result<Arc<QueueEntity>, BrokerError> {
        let mut subscriptions = self.subscriptions.write().await;
        if subscriptions.contains_key(name) {
            return Err(BrokerError::EntityExists {
                name: format!("{}/{}", self.name, name),
            });
        }

        let entity = Arc::new(QueueEntity::new(
            format!("{}/{}", self.name, name),
            options,
            self.clock.clone(),
            self.hooks.clone(),
        ));
        subscriptions.insert(name.to_string(), entity.clone());
        Ok(entity)
    }

    /// Look up a subscription by name.
    pub async fn get_subscription(&self, name: &str) -> Result<Arc<QueueEntity>, BrokerError> {
        let subscriptions = self.subscriptions.read().await;
        subscriptions
            .get(name)
            .cloned()
            .ok_or_else(|| BrokerError::EntityNotFound {
                name: format!("{}/{}", self.name, name),
            })
    }

    /// Accept a message into the topic: fan out to every subscription.
    ///
    /// Fan-out is not atomic. Each subscription accepts independently, so a
    /// failure (a hook fault, a validation error on one subscription's
    /// options) stops the fan-out there: subscriptions already visited keep
    /// the message, the failing one and any not yet visited never see it.
    pub async fn accept(&self, message: Message) -> Result<(), BrokerError> {
        let subscriptions: Vec<Arc<QueueEntity>> = {
            let guard = self.subscriptions.read().await;
            guard.values().cloned().collect()
        };

        for subscription in subscriptions {
            subscription.accept(message.clone()).await?;
        }
        Ok(())
    }
}
