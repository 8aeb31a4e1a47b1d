//! Per-entity message store and message lock manager.
//!
//! The store holds an entity's messages keyed by their broker-assigned
//! sequence number and governs each message's visibility state:
//!
//! - **Active**: visible to receive calls.
//! - **Locked**: exclusively owned by the holder of the lock token until
//!   `locked_until`. A message whose lock has expired is treated as Active
//!   at every access point; there is no background sweep, so the whole
//!   model is purely a function of the shared clock's "now".
//!
//! Completed messages are deleted, not tombstoned. Abandoned and expired
//! messages keep their original sequence number, so redelivery happens in
//! original position relative to other visible messages.

use crate::clock::SharedClock;
use crate::error::BrokerError;
use crate::message::{
    LockToken, Message, ReceiveMode, ReceivedMessage, SequenceNumber, SessionId,
};
use crate::sessions::{SessionHandle, SessionTable};
use chrono::{DateTime, Duration, Utc};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration as StdDuration;
use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;

#[cfg(test)]
#[path = "store_tests.rs"]
mod tests;

/// Visibility state of a stored message
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum DeliveryState {
    /// Available for delivery
    Active,
    /// Exclusively owned until `locked_until` by whoever holds `token`
    Locked {
        token: LockToken,
        locked_until: DateTime<Utc>,
    },
}

/// A message held by the store, with broker-assigned metadata
#[derive(Debug, Clone)]
pub(crate) struct StoredMessage {
    sequence_number: SequenceNumber,
    message: Message,
    enqueued_at: DateTime<Utc>,
    delivery_count: u32,
    state: DeliveryState,
}

impl StoredMessage {
    /// A message is visible when Active or when its lock has expired.
    fn is_visible(&self, now: DateTime<Utc>) -> bool {
        match &self.state {
            DeliveryState::Active => true,
            DeliveryState::Locked { locked_until, .. } => now >= *locked_until,
        }
    }

    /// The lock is valid when unexpired and the presented token is the one
    /// most recently minted for this message.
    fn lock_is_valid(&self, token: LockToken, now: DateTime<Utc>) -> bool {
        match &self.state {
            DeliveryState::Locked {
                token: current,
                locked_until,
            } => *current == token && now < *locked_until,
            DeliveryState::Active => false,
        }
    }

    /// True while any unexpired lock is held, regardless of token.
    fn is_currently_locked(&self, now: DateTime<Utc>) -> bool {
        matches!(&self.state, DeliveryState::Locked { locked_until, .. } if now < *locked_until)
    }

    fn to_received(&self) -> ReceivedMessage {
        let (lock_token, locked_until) = match &self.state {
            DeliveryState::Locked {
                token,
                locked_until,
            } => (Some(*token), Some(*locked_until)),
            DeliveryState::Active => (None, None),
        };
        ReceivedMessage {
            sequence_number: self.sequence_number,
            body: self.message.body.clone(),
            application_properties: self.message.application_properties.clone(),
            session_id: self.message.session_id.clone(),
            enqueued_at: self.enqueued_at,
            delivery_count: self.delivery_count,
            lock_token,
            locked_until,
        }
    }
}

/// Ordered message store for a single entity.
///
/// Thread-safe: all mutation happens under one `tokio::sync::Mutex`, and a
/// `Notify` wakes suspended receivers when a message becomes visible
/// (producer accept or consumer abandon).
pub struct MessageStore {
    inner: Mutex<BTreeMap<SequenceNumber, StoredMessage>>,
    /// Wakes receivers suspended in `receive` when visibility changes.
    notify: Notify,
    /// Monotonically increasing sequence number allocator.
    next_sequence: AtomicU64,
    lock_duration: Duration,
    clock: SharedClock,
}

impl MessageStore {
    /// Create an empty store with the entity's configured lock duration.
    pub fn new(lock_duration: Duration, clock: SharedClock) -> Self {
        Self {
            inner: Mutex::new(BTreeMap::new()),
            notify: Notify::new(),
            next_sequence: AtomicU64::new(0),
            lock_duration,
            clock,
        }
    }

    /// Accept a message: assign the next sequence number, insert, and wake
    /// suspended receivers. Returns the assigned sequence number.
    pub async fn accept(&self, message: Message) -> SequenceNumber {
        let sequence_number = self.next_sequence.fetch_add(1, Ordering::Relaxed);
        let stored = StoredMessage {
            sequence_number,
            message,
            enqueued_at: self.clock.now(),
            delivery_count: 0,
            state: DeliveryState::Active,
        };

        let mut inner = self.inner.lock().await;
        inner.insert(sequence_number, stored);
        drop(inner);

        self.notify.notify_waiters();
        sequence_number
    }

    /// Receive up to `max_count` visible messages in ascending sequence
    /// order.
    ///
    /// If nothing is visible the call suspends until a message becomes
    /// visible, `max_wait` elapses (empty result, not an error), or `cancel`
    /// fires.
    pub async fn receive(
        &self,
        max_count: usize,
        max_wait: StdDuration,
        mode: ReceiveMode,
        cancel: &CancellationToken,
    ) -> Result<Vec<ReceivedMessage>, BrokerError> {
        self.receive_inner(max_count, max_wait, mode, None, cancel)
            .await
    }

    /// Session-scoped blocking receive, gated by the handle's lock.
    ///
    /// The lock can expire, or be taken over, while this call is suspended
    /// waiting for a message; ownership is therefore re-checked on every
    /// wakeup, before any message is locked, so a stale owner fails with
    /// `SessionLockLost` instead of consuming alongside the new one.
    pub(crate) async fn receive_session(
        &self,
        sessions: &SessionTable,
        handle: &SessionHandle,
        max_count: usize,
        max_wait: StdDuration,
        mode: ReceiveMode,
        cancel: &CancellationToken,
    ) -> Result<Vec<ReceivedMessage>, BrokerError> {
        self.receive_inner(max_count, max_wait, mode, Some((sessions, handle)), cancel)
            .await
    }

    async fn receive_inner(
        &self,
        max_count: usize,
        max_wait: StdDuration,
        mode: ReceiveMode,
        session: Option<(&SessionTable, &SessionHandle)>,
        cancel: &CancellationToken,
    ) -> Result<Vec<ReceivedMessage>, BrokerError> {
        let deadline = tokio::time::Instant::now() + max_wait;
        loop {
            // Arm the wakeup before scanning so a concurrent accept between
            // the scan and the await cannot be missed.
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let session_id = match session {
                Some((table, handle)) => {
                    table.validate(handle).await?;
                    Some(handle.session_id())
                }
                None => None,
            };

            let messages = self.try_receive(max_count, mode, session_id).await;
            if !messages.is_empty() {
                return Ok(messages);
            }

            if tokio::time::Instant::now() >= deadline {
                return Ok(Vec::new());
            }

            tokio::select! {
                _ = cancel.cancelled() => return Err(BrokerError::Cancelled),
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(deadline) => return Ok(Vec::new()),
            }
        }
    }

    /// Non-suspending receive: deliver whatever is visible right now.
    pub async fn try_receive(
        &self,
        max_count: usize,
        mode: ReceiveMode,
        session: Option<&SessionId>,
    ) -> Vec<ReceivedMessage> {
        let now = self.clock.now();
        let mut inner = self.inner.lock().await;

        let visible: Vec<SequenceNumber> = inner
            .values()
            .filter(|m| m.is_visible(now))
            .filter(|m| session.is_none() || m.message.session_id.as_ref() == session)
            .map(|m| m.sequence_number)
            .take(max_count)
            .collect();

        let mut delivered = Vec::with_capacity(visible.len());
        for sequence_number in visible {
            match mode {
                ReceiveMode::PeekLock => {
                    let Some(stored) = inner.get_mut(&sequence_number) else {
                        continue;
                    };
                    stored.delivery_count += 1;
                    stored.state = DeliveryState::Locked {
                        token: LockToken::mint(),
                        locked_until: now + self.lock_duration,
                    };
                    delivered.push(stored.to_received());
                }
                ReceiveMode::ReceiveAndDelete => {
                    let Some(mut stored) = inner.remove(&sequence_number) else {
                        continue;
                    };
                    stored.delivery_count += 1;
                    stored.state = DeliveryState::Active;
                    delivered.push(stored.to_received());
                }
            }
        }
        delivered
    }

    /// Complete (delete) a locked message. Fails with `MessageLockLost`
    /// unless the lock is unexpired and the token is the latest mint.
    pub async fn complete(
        &self,
        sequence_number: SequenceNumber,
        token: LockToken,
    ) -> Result<(), BrokerError> {
        let now = self.clock.now();
        let mut inner = self.inner.lock().await;

        let valid = inner
            .get(&sequence_number)
            .is_some_and(|m| m.lock_is_valid(token, now));
        if !valid {
            return Err(BrokerError::MessageLockLost { sequence_number });
        }

        inner.remove(&sequence_number);
        tracing::debug!(sequence_number, "message completed");
        Ok(())
    }

    /// Abandon a locked message: revert it to Active in place so it is
    /// immediately receivable again with an unchanged sequence number.
    ///
    /// The presented token is deliberately not compared (mirroring the
    /// production service's looseness), but the message must still be
    /// currently locked and unexpired.
    pub async fn abandon(
        &self,
        sequence_number: SequenceNumber,
        _token: LockToken,
    ) -> Result<(), BrokerError> {
        let now = self.clock.now();
        let mut inner = self.inner.lock().await;

        let stored = inner
            .get_mut(&sequence_number)
            .filter(|m| m.is_currently_locked(now))
            .ok_or(BrokerError::MessageLockLost { sequence_number })?;

        stored.state = DeliveryState::Active;
        drop(inner);

        self.notify.notify_waiters();
        tracing::debug!(sequence_number, "message abandoned, available again");
        Ok(())
    }

    /// Extend a valid lock to `now + lock_duration`.
    pub async fn renew(
        &self,
        sequence_number: SequenceNumber,
        token: LockToken,
    ) -> Result<(), BrokerError> {
        let now = self.clock.now();
        let mut inner = self.inner.lock().await;

        let stored = inner
            .get_mut(&sequence_number)
            .filter(|m| m.lock_is_valid(token, now))
            .ok_or(BrokerError::MessageLockLost { sequence_number })?;

        stored.state = DeliveryState::Locked {
            token,
            locked_until: now + self.lock_duration,
        };
        Ok(())
    }

    /// Number of currently visible (unlocked or lock-expired) messages.
    pub async fn active_count(&self) -> u64 {
        let now = self.clock.now();
        let inner = self.inner.lock().await;
        inner.values().filter(|m| m.is_visible(now)).count() as u64
    }

    /// Active plus currently locked messages. Completed messages are gone
    /// from the store and never counted.
    pub async fn total_count(&self) -> u64 {
        let inner = self.inner.lock().await;
        inner.len() as u64
    }

    /// Session ids that currently have at least one visible message, in
    /// sorted order. Used by the session lock manager's acceptance scan.
    pub(crate) async fn visible_session_ids(&self) -> BTreeSet<SessionId> {
        let now = self.clock.now();
        let inner = self.inner.lock().await;
        inner
            .values()
            .filter(|m| m.is_visible(now))
            .filter_map(|m| m.message.session_id.clone())
            .collect()
    }
}
