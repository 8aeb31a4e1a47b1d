//! Session lock management for exclusive, ordered session consumption.
//!
//! A session is a named partition of an entity. Its message set is just the
//! subset of the entity's store filtered by session id; the table here only
//! tracks lock ownership and the opaque per-session state blob. A session
//! must be locked before any of its messages can be received, and at most
//! one valid lock exists per session at any instant.
//!
//! Sessions are created lazily: on the first accepted message carrying a new
//! session id, or on the first explicit accept by a consumer. They live for
//! the lifetime of the entity.
//!
//! Lock expiry is lazy, like message locks: an expired session lock is
//! simply treated as unlocked at the next access. The acceptance scan visits
//! candidate sessions in sorted-id order, which is arbitrary with respect to
//! creation order but deterministic per run.

use crate::clock::SharedClock;
use crate::error::BrokerError;
use crate::message::{LockToken, SessionId};
use crate::store::MessageStore;
use bytes::Bytes;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::time::Duration as StdDuration;
use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;

#[cfg(test)]
#[path = "sessions_tests.rs"]
mod tests;

/// Proof of session ownership handed to the consumer that locked it.
///
/// Operations gated by the session lock present the handle; validity is
/// checked against the table, not the handle, so an expired or superseded
/// handle fails with `SessionLockLost`.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    session_id: SessionId,
    token: LockToken,
    locked_until: DateTime<Utc>,
}

impl SessionHandle {
    /// The session this handle locks.
    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    /// The lock token minted for this acquisition.
    pub fn lock_token(&self) -> LockToken {
        self.token
    }

    /// Lock expiry as of acquisition. Renewals move the table's expiry, not
    /// the handle's copy.
    pub fn locked_until(&self) -> DateTime<Utc> {
        self.locked_until
    }
}

/// Lock and state tracking for one session
#[derive(Debug, Default)]
struct SessionSlot {
    token: Option<LockToken>,
    locked_until: Option<DateTime<Utc>>,
    state_blob: Option<Bytes>,
}

impl SessionSlot {
    fn is_locked(&self, now: DateTime<Utc>) -> bool {
        self.locked_until.is_some_and(|until| now < until)
    }

    fn holds_valid_lock(&self, token: LockToken, now: DateTime<Utc>) -> bool {
        self.token == Some(token) && self.is_locked(now)
    }
}

/// Session lock table for one session-enabled entity.
pub(crate) struct SessionTable {
    slots: Mutex<HashMap<SessionId, SessionSlot>>,
    /// Wakes `accept_next` waiters when a session may have become ready
    /// (new message accepted, session released, message abandoned).
    notify: Notify,
    lock_duration: Duration,
    clock: SharedClock,
}

impl SessionTable {
    pub(crate) fn new(lock_duration: Duration, clock: SharedClock) -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            notify: Notify::new(),
            lock_duration,
            clock,
        }
    }

    /// Create the session lazily when a producer first uses its id.
    pub(crate) async fn ensure_session(&self, session_id: &SessionId) {
        let mut slots = self.slots.lock().await;
        slots.entry(session_id.clone()).or_default();
    }

    /// Wake `accept_next` waiters to re-scan for ready sessions.
    pub(crate) fn wake(&self) {
        self.notify.notify_waiters();
    }

    /// Lock the first unlocked session that has at least one visible
    /// message, scanning in sorted-id order. Suspends up to `max_wait` when
    /// none qualifies, then fails with `ServiceTimeout`.
    pub(crate) async fn accept_next(
        &self,
        store: &MessageStore,
        max_wait: StdDuration,
        cancel: &CancellationToken,
    ) -> Result<SessionHandle, BrokerError> {
        let deadline = tokio::time::Instant::now() + max_wait;
        loop {
            // Arm the wakeup before scanning so an accept/release between
            // the scan and the await cannot be missed.
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(handle) = self.try_accept_next(store).await {
                return Ok(handle);
            }

            if tokio::time::Instant::now() >= deadline {
                return Err(BrokerError::ServiceTimeout { waited: max_wait });
            }

            tokio::select! {
                _ = cancel.cancelled() => return Err(BrokerError::Cancelled),
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(deadline) => {
                    return Err(BrokerError::ServiceTimeout { waited: max_wait });
                }
            }
        }
    }

    async fn try_accept_next(&self, store: &MessageStore) -> Option<SessionHandle> {
        let candidates = store.visible_session_ids().await;
        if candidates.is_empty() {
            return None;
        }

        let now = self.clock.now();
        let mut slots = self.slots.lock().await;
        for session_id in candidates {
            let slot = slots.entry(session_id.clone()).or_default();
            if slot.is_locked(now) {
                continue;
            }
            return Some(Self::grant(slot, session_id, now, self.lock_duration));
        }
        None
    }

    /// Lock one specific session. Fails immediately with
    /// `SessionCannotBeLocked` if anyone holds a valid lock on it; the
    /// session is created lazily otherwise.
    pub(crate) async fn accept_specific(
        &self,
        session_id: &SessionId,
    ) -> Result<SessionHandle, BrokerError> {
        let now = self.clock.now();
        let mut slots = self.slots.lock().await;
        let slot = slots.entry(session_id.clone()).or_default();

        if slot.is_locked(now) {
            return Err(BrokerError::SessionCannotBeLocked {
                session_id: session_id.to_string(),
            });
        }

        Ok(Self::grant(slot, session_id.clone(), now, self.lock_duration))
    }

    fn grant(
        slot: &mut SessionSlot,
        session_id: SessionId,
        now: DateTime<Utc>,
        lock_duration: Duration,
    ) -> SessionHandle {
        let token = LockToken::mint();
        let locked_until = now + lock_duration;
        slot.token = Some(token);
        slot.locked_until = Some(locked_until);
        tracing::debug!(session_id = %session_id, %token, "session locked");
        SessionHandle {
            session_id,
            token,
            locked_until,
        }
    }

    /// Check that the handle still holds the valid lock on its session.
    pub(crate) async fn validate(&self, handle: &SessionHandle) -> Result<(), BrokerError> {
        let now = self.clock.now();
        let slots = self.slots.lock().await;
        let valid = slots
            .get(&handle.session_id)
            .is_some_and(|slot| slot.holds_valid_lock(handle.token, now));
        if valid {
            Ok(())
        } else {
            Err(BrokerError::SessionLockLost {
                session_id: handle.session_id.to_string(),
            })
        }
    }

    /// Extend a valid session lock to `now + lock_duration`.
    pub(crate) async fn renew(&self, handle: &SessionHandle) -> Result<(), BrokerError> {
        let now = self.clock.now();
        let mut slots = self.slots.lock().await;

        let slot = slots
            .get_mut(&handle.session_id)
            .filter(|slot| slot.holds_valid_lock(handle.token, now))
            .ok_or_else(|| BrokerError::SessionLockLost {
                session_id: handle.session_id.to_string(),
            })?;

        slot.locked_until = Some(now + self.lock_duration);
        Ok(())
    }

    /// Explicit early unlock, independent of expiry. A stale handle is a
    /// no-op so a late disposal cannot break a newer owner's lock.
    pub(crate) async fn release(&self, handle: &SessionHandle) {
        let mut slots = self.slots.lock().await;
        if let Some(slot) = slots.get_mut(&handle.session_id) {
            if slot.token == Some(handle.token) {
                slot.token = None;
                slot.locked_until = None;
                tracing::debug!(session_id = %handle.session_id, "session released");
            }
        }
        drop(slots);
        self.notify.notify_waiters();
    }

    /// Read the opaque session state blob. Gated by lock validity.
    pub(crate) async fn get_state(
        &self,
        handle: &SessionHandle,
    ) -> Result<Option<Bytes>, BrokerError> {
        let now = self.clock.now();
        let slots = self.slots.lock().await;
        let slot = slots
            .get(&handle.session_id)
            .filter(|slot| slot.holds_valid_lock(handle.token, now))
            .ok_or_else(|| BrokerError::SessionLockLost {
                session_id: handle.session_id.to_string(),
            })?;
        Ok(slot.state_blob.clone())
    }

    /// Replace the opaque session state blob. Gated by lock validity.
    pub(crate) async fn set_state(
        &self,
        handle: &SessionHandle,
        state: Bytes,
    ) -> Result<(), BrokerError> {
        let now = self.clock.now();
        let mut slots = self.slots.lock().await;
        let slot = slots
            .get_mut(&handle.session_id)
            .filter(|slot| slot.holds_valid_lock(handle.token, now))
            .ok_or_else(|| BrokerError::SessionLockLost {
                session_id: handle.session_id.to_string(),
            })?;
        slot.state_blob = Some(state);
        Ok(())
    }
}
