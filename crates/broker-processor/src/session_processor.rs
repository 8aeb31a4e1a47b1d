//! Session-aware processor: rolling pool of locked sessions, each pumped by
//! its own task.

use crate::processor::{ErrorHandler, HandlerFuture, ProcessError, ProcessorState};
use broker_runtime::clock::SharedClock;
use broker_runtime::entity::QueueEntity;
use broker_runtime::error::{BrokerError, ValidationError};
use broker_runtime::message::{ReceiveMode, ReceivedMessage, SessionId};
use broker_runtime::receiver::{Receiver, SessionReceiver};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;
use tokio::sync::Semaphore;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

#[cfg(test)]
#[path = "session_processor_tests.rs"]
mod tests;

/// Callback invoked once per delivered message, with the owning session.
pub type SessionMessageHandler =
    Arc<dyn Fn(SessionId, ReceivedMessage) -> HandlerFuture + Send + Sync>;

/// Callback invoked when a session joins or leaves the pool.
pub type SessionLifecycleHandler = Arc<dyn Fn(SessionId) -> HandlerFuture + Send + Sync>;

/// Tuning knobs for [`SessionProcessor`].
#[derive(Debug, Clone)]
pub struct SessionProcessorOptions {
    /// Upper bound on concurrently held session locks.
    pub max_concurrent_sessions: usize,
    /// Upper bound on concurrent handler calls within one session. Keep at 1
    /// for in-order processing.
    pub max_concurrent_calls_per_session: usize,
    /// Specific sessions to process. Empty means accept whichever session
    /// has messages next.
    pub session_ids: Vec<SessionId>,
    /// A session with no deliveries for this long is released back to the
    /// pool. Measured against the entity's clock.
    pub session_idle_timeout: chrono::Duration,
    /// Complete messages whose handler returned `Ok`.
    pub auto_complete: bool,
    /// How long each receive iteration waits before re-checking idleness.
    pub receive_wait: StdDuration,
}

impl Default for SessionProcessorOptions {
    fn default() -> Self {
        Self {
            max_concurrent_sessions: 1,
            max_concurrent_calls_per_session: 1,
            session_ids: Vec::new(),
            session_idle_timeout: chrono::Duration::seconds(30),
            auto_complete: true,
            receive_wait: StdDuration::from_secs(1),
        }
    }
}

/// Processor over a session-enabled entity.
///
/// The outer pump keeps up to `max_concurrent_sessions` sessions locked.
/// Each locked session runs its own receive loop until the session goes
/// idle, its lock is lost, or the processor stops; the session is then
/// closed, released, and its pool slot refilled.
pub struct SessionProcessor {
    entity: Arc<QueueEntity>,
    clock: SharedClock,
    options: SessionProcessorOptions,
    state: Mutex<ProcessorState>,
    callbacks: Mutex<CallbackSlots>,
    shutdown: Mutex<Option<CancellationToken>>,
    pump: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

#[derive(Default)]
struct CallbackSlots {
    on_message: Option<SessionMessageHandler>,
    on_error: Option<ErrorHandler>,
    on_session_init: Option<SessionLifecycleHandler>,
    on_session_close: Option<SessionLifecycleHandler>,
}

#[derive(Clone)]
struct SessionCallbacks {
    on_message: SessionMessageHandler,
    on_error: Option<ErrorHandler>,
    on_session_init: Option<SessionLifecycleHandler>,
    on_session_close: Option<SessionLifecycleHandler>,
}

impl SessionProcessor {
    /// Create a processor over a session-enabled entity. Idle timeouts are
    /// measured against the entity's own clock.
    pub fn new(entity: Arc<QueueEntity>, options: SessionProcessorOptions) -> Self {
        let clock = entity.clock().clone();
        Self {
            entity,
            clock,
            options,
            state: Mutex::new(ProcessorState::Stopped),
            callbacks: Mutex::new(CallbackSlots::default()),
            shutdown: Mutex::new(None),
            pump: tokio::sync::Mutex::new(None),
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ProcessorState {
        *self.state.lock().expect("processor state mutex poisoned")
    }

    /// True from a successful `start` until `stop` has fully drained.
    pub fn is_processing(&self) -> bool {
        matches!(
            self.state(),
            ProcessorState::Starting | ProcessorState::Running | ProcessorState::Stopping
        )
    }

    /// Register the per-message callback. May be set once.
    pub fn set_message_handler(&self, handler: SessionMessageHandler) -> Result<(), BrokerError> {
        let mut slots = self.callbacks.lock().expect("callback mutex poisoned");
        if slots.on_message.is_some() {
            return Err(BrokerError::NotSupported {
                message: "message handler is already set".to_string(),
            });
        }
        slots.on_message = Some(handler);
        Ok(())
    }

    /// Register the error callback. May be set once.
    pub fn set_error_handler(&self, handler: ErrorHandler) -> Result<(), BrokerError> {
        let mut slots = self.callbacks.lock().expect("callback mutex poisoned");
        if slots.on_error.is_some() {
            return Err(BrokerError::NotSupported {
                message: "error handler is already set".to_string(),
            });
        }
        slots.on_error = Some(handler);
        Ok(())
    }

    /// Register a callback fired once when a session joins the pool.
    pub fn set_session_init_handler(
        &self,
        handler: SessionLifecycleHandler,
    ) -> Result<(), BrokerError> {
        let mut slots = self.callbacks.lock().expect("callback mutex poisoned");
        if slots.on_session_init.is_some() {
            return Err(BrokerError::NotSupported {
                message: "session init handler is already set".to_string(),
            });
        }
        slots.on_session_init = Some(handler);
        Ok(())
    }

    /// Register a callback fired once when a session leaves the pool.
    pub fn set_session_close_handler(
        &self,
        handler: SessionLifecycleHandler,
    ) -> Result<(), BrokerError> {
        let mut slots = self.callbacks.lock().expect("callback mutex poisoned");
        if slots.on_session_close.is_some() {
            return Err(BrokerError::NotSupported {
                message: "session close handler is already set".to_string(),
            });
        }
        slots.on_session_close = Some(handler);
        Ok(())
    }

    /// Start accepting sessions. Fails fast when already running, disposed,
    /// or no message handler has been registered.
    pub async fn start(&self, cancel: &CancellationToken) -> Result<(), BrokerError> {
        let callbacks = {
            let mut state = self.state.lock().expect("processor state mutex poisoned");
            match *state {
                ProcessorState::Disposed => return Err(BrokerError::Disposed),
                ProcessorState::Stopped => {}
                _ => return Err(BrokerError::AlreadyRunning),
            }

            let slots = self.callbacks.lock().expect("callback mutex poisoned");
            let on_message =
                slots
                    .on_message
                    .clone()
                    .ok_or(BrokerError::Validation(ValidationError::Required {
                        field: "message_handler".to_string(),
                    }))?;
            let callbacks = SessionCallbacks {
                on_message,
                on_error: slots.on_error.clone(),
                on_session_init: slots.on_session_init.clone(),
                on_session_close: slots.on_session_close.clone(),
            };

            *state = ProcessorState::Starting;
            callbacks
        };

        let token = cancel.child_token();
        *self.shutdown.lock().expect("shutdown token mutex poisoned") = Some(token.clone());

        let pump = tokio::spawn(session_pump(
            self.entity.clone(),
            self.clock.clone(),
            self.options.clone(),
            callbacks,
            token.clone(),
        ));
        *self.pump.lock().await = Some(pump);

        self.finish_start(&token);
        tracing::info!(entity = self.entity.name(), "session processor started");
        Ok(())
    }

    /// Promote `Starting` to `Running`. A concurrent `stop` may have taken
    /// over while the pump handle was being stored; its state transition must
    /// not be overwritten, and the freshly spawned pump is cancelled so a
    /// stopped processor cannot keep pumping.
    fn finish_start(&self, token: &CancellationToken) {
        let mut state = self.state.lock().expect("processor state mutex poisoned");
        if *state == ProcessorState::Starting {
            *state = ProcessorState::Running;
        } else {
            token.cancel();
        }
    }

    /// Stop and wait for every active session task to close its session and
    /// release its lock. Idempotent on a processor that is not running.
    pub async fn stop(&self) -> Result<(), BrokerError> {
        {
            let mut state = self.state.lock().expect("processor state mutex poisoned");
            match *state {
                ProcessorState::Running | ProcessorState::Starting => {
                    *state = ProcessorState::Stopping;
                }
                _ => return Ok(()),
            }
        }

        if let Some(token) = self
            .shutdown
            .lock()
            .expect("shutdown token mutex poisoned")
            .take()
        {
            token.cancel();
        }

        let pump = self.pump.lock().await.take();
        if let Some(pump) = pump {
            if let Err(err) = pump.await {
                tracing::error!(error = %err, "session pump task failed");
            }
        }

        *self.state.lock().expect("processor state mutex poisoned") = ProcessorState::Stopped;
        tracing::info!(entity = self.entity.name(), "session processor stopped");
        Ok(())
    }

    /// Stop if running, then dispose. Irreversible.
    pub async fn close(&self) -> Result<(), BrokerError> {
        self.stop().await?;
        *self.state.lock().expect("processor state mutex poisoned") = ProcessorState::Disposed;
        Ok(())
    }
}

/// Outer pump: keep the session pool full, reaping finished session tasks as
/// their slots free up.
async fn session_pump(
    entity: Arc<QueueEntity>,
    clock: SharedClock,
    options: SessionProcessorOptions,
    callbacks: SessionCallbacks,
    cancel: CancellationToken,
) {
    let mut active: HashSet<SessionId> = HashSet::new();
    let mut sessions: JoinSet<SessionId> = JoinSet::new();

    while !cancel.is_cancelled() {
        while let Some(finished) = sessions.try_join_next() {
            if let Ok(session_id) = finished {
                active.remove(&session_id);
            }
        }

        if active.len() >= options.max_concurrent_sessions {
            tokio::select! {
                _ = cancel.cancelled() => break,
                finished = sessions.join_next() => {
                    match finished {
                        Some(Ok(session_id)) => {
                            active.remove(&session_id);
                        }
                        Some(Err(err)) => {
                            tracing::error!(error = %err, "session task failed");
                        }
                        // A panicked task leaves no id to reap; reset the
                        // bookkeeping so the pool cannot wedge.
                        None => active.clear(),
                    }
                }
            }
            continue;
        }

        let receiver = match accept_one(&entity, &options, &active, &callbacks, &cancel).await {
            Accepted::Session(receiver) => receiver,
            Accepted::Retry => continue,
            Accepted::Shutdown => break,
        };

        let session_id = receiver.session_id().clone();
        tracing::debug!(entity = entity.name(), session = %session_id, "session accepted");
        active.insert(session_id.clone());

        sessions.spawn(run_session(
            Arc::new(receiver),
            session_id,
            clock.clone(),
            options.clone(),
            callbacks.clone(),
            cancel.clone(),
        ));
    }

    // Every active session finishes its drain-close-release sequence before
    // the pump exits.
    while sessions.join_next().await.is_some() {}
}

enum Accepted {
    Session(SessionReceiver),
    Retry,
    Shutdown,
}

async fn accept_one(
    entity: &Arc<QueueEntity>,
    options: &SessionProcessorOptions,
    active: &HashSet<SessionId>,
    callbacks: &SessionCallbacks,
    cancel: &CancellationToken,
) -> Accepted {
    if options.session_ids.is_empty() {
        match entity.accept_next_session(options.receive_wait, cancel).await {
            Ok(handle) => {
                Accepted::Session(SessionReceiver::new(entity.clone(), handle, ReceiveMode::PeekLock))
            }
            Err(BrokerError::ServiceTimeout { .. }) => Accepted::Retry,
            Err(BrokerError::Cancelled) => Accepted::Shutdown,
            Err(err) => {
                route_error(&callbacks.on_error, entity.name(), err.into()).await;
                Accepted::Retry
            }
        }
    } else {
        for session_id in &options.session_ids {
            if active.contains(session_id) {
                continue;
            }
            match entity.accept_session(session_id, cancel).await {
                Ok(handle) => {
                    return Accepted::Session(SessionReceiver::new(
                        entity.clone(),
                        handle,
                        ReceiveMode::PeekLock,
                    ));
                }
                // Held elsewhere; try the next configured id.
                Err(BrokerError::SessionCannotBeLocked { .. })
                | Err(BrokerError::SessionLockLost { .. }) => continue,
                Err(BrokerError::Cancelled) => return Accepted::Shutdown,
                Err(err) => {
                    route_error(&callbacks.on_error, entity.name(), err.into()).await;
                    continue;
                }
            }
        }
        // Nothing lockable right now; back off before the next sweep.
        tokio::select! {
            _ = cancel.cancelled() => Accepted::Shutdown,
            _ = tokio::time::sleep(options.receive_wait) => Accepted::Retry,
        }
    }
}

/// One session's receive loop. Returns the session id so the pump can free
/// its pool slot.
async fn run_session(
    receiver: Arc<SessionReceiver>,
    session_id: SessionId,
    clock: SharedClock,
    options: SessionProcessorOptions,
    callbacks: SessionCallbacks,
    cancel: CancellationToken,
) -> SessionId {
    if let Some(init) = &callbacks.on_session_init {
        if let Err(err) = init(session_id.clone()).await {
            route_error(&callbacks.on_error, receiver.entity_name(), err).await;
        }
    }

    let limiter = Arc::new(Semaphore::new(options.max_concurrent_calls_per_session));
    let mut calls: JoinSet<()> = JoinSet::new();
    let mut last_activity = clock.now();

    'session: loop {
        while calls.try_join_next().is_some() {}

        if cancel.is_cancelled() {
            break;
        }
        if clock.now() - last_activity > options.session_idle_timeout {
            tracing::debug!(session = %session_id, "session idle, releasing");
            break;
        }

        let batch = receiver
            .receive(
                options.max_concurrent_calls_per_session,
                options.receive_wait,
                &cancel,
            )
            .await;

        let messages = match batch {
            Ok(messages) => messages,
            Err(BrokerError::Cancelled) => break,
            Err(err @ BrokerError::SessionLockLost { .. }) => {
                route_error(&callbacks.on_error, receiver.entity_name(), err.into()).await;
                break;
            }
            Err(err) => {
                route_error(&callbacks.on_error, receiver.entity_name(), err.into()).await;
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(options.receive_wait) => {}
                }
                continue;
            }
        };

        if messages.is_empty() {
            continue;
        }
        last_activity = clock.now();

        let mut pending = messages.into_iter();
        while let Some(message) = pending.next() {
            let permit = tokio::select! {
                _ = cancel.cancelled() => {
                    abandon_quietly(&receiver, &message).await;
                    for message in pending.by_ref() {
                        abandon_quietly(&receiver, &message).await;
                    }
                    break 'session;
                }
                permit = limiter.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break 'session,
                },
            };

            let receiver = receiver.clone();
            let callbacks = callbacks.clone();
            let session_id = session_id.clone();
            let auto_complete = options.auto_complete;
            calls.spawn(async move {
                let _permit = permit;
                dispatch_session_message(receiver, callbacks, session_id, auto_complete, message)
                    .await;
            });
        }
    }

    // Drain in-flight calls, then close and release, in that order.
    while calls.join_next().await.is_some() {}

    if let Some(close) = &callbacks.on_session_close {
        if let Err(err) = close(session_id.clone()).await {
            route_error(&callbacks.on_error, receiver.entity_name(), err).await;
        }
    }

    if let Err(err) = receiver.dispose().await {
        tracing::debug!(session = %session_id, error = %err, "session release failed");
    }

    session_id
}

async fn dispatch_session_message(
    receiver: Arc<SessionReceiver>,
    callbacks: SessionCallbacks,
    session_id: SessionId,
    auto_complete: bool,
    message: ReceivedMessage,
) {
    let sequence_number = message.sequence_number;
    match (callbacks.on_message)(session_id.clone(), message.clone()).await {
        Ok(()) => {
            if auto_complete {
                if let Err(err) = receiver.complete(&message).await {
                    tracing::warn!(
                        session = %session_id,
                        sequence_number,
                        error = %err,
                        "auto-complete failed"
                    );
                    route_error(&callbacks.on_error, receiver.entity_name(), err.into()).await;
                }
            }
        }
        Err(err) => {
            tracing::warn!(
                session = %session_id,
                sequence_number,
                error = %err,
                "session message handler failed, abandoning"
            );
            abandon_quietly(&receiver, &message).await;
            route_error(&callbacks.on_error, receiver.entity_name(), err).await;
        }
    }
}

async fn abandon_quietly(receiver: &Arc<SessionReceiver>, message: &ReceivedMessage) {
    if let Err(err) = receiver.abandon(message).await {
        tracing::debug!(
            sequence_number = message.sequence_number,
            error = %err,
            "abandon failed"
        );
    }
}

async fn route_error(error_handler: &Option<ErrorHandler>, entity: &str, error: anyhow::Error) {
    match error_handler {
        Some(handler) => {
            handler(ProcessError {
                entity: entity.to_string(),
                error,
            })
            .await
        }
        None => tracing::error!(entity, error = %error, "session processing error"),
    }
}
