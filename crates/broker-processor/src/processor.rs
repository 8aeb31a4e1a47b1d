//! Bounded-concurrency message processor for sessionless entities.

use broker_runtime::error::{BrokerError, ValidationError};
use broker_runtime::message::ReceivedMessage;
use broker_runtime::receiver::Receiver;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;
use tokio::sync::Semaphore;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

#[cfg(test)]
#[path = "processor_tests.rs"]
mod tests;

/// Future type returned by processor callbacks.
pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<(), anyhow::Error>> + Send>>;

/// Callback invoked once per delivered message.
pub type MessageHandler = Arc<dyn Fn(ReceivedMessage) -> HandlerFuture + Send + Sync>;

/// Callback invoked when a handler or settlement operation fails.
pub type ErrorHandler =
    Arc<dyn Fn(ProcessError) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// Context passed to the error handler.
#[derive(Debug)]
pub struct ProcessError {
    /// Entity the failing operation was against.
    pub entity: String,
    /// The failure itself. Handler failures arrive as-is; settlement failures
    /// are wrapped [`BrokerError`]s.
    pub error: anyhow::Error,
}

/// Processor lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessorState {
    Stopped,
    Starting,
    Running,
    Stopping,
    /// Terminal. A disposed processor cannot be restarted.
    Disposed,
}

/// Tuning knobs for [`MessageProcessor`].
#[derive(Debug, Clone)]
pub struct ProcessorOptions {
    /// Upper bound on concurrently executing handler calls.
    pub max_concurrent_calls: usize,
    /// Complete messages whose handler returned `Ok`. When false the handler
    /// settles messages itself.
    pub auto_complete: bool,
    /// How long each pump iteration waits for messages before looping.
    pub receive_wait: StdDuration,
}

impl Default for ProcessorOptions {
    fn default() -> Self {
        Self {
            max_concurrent_calls: 1,
            auto_complete: true,
            receive_wait: StdDuration::from_secs(1),
        }
    }
}

/// Pump loop that receives from a [`Receiver`] and dispatches handler calls
/// under a semaphore bound.
///
/// A handler failure abandons the message (making it eligible for redelivery)
/// and routes the error to the error handler; it never terminates the pump.
///
/// # Example
///
/// ```rust
/// use broker_processor::{MessageProcessor, ProcessorOptions};
/// use broker_runtime::clock::SystemClock;
/// use broker_runtime::entity::{EntityOptions, QueueEntity};
/// use broker_runtime::hooks::NoopHooks;
/// use broker_runtime::message::ReceiveMode;
/// use broker_runtime::receiver::QueueReceiver;
/// use std::sync::Arc;
/// use tokio_util::sync::CancellationToken;
///
/// # tokio_test::block_on(async {
/// let entity = Arc::new(QueueEntity::new(
///     "orders".to_string(),
///     EntityOptions::default(),
///     SystemClock::shared(),
///     Arc::new(NoopHooks),
/// ));
/// let receiver = Arc::new(QueueReceiver::new(entity, ReceiveMode::PeekLock));
///
/// let processor = MessageProcessor::new(receiver, ProcessorOptions::default());
/// processor
///     .set_message_handler(Arc::new(|message| {
///         Box::pin(async move {
///             println!("sequence {}", message.sequence_number);
///             Ok(())
///         })
///     }))
///     .unwrap();
///
/// let cancel = CancellationToken::new();
/// processor.start(&cancel).await.unwrap();
/// processor.stop().await.unwrap();
/// # });
/// ```
pub struct MessageProcessor {
    receiver: Arc<dyn Receiver>,
    options: ProcessorOptions,
    state: Mutex<ProcessorState>,
    message_handler: Mutex<Option<MessageHandler>>,
    error_handler: Mutex<Option<ErrorHandler>>,
    shutdown: Mutex<Option<CancellationToken>>,
    pump: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl MessageProcessor {
    pub fn new(receiver: Arc<dyn Receiver>, options: ProcessorOptions) -> Self {
        Self {
            receiver,
            options,
            state: Mutex::new(ProcessorState::Stopped),
            message_handler: Mutex::new(None),
            error_handler: Mutex::new(None),
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

    /// Register the message handler. May be set once.
    pub fn set_message_handler(&self, handler: MessageHandler) -> Result<(), BrokerError> {
        let mut slot = self.message_handler.lock().expect("handler mutex poisoned");
        if slot.is_some() {
            return Err(BrokerError::NotSupported {
                message: "message handler is already set".to_string(),
            });
        }
        *slot = Some(handler);
        Ok(())
    }

    /// Register the error handler. May be set once.
    pub fn set_error_handler(&self, handler: ErrorHandler) -> Result<(), BrokerError> {
        let mut slot = self.error_handler.lock().expect("handler mutex poisoned");
        if slot.is_some() {
            return Err(BrokerError::NotSupported {
                message: "error handler is already set".to_string(),
            });
        }
        *slot = Some(handler);
        Ok(())
    }

    /// Start pumping. Fails fast when already running, disposed, or no
    /// message handler has been registered.
    pub async fn start(&self, cancel: &CancellationToken) -> Result<(), BrokerError> {
        let (handler, error_handler) = {
            let mut state = self.state.lock().expect("processor state mutex poisoned");
            match *state {
                ProcessorState::Disposed => return Err(BrokerError::Disposed),
                ProcessorState::Stopped => {}
                _ => return Err(BrokerError::AlreadyRunning),
            }

            let handler = self
                .message_handler
                .lock()
                .expect("handler mutex poisoned")
                .clone()
                .ok_or(BrokerError::Validation(ValidationError::Required {
                    field: "message_handler".to_string(),
                }))?;
            let error_handler = self
                .error_handler
                .lock()
                .expect("handler mutex poisoned")
                .clone();

            *state = ProcessorState::Starting;
            (handler, error_handler)
        };

        let token = cancel.child_token();
        *self.shutdown.lock().expect("shutdown token mutex poisoned") = Some(token.clone());

        let pump = tokio::spawn(pump_loop(
            self.receiver.clone(),
            self.options.clone(),
            handler,
            error_handler,
            token.clone(),
        ));
        *self.pump.lock().await = Some(pump);

        self.finish_start(&token);
        tracing::info!(entity = self.receiver.entity_name(), "processor started");
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

    /// Stop pumping and wait for every in-flight handler call to finish
    /// settling. Idempotent on a processor that is not running.
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
                tracing::error!(error = %err, "processor pump task failed");
            }
        }

        *self.state.lock().expect("processor state mutex poisoned") = ProcessorState::Stopped;
        tracing::info!(entity = self.receiver.entity_name(), "processor stopped");
        Ok(())
    }

    /// Stop if running, then dispose. Irreversible.
    pub async fn close(&self) -> Result<(), BrokerError> {
        self.stop().await?;
        *self.state.lock().expect("processor state mutex poisoned") = ProcessorState::Disposed;
        Ok(())
    }
}

async fn pump_loop(
    receiver: Arc<dyn Receiver>,
    options: ProcessorOptions,
    handler: MessageHandler,
    error_handler: Option<ErrorHandler>,
    cancel: CancellationToken,
) {
    let limiter = Arc::new(Semaphore::new(options.max_concurrent_calls));
    let mut calls: JoinSet<()> = JoinSet::new();

    'pump: while !cancel.is_cancelled() {
        // Reap finished calls so the set does not grow unbounded.
        while calls.try_join_next().is_some() {}

        let batch = receiver
            .receive(options.max_concurrent_calls, options.receive_wait, &cancel)
            .await;

        let messages = match batch {
            Ok(messages) => messages,
            Err(BrokerError::Cancelled) => break,
            Err(err) => {
                route_error(&error_handler, receiver.entity_name(), err.into()).await;
                // Avoid a hot loop when the receiver fails immediately.
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(options.receive_wait) => {}
                }
                continue;
            }
        };

        let mut pending = messages.into_iter();
        while let Some(message) = pending.next() {
            let permit = tokio::select! {
                _ = cancel.cancelled() => {
                    // Return this message and the rest of the batch before
                    // shutting down.
                    abandon_quietly(&receiver, &message).await;
                    for message in pending.by_ref() {
                        abandon_quietly(&receiver, &message).await;
                    }
                    break 'pump;
                }
                permit = limiter.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break 'pump,
                },
            };

            let receiver = receiver.clone();
            let handler = handler.clone();
            let error_handler = error_handler.clone();
            let auto_complete = options.auto_complete;
            calls.spawn(async move {
                let _permit = permit;
                dispatch(receiver, handler, error_handler, auto_complete, message).await;
            });
        }
    }

    // In-flight calls are waited out, never killed.
    while calls.join_next().await.is_some() {}
}

async fn dispatch(
    receiver: Arc<dyn Receiver>,
    handler: MessageHandler,
    error_handler: Option<ErrorHandler>,
    auto_complete: bool,
    message: ReceivedMessage,
) {
    let sequence_number = message.sequence_number;
    match handler(message.clone()).await {
        Ok(()) => {
            if auto_complete {
                if let Err(err) = receiver.complete(&message).await {
                    tracing::warn!(
                        entity = receiver.entity_name(),
                        sequence_number,
                        error = %err,
                        "auto-complete failed"
                    );
                    route_error(&error_handler, receiver.entity_name(), err.into()).await;
                }
            }
        }
        Err(err) => {
            tracing::warn!(
                entity = receiver.entity_name(),
                sequence_number,
                error = %err,
                "message handler failed, abandoning"
            );
            abandon_quietly(&receiver, &message).await;
            route_error(&error_handler, receiver.entity_name(), err).await;
        }
    }
}

async fn abandon_quietly(receiver: &Arc<dyn Receiver>, message: &ReceivedMessage) {
    if let Err(err) = receiver.abandon(message).await {
        // The lock may already have lapsed; redelivery happens either way.
        tracing::debug!(
            entity = receiver.entity_name(),
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
        None => tracing::error!(entity, error = %error, "processing error"),
    }
}
