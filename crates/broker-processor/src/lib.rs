//! # Broker Processor
//!
//! Push-style consumption on top of `broker-runtime`: register callbacks,
//! start the processor, and it pumps receives, dispatches handler calls under
//! a concurrency bound, and settles messages for you.
//!
//! Two processors are provided:
//!
//! - [`MessageProcessor`] for sessionless entities: one pump loop, up to
//!   `max_concurrent_calls` handler invocations in flight.
//! - [`SessionProcessor`] for session-enabled entities: holds up to
//!   `max_concurrent_sessions` session locks, each with its own receive loop,
//!   and evicts sessions that stay idle past a timeout.
//!
//! Both follow the same lifecycle: `Stopped → Starting → Running → Stopping →
//! Stopped`, with `Disposed` as the terminal state after `close()`. `stop()`
//! never kills an in-flight callback; it cancels the pumps and then waits for
//! every dispatched call to finish settling.

pub mod processor;
pub mod session_processor;

pub use processor::{
    ErrorHandler, HandlerFuture, MessageHandler, MessageProcessor, ProcessError,
    ProcessorOptions, ProcessorState,
};
pub use session_processor::{
    SessionLifecycleHandler, SessionMessageHandler, SessionProcessor, SessionProcessorOptions,
};
