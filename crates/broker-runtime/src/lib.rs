//! # Broker Runtime
//!
//! In-process emulator of a cloud message broker's data plane: queues,
//! topics/subscriptions, and sessions with real lock semantics.
//!
//! This library provides:
//! - Per-entity message storage with strictly increasing sequence numbers
//! - PeekLock / ReceiveAndDelete delivery with lazy lock expiry
//! - Exclusive session locks with renew/release and opaque session state
//! - Blocking-with-timeout receive backed by an injectable clock
//! - A namespace registry with explicit lifecycle (no ambient statics)
//!
//! All expiry decisions read from a shared [`clock::Clock`], which is what
//! makes tests deterministic: a [`clock::VirtualClock`] can be fast-forwarded
//! past a lock's `locked_until` and the engine behaves as if the time had
//! really passed. There is no background sweep thread.
//!
//! ## Module Organization
//!
//! - [`error`] - Error taxonomy for all broker operations
//! - [`message`] - Message structures, identifiers, and lock tokens
//! - [`clock`] - Injectable time source (system and virtual)
//! - [`store`] - Per-entity message store and message lock manager
//! - [`sessions`] - Session lock manager and session handles
//! - [`entity`] - Queue and topic/subscription engines
//! - [`namespace`] - Namespace and topology registry
//! - [`hooks`] - Before/after operation extension points
//! - [`receiver`] - Receiver abstraction consumed by processors

// Module declarations
pub mod clock;
pub mod entity;
pub mod error;
pub mod hooks;
pub mod message;
pub mod namespace;
pub mod receiver;
pub mod sessions;
pub mod store;

// Re-export commonly used types at crate root for convenience
pub use clock::{Clock, SharedClock, SystemClock, VirtualClock};
pub use entity::{EntityOptions, QueueEntity, Topic};
pub use error::{BrokerError, ValidationError};
pub use hooks::{NoopHooks, OperationHooks, OperationInfo, OperationKind};
pub use message::{
    EntityName, LockToken, Message, ReceiveMode, ReceivedMessage, SequenceNumber, SessionId,
};
pub use namespace::{BrokerRegistry, Namespace};
pub use receiver::{QueueReceiver, Receiver, SessionReceiver};
pub use sessions::SessionHandle;
