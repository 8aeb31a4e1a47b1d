//! Message types and core domain identifiers.

use crate::error::ValidationError;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;

#[cfg(test)]
#[path = "message_tests.rs"]
mod tests;

// ============================================================================
// Core Domain Identifiers
// ============================================================================

/// Broker-assigned message order within an entity. Strictly increasing,
/// assigned once, never reused.
pub type SequenceNumber = u64;

/// Validated entity (queue, topic, or subscription) name
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityName(String);

impl EntityName {
    /// Create new entity name with validation
    pub fn new(name: String) -> Result<Self, ValidationError> {
        if name.is_empty() || name.len() > 260 {
            return Err(ValidationError::OutOfRange {
                field: "entity_name".to_string(),
                message: "must be 1-260 characters".to_string(),
            });
        }

        // ASCII alphanumeric, hyphens, underscores, and path separators for
        // topic/subscription compound names
        if !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '/')
        {
            return Err(ValidationError::InvalidFormat {
                field: "entity_name".to_string(),
                message: "only ASCII alphanumeric, hyphens, underscores, and '/' allowed"
                    .to_string(),
            });
        }

        Ok(Self(name))
    }

    /// Get entity name as string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for EntityName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for EntityName {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s.to_string())
    }
}

/// Identifier naming a session: a partition of an entity that requires
/// exclusive consumer ownership
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(String);

impl SessionId {
    /// Create new session ID with validation
    pub fn new(id: String) -> Result<Self, ValidationError> {
        if id.is_empty() {
            return Err(ValidationError::Required {
                field: "session_id".to_string(),
            });
        }

        if id.len() > 128 {
            return Err(ValidationError::OutOfRange {
                field: "session_id".to_string(),
                message: "maximum 128 characters".to_string(),
            });
        }

        if !id.chars().all(|c| c.is_ascii() && !c.is_ascii_control()) {
            return Err(ValidationError::InvalidFormat {
                field: "session_id".to_string(),
                message: "only ASCII printable characters allowed".to_string(),
            });
        }

        Ok(Self(id))
    }

    /// Get session ID as string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for SessionId {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s.to_string())
    }
}

/// Opaque credential proving ownership of a message or session lock.
///
/// A fresh token is minted on every successful lock acquisition, and the
/// latest mint wins: presenting a stale token fails the correctness check on
/// complete/renew.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LockToken(uuid::Uuid);

impl LockToken {
    /// Mint a fresh token
    pub fn mint() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl std::fmt::Display for LockToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Message Types
// ============================================================================

/// How a receive call transfers ownership of a message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveMode {
    /// Lock the message for `lock_duration`; the consumer settles it with
    /// complete/abandon before the lock expires.
    PeekLock,
    /// Delete the message from the store at the moment of delivery.
    ReceiveAndDelete,
}

/// A message to be accepted by an entity
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    #[serde(with = "bytes_serde")]
    pub body: Bytes,
    pub application_properties: HashMap<String, String>,
    pub session_id: Option<SessionId>,
}

/// Custom serialization for Bytes
mod bytes_serde {
    use base64::{engine::general_purpose, Engine as _};
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(bytes: &Bytes, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let encoded = general_purpose::STANDARD.encode(bytes);
        encoded.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Bytes, D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded = String::deserialize(deserializer)?;
        let decoded = general_purpose::STANDARD
            .decode(encoded)
            .map_err(serde::de::Error::custom)?;
        Ok(Bytes::from(decoded))
    }
}

impl Message {
    /// Create new message with body
    pub fn new(body: Bytes) -> Self {
        Self {
            body,
            application_properties: HashMap::new(),
            session_id: None,
        }
    }

    /// Assign the message to a session (required for session entities)
    pub fn with_session_id(mut self, session_id: SessionId) -> Self {
        self.session_id = Some(session_id);
        self
    }

    /// Add an application property
    pub fn with_property(mut self, key: String, value: String) -> Self {
        self.application_properties.insert(key, value);
        self
    }
}

/// A message delivered by a receive call, with broker metadata
#[derive(Debug, Clone)]
pub struct ReceivedMessage {
    pub sequence_number: SequenceNumber,
    pub body: Bytes,
    pub application_properties: HashMap<String, String>,
    pub session_id: Option<SessionId>,
    pub enqueued_at: DateTime<Utc>,
    pub delivery_count: u32,
    /// Token proving ownership of the message lock. `None` in
    /// ReceiveAndDelete mode, where there is nothing left to settle.
    pub lock_token: Option<LockToken>,
    /// Absolute expiry of the message lock. `None` in ReceiveAndDelete mode.
    pub locked_until: Option<DateTime<Utc>>,
}

impl ReceivedMessage {
    /// Convert back to a producer-side message (for forwarding/replaying)
    pub fn message(&self) -> Message {
        Message {
            body: self.body.clone(),
            application_properties: self.application_properties.clone(),
            session_id: self.session_id.clone(),
        }
    }
}
