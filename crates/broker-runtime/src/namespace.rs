//! Namespace and topology registry.
//!
//! The registry is process-scoped state with an explicit lifecycle: construct
//! a [`BrokerRegistry`], add namespaces, create queues and topics inside
//! them, and share the registry by reference. There are no ambient statics.
//! Entities are created once at topology-setup time and live until the
//! namespace is dropped.

use crate::clock::SharedClock;
use crate::entity::{EntityOptions, QueueEntity, Topic};
use crate::error::BrokerError;
use crate::hooks::{NoopHooks, OperationHooks};
use crate::message::EntityName;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

#[cfg(test)]
#[path = "namespace_tests.rs"]
mod tests;

/// Root registry mapping namespace names to their topology.
pub struct BrokerRegistry {
    namespaces: RwLock<HashMap<String, Arc<Namespace>>>,
    clock: SharedClock,
    hooks: Arc<dyn OperationHooks>,
}

impl BrokerRegistry {
    /// Create a registry whose entities all read time from `clock`.
    pub fn new(clock: SharedClock) -> Self {
        Self::with_hooks(clock, Arc::new(NoopHooks))
    }

    /// Create a registry with operation hooks installed on every entity.
    pub fn with_hooks(clock: SharedClock, hooks: Arc<dyn OperationHooks>) -> Self {
        Self {
            namespaces: RwLock::new(HashMap::new()),
            clock,
            hooks,
        }
    }

    /// Add a namespace. Fails if the name is already registered.
    pub async fn add_namespace(&self, name: &str) -> Result<Arc<Namespace>, BrokerError> {
        let mut namespaces = self.namespaces.write().await;
        if namespaces.contains_key(name) {
            return Err(BrokerError::EntityExists {
                name: name.to_string(),
            });
        }

        let namespace = Arc::new(Namespace {
            name: name.to_string(),
            queues: RwLock::new(HashMap::new()),
            topics: RwLock::new(HashMap::new()),
            clock: self.clock.clone(),
            hooks: self.hooks.clone(),
        });
        namespaces.insert(name.to_string(), namespace.clone());
        tracing::debug!(namespace = name, "namespace added");
        Ok(namespace)
    }

    /// Look up a namespace by name.
    pub async fn get_namespace(&self, name: &str) -> Result<Arc<Namespace>, BrokerError> {
        let namespaces = self.namespaces.read().await;
        namespaces
            .get(name)
            .cloned()
            .ok_or_else(|| BrokerError::NamespaceNotFound {
                name: name.to_string(),
            })
    }
}

/// One namespace: a set of queues and topics.
pub struct Namespace {
    name: String,
    queues: RwLock<HashMap<String, Arc<QueueEntity>>>,
    topics: RwLock<HashMap<String, Arc<Topic>>>,
    clock: SharedClock,
    hooks: Arc<dyn OperationHooks>,
}

impl Namespace {
    /// Namespace name, as registered.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Create a queue entity. Fails on an invalid or duplicate name.
    pub async fn create_queue(
        &self,
        name: &str,
        options: EntityOptions,
    ) -> Result<Arc<QueueEntity>, BrokerError> {
        let validated = EntityName::new(name.to_string())?;

        let mut queues = self.queues.write().await;
        if queues.contains_key(validated.as_str()) {
            return Err(BrokerError::EntityExists {
                name: name.to_string(),
            });
        }

        let entity = Arc::new(QueueEntity::new(
            validated.as_str().to_string(),
            options,
            self.clock.clone(),
            self.hooks.clone(),
        ));
        queues.insert(validated.as_str().to_string(), entity.clone());
        tracing::debug!(namespace = %self.name, queue = name, "queue created");
        Ok(entity)
    }

    /// Look up a queue by name.
    pub async fn get_queue(&self, name: &str) -> Result<Arc<QueueEntity>, BrokerError> {
        let queues = self.queues.read().await;
        queues
            .get(name)
            .cloned()
            .ok_or_else(|| BrokerError::EntityNotFound {
                name: name.to_string(),
            })
    }

    /// Create a topic. Fails on an invalid or duplicate name.
    pub async fn create_topic(&self, name: &str) -> Result<Arc<Topic>, BrokerError> {
        let validated = EntityName::new(name.to_string())?;

        let mut topics = self.topics.write().await;
        if topics.contains_key(validated.as_str()) {
            return Err(BrokerError::EntityExists {
                name: name.to_string(),
            });
        }

        let topic = Arc::new(Topic::new(
            validated.as_str().to_string(),
            self.clock.clone(),
            self.hooks.clone(),
        ));
        topics.insert(validated.as_str().to_string(), topic.clone());
        tracing::debug!(namespace = %self.name, topic = name, "topic created");
        Ok(topic)
    }

    /// Look up a topic by name.
    pub async fn get_topic(&self, name: &str) -> Result<Arc<Topic>, BrokerError> {
        let topics = self.topics.read().await;
        topics
            .get(name)
            .cloned()
            .ok_or_else(|| BrokerError::EntityNotFound {
                name: name.to_string(),
            })
    }

    /// Create a subscription under an existing topic. The subscription is a
    /// full entity addressed as `topic/name`.
    pub async fn create_subscription(
        &self,
        topic_name: &str,
        name: &str,
        options: EntityOptions,
    ) -> Result<Arc<QueueEntity>, BrokerError> {
        EntityName::new(name.to_string())?;
        let topic = self.get_topic(topic_name).await?;
        topic.create_subscription(name, options).await
    }

    /// Look up a subscription entity under a topic.
    pub async fn get_subscription(
        &self,
        topic_name: &str,
        name: &str,
    ) -> Result<Arc<QueueEntity>, BrokerError> {
        let topic = self.get_topic(topic_name).await?;
        topic.get_subscription(name).await
    }
}
