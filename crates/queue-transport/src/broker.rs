//! Broker client traits for leased-delivery queues.
//!
//! Implemented by the concrete brokers in [`crate::providers`]. The transport
//! only relies on peek-lock semantics: a received message carries an exclusive
//! lease that must be acknowledged before it expires, otherwise the broker
//! redelivers it.

use crate::config::QueueSettings;
use crate::error::BrokerError;
use crate::message::QueueName;
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

#[cfg(test)]
#[path = "broker_tests.rs"]
mod tests;

/// Enumeration of supported brokers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProviderType {
    AzureServiceBus,
    InMemory,
}

impl ProviderType {
    /// Get maximum message size for provider
    pub fn max_message_size(&self) -> usize {
        match self {
            Self::AzureServiceBus => 256 * 1024, // Standard tier
            Self::InMemory => 10 * 1024 * 1024,  // 10MB
        }
    }
}

/// Outcome of an idempotent queue creation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueCreation {
    Created,
    AlreadyExists,
}

/// Outcome of acknowledging a leased message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acknowledgement {
    /// The broker removed the message
    Completed,
    /// The lease expired or another consumer already finalized the message
    LeaseLost,
}

/// Settings a queue is provisioned with
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueDescription {
    pub name: QueueName,
    pub lock_duration: Duration,
    pub max_size_mb: u64,
    pub requires_duplicate_detection: bool,
    pub requires_session: bool,
    pub default_message_ttl: Duration,
    pub dead_lettering_on_message_expiration: bool,
    pub duplicate_detection_window: Duration,
    pub max_delivery_count: u32,
    pub enable_batched_operations: bool,
}

impl QueueDescription {
    /// Create a description with the default queue settings
    pub fn new(name: QueueName) -> Self {
        QueueSettings::default().to_description(name)
    }
}

/// Entry point into a broker: queue management and handle creation
#[async_trait]
pub trait BrokerClient: Send + Sync {
    /// Create a queue; an existing queue is reported, not treated as failure
    async fn create_queue(
        &self,
        description: &QueueDescription,
    ) -> Result<QueueCreation, BrokerError>;

    /// Create a sender bound to an existing queue
    async fn create_sender(&self, queue: &QueueName) -> Result<Arc<dyn QueueSender>, BrokerError>;

    /// Create a peek-lock receiver bound to an existing queue
    async fn create_receiver(
        &self,
        queue: &QueueName,
    ) -> Result<Arc<dyn QueueReceiver>, BrokerError>;

    /// Get provider type
    fn provider_type(&self) -> ProviderType;
}

/// Handle used to send payloads to one queue, shared by concurrent callers
#[async_trait]
pub trait QueueSender: Send + Sync {
    /// Send one payload; `BrokerError::Busy` signals throttling
    async fn send(&self, payload: Bytes) -> Result<(), BrokerError>;

    /// Queue this sender is bound to
    fn queue_name(&self) -> &QueueName;
}

/// Handle used to pull leased messages from one queue
#[async_trait]
pub trait QueueReceiver: Send + Sync {
    /// Wait up to `wait` for a message; `Ok(None)` when nothing arrived
    async fn receive(&self, wait: Duration) -> Result<Option<Box<dyn LeasedMessage>>, BrokerError>;

    /// Queue this receiver is bound to
    fn queue_name(&self) -> &QueueName;
}

/// A message held under an exclusive, time-bounded lease
#[async_trait]
pub trait LeasedMessage: Send + Sync {
    /// Raw payload
    fn body(&self) -> &Bytes;

    /// Broker-assigned lease token
    fn lock_token(&self) -> &str;

    /// Number of times the broker has handed out this message
    fn delivery_count(&self) -> u32;

    /// Finalize the message at the broker
    async fn acknowledge(&self) -> Result<Acknowledgement, BrokerError>;
}

impl std::fmt::Debug for dyn LeasedMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeasedMessage")
            .field("lock_token", &self.lock_token())
            .field("delivery_count", &self.delivery_count())
            .field("body_len", &self.body().len())
            .finish()
    }
}
