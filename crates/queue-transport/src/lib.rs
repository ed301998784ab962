//! # Queue Transport
//!
//! Reliable send and receive over leased-queue brokers, with throttling
//! backoff and transactional deferral. Ships with Azure Service Bus (REST)
//! and in-memory brokers.
//!
//! This library provides:
//! - A create-once cache of per-destination sender handles
//! - Bounded, linear-backoff retry of throttled sends
//! - Peek-lock receives that tolerate lease loss
//! - Sends and acknowledgments deferred until a transaction commits
//! - A versioned JSON envelope format
//!
//! ## Module Organization
//!
//! - [`error`] - Error types for all transport operations
//! - [`message`] - Queue names, message ids and envelopes
//! - [`codec`] - Envelope wire format
//! - [`broker`] - Broker client traits
//! - [`providers`] - Azure Service Bus and in-memory brokers
//! - [`registry`] - Sender handle cache
//! - [`retry`] - Retry policy and sleeping
//! - [`sender`] / [`receiver`] - Reliable send and receive
//! - [`transaction`] - Explicit transactions and enlistment
//! - [`config`] - Layered configuration
//! - [`transport`] - The `QueueTransport` facade

// Module declarations
pub mod broker;
pub mod codec;
pub mod config;
pub mod error;
pub mod message;
pub mod providers;
pub mod receiver;
pub mod registry;
pub mod retry;
pub mod sender;
pub mod transaction;
pub mod transport;

#[cfg(test)]
mod test_support;

#[cfg(test)]
#[path = "lib_tests.rs"]
mod tests;

// Re-export commonly used types at crate root for convenience
pub use broker::{
    Acknowledgement, BrokerClient, LeasedMessage, ProviderType, QueueCreation, QueueDescription,
    QueueReceiver, QueueSender,
};
pub use config::{BrokerConfig, TransportConfig};
pub use error::{BrokerError, CodecError, ConfigurationError, TransportError, ValidationError};
pub use message::{Envelope, MessageId, QueueName};
pub use providers::{AzureServiceBusBroker, InMemoryBroker};
pub use receiver::{ReceiveSettings, ReliableReceiver};
pub use registry::ClientRegistry;
pub use retry::{RetryPolicy, Sleeper, TokioSleeper};
pub use sender::ReliableSender;
pub use transaction::{EnlistmentNotification, PrepareVote, Transaction, TransactionStatus};
pub use transport::QueueTransport;
