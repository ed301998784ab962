//! Broker implementations.
//!
//! This module contains concrete implementations of the `BrokerClient` trait:
//! an in-process broker for tests and local runs, and Azure Service Bus over
//! its REST protocol.

pub mod azure;
pub mod memory;

pub use azure::{AzureServiceBusBroker, AzureServiceBusConfig, OnPremisesEndpoint};
pub use memory::{DeadLetteredMessage, InMemoryBroker, InMemoryConfig, QueueStats};
