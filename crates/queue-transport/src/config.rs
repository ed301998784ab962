//! Transport configuration.
//!
//! Sources (applied in order, later sources override earlier ones):
//!  1. `./config/transport.yaml` (optional)
//!  2. An explicit file passed to [`TransportConfig::load`] (required when given)
//!  3. Environment variables prefixed `QT__` with a double-underscore
//!     separator, e.g. `QT__RETRY__MAX_DELIVERY_COUNT=3`
//!
//! Every field carries a serde default, so an unconfigured environment yields
//! a usable in-memory configuration.

use crate::broker::{BrokerClient, QueueDescription};
use crate::error::{ConfigurationError, TransportError, ValidationError};
use crate::message::QueueName;
use crate::providers::{AzureServiceBusBroker, AzureServiceBusConfig, InMemoryBroker, InMemoryConfig};
use crate::receiver::ReceiveSettings;
use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;

/// Environment variable prefix for configuration overrides
pub const ENV_PREFIX: &str = "QT";

/// Default message time-to-live for provisioned queues, in milliseconds
///
/// Roughly 2,900 years, so messages effectively never expire.
pub const DEFAULT_MESSAGE_TTL_MS: u64 = 92_233_720_368_547;

/// Longest receive wait or throttle backoff, in seconds
pub const MAX_RECEIVE_WAIT_SECS: u64 = 3600;

/// Top-level transport configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Queue this endpoint receives from
    pub input_queue: String,
    /// Suffix the input queue with `instance_id` so each instance owns a queue
    pub queue_per_instance: bool,
    pub instance_id: Option<String>,
    /// Additional queues this endpoint provisions on first use
    pub owned_queues: Vec<String>,
    pub queue: QueueSettings,
    pub retry: RetrySettings,
    pub receive: ReceiveConfig,
    pub broker: BrokerConfig,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            input_queue: "transport-input".to_string(),
            queue_per_instance: false,
            instance_id: None,
            owned_queues: Vec::new(),
            queue: QueueSettings::default(),
            retry: RetrySettings::default(),
            receive: ReceiveConfig::default(),
            broker: BrokerConfig::default(),
        }
    }
}

impl TransportConfig {
    /// Load configuration from files and the environment
    ///
    /// # Errors
    ///
    /// Returns `ConfigurationError::Parsing` if a source is malformed, an
    /// explicit file is missing, or a value cannot be coerced to its field.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigurationError> {
        let mut builder = config::Config::builder().add_source(
            config::File::with_name("config/transport")
                .required(false)
                .format(config::FileFormat::Yaml),
        );

        if let Some(path) = path {
            info!(path = %path.display(), "Loading configuration from explicit path");
            builder = builder.add_source(config::File::from(path).required(true));
        }

        let settings = builder
            .add_source(config::Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()
            .map_err(|e| ConfigurationError::Parsing {
                message: e.to_string(),
            })?;

        settings
            .try_deserialize()
            .map_err(|e| ConfigurationError::Parsing {
                message: e.to_string(),
            })
    }

    /// Check the configuration for values the transport cannot run with
    ///
    /// # Errors
    ///
    /// - `Validation` for an invalid queue name, a zero count/duration, or a
    ///   receive wait or throttle backoff above [`MAX_RECEIVE_WAIT_SECS`]
    /// - `Configuration` if `queue_per_instance` is set without `instance_id`
    pub fn validate(&self) -> Result<(), TransportError> {
        self.owned_queue_names()?;

        if self.retry.max_delivery_count == 0 {
            return Err(out_of_range("retry.max_delivery_count", "must be at least 1").into());
        }
        if self.queue.max_delivery_count == 0 {
            return Err(out_of_range("queue.max_delivery_count", "must be at least 1").into());
        }
        if self.queue.lock_duration_ms == 0 {
            return Err(out_of_range("queue.lock_duration_ms", "must be greater than zero").into());
        }
        if self.receive.wait_secs == 0 {
            return Err(out_of_range("receive.wait_secs", "must be greater than zero").into());
        }
        if self.receive.wait_secs > MAX_RECEIVE_WAIT_SECS {
            return Err(out_of_range("receive.wait_secs", "must be at most 3600").into());
        }
        if self.receive.throttle_backoff_secs > MAX_RECEIVE_WAIT_SECS {
            return Err(
                out_of_range("receive.throttle_backoff_secs", "must be at most 3600").into(),
            );
        }

        Ok(())
    }

    /// The input queue, individualized when `queue_per_instance` is set
    ///
    /// # Errors
    ///
    /// Returns an error if the name is invalid or `instance_id` is missing.
    pub fn effective_input_queue(&self) -> Result<QueueName, TransportError> {
        if !self.queue_per_instance {
            return Ok(QueueName::new(self.input_queue.clone())?);
        }

        let instance_id = self
            .instance_id
            .as_deref()
            .filter(|id| !id.is_empty())
            .ok_or_else(|| ConfigurationError::Missing {
                key: "instance_id".to_string(),
            })?;
        Ok(QueueName::individualize(&self.input_queue, instance_id)?)
    }

    /// Input queue followed by every additional owned queue
    pub fn owned_queue_names(&self) -> Result<Vec<QueueName>, TransportError> {
        let mut names = vec![self.effective_input_queue()?];
        for name in &self.owned_queues {
            let name = QueueName::new(name.clone())?;
            if !names.contains(&name) {
                names.push(name);
            }
        }
        Ok(names)
    }
}

fn out_of_range(field: &str, message: &str) -> ValidationError {
    ValidationError::OutOfRange {
        field: field.to_string(),
        message: message.to_string(),
    }
}

/// Settings owned queues are provisioned with
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueSettings {
    pub lock_duration_ms: u64,
    pub max_size_mb: u64,
    pub requires_duplicate_detection: bool,
    pub requires_session: bool,
    pub default_message_ttl_ms: u64,
    pub dead_lettering_on_message_expiration: bool,
    pub duplicate_detection_window_ms: u64,
    pub max_delivery_count: u32,
    pub enable_batched_operations: bool,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            lock_duration_ms: 30_000,
            max_size_mb: 1024,
            requires_duplicate_detection: false,
            requires_session: false,
            default_message_ttl_ms: DEFAULT_MESSAGE_TTL_MS,
            dead_lettering_on_message_expiration: false,
            duplicate_detection_window_ms: 600_000,
            max_delivery_count: 6,
            enable_batched_operations: false,
        }
    }
}

impl QueueSettings {
    /// Description for provisioning `name` with these settings
    pub fn to_description(&self, name: QueueName) -> QueueDescription {
        QueueDescription {
            name,
            lock_duration: Duration::from_millis(self.lock_duration_ms),
            max_size_mb: self.max_size_mb,
            requires_duplicate_detection: self.requires_duplicate_detection,
            requires_session: self.requires_session,
            default_message_ttl: Duration::from_millis(self.default_message_ttl_ms),
            dead_lettering_on_message_expiration: self.dead_lettering_on_message_expiration,
            duplicate_detection_window: Duration::from_millis(self.duplicate_detection_window_ms),
            max_delivery_count: self.max_delivery_count,
            enable_batched_operations: self.enable_batched_operations,
        }
    }
}

/// Send retry settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_delivery_count: u32,
    pub backoff_base_secs: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_delivery_count: 6,
            backoff_base_secs: 10,
        }
    }
}

impl RetrySettings {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_delivery_count,
            Duration::from_secs(self.backoff_base_secs),
        )
    }
}

/// Receive timing settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReceiveConfig {
    pub wait_secs: u64,
    pub throttle_backoff_secs: u64,
}

impl Default for ReceiveConfig {
    fn default() -> Self {
        Self {
            wait_secs: 30,
            throttle_backoff_secs: 10,
        }
    }
}

impl ReceiveConfig {
    pub fn settings(&self) -> ReceiveSettings {
        ReceiveSettings {
            wait: Duration::from_secs(self.wait_secs),
            throttle_backoff: Duration::from_secs(self.throttle_backoff_secs),
        }
    }
}

/// Broker selection, tagged by `provider`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "provider", rename_all = "snake_case")]
pub enum BrokerConfig {
    InMemory(InMemoryConfig),
    AzureServiceBus(AzureServiceBusConfig),
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self::InMemory(InMemoryConfig::default())
    }
}

impl BrokerConfig {
    /// Create the configured broker client
    ///
    /// # Errors
    ///
    /// Returns `ConfigurationError` if the Azure endpoint or credentials
    /// cannot be resolved.
    pub fn connect(&self) -> Result<Arc<dyn BrokerClient>, ConfigurationError> {
        match self {
            Self::InMemory(config) => Ok(Arc::new(InMemoryBroker::new(config.clone()))),
            Self::AzureServiceBus(config) => {
                Ok(Arc::new(AzureServiceBusBroker::new(config.clone())?))
            }
        }
    }
}
