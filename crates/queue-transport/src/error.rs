//! Error types for transport operations.

use std::time::Duration;
use thiserror::Error;

/// Comprehensive error type for all transport operations
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Destination queue not found: {queue}")]
    DestinationNotFound { queue: String },

    #[error("Delivery to '{queue}' exhausted after {attempts} throttled attempts")]
    DeliveryExhausted { queue: String, attempts: u32 },

    #[error("Message could not be decoded: {0}")]
    Decode(#[from] CodecError),

    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),

    #[error("Failed to provision queue '{queue}': {source}")]
    Provisioning {
        queue: String,
        #[source]
        source: BrokerError,
    },

    #[error("Transaction is no longer active")]
    TransactionInactive,

    #[error("Transaction aborted during prepare")]
    TransactionAborted,

    #[error("{failures} enlisted operation(s) failed during commit; first failure: {first}")]
    CommitFailed {
        failures: usize,
        first: Box<TransportError>,
    },

    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),
}

impl TransportError {
    /// Check if error is transient and the caller may try the operation again
    pub fn is_transient(&self) -> bool {
        match self {
            Self::DestinationNotFound { .. } => false,
            Self::DeliveryExhausted { .. } => false,
            Self::Decode(_) => false,
            Self::Broker(e) => e.is_transient(),
            Self::Provisioning { .. } => false,
            Self::TransactionInactive => false,
            Self::TransactionAborted => false,
            Self::CommitFailed { first, .. } => first.is_transient(),
            Self::Configuration(_) => false,
            Self::Validation(_) => false,
        }
    }

    /// Map a broker error raised while talking to `queue`
    pub(crate) fn from_broker(queue: &str, error: BrokerError) -> Self {
        match error {
            BrokerError::QueueNotFound { .. } => Self::DestinationNotFound {
                queue: queue.to_string(),
            },
            other => Self::Broker(other),
        }
    }
}

/// Errors reported by a broker client
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("Broker is busy: {message}")]
    Busy { message: String },

    #[error("Queue not found: {queue}")]
    QueueNotFound { queue: String },

    #[error("Connection failed: {message}")]
    ConnectionFailed { message: String },

    #[error("Authentication failed: {message}")]
    AuthenticationFailed { message: String },

    #[error("Operation timed out after {duration:?}")]
    Timeout { duration: Duration },

    #[error("Provider error ({provider}): {code} - {message}")]
    Provider {
        provider: String,
        code: String,
        message: String,
    },
}

impl BrokerError {
    /// Check if error is transient and should be retried
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Busy { .. } => true,
            Self::QueueNotFound { .. } => false,
            Self::ConnectionFailed { .. } => true,
            Self::AuthenticationFailed { .. } => false,
            Self::Timeout { .. } => true,
            Self::Provider { .. } => false,
        }
    }

    /// Check if the broker signalled throttling
    pub fn is_busy(&self) -> bool {
        matches!(self, Self::Busy { .. })
    }
}

/// Errors during envelope serialization/deserialization
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("JSON serialization failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Message body is not valid base64: {0}")]
    InvalidBody(#[from] base64::DecodeError),

    #[error("Unsupported envelope schema version {found} (expected {expected})")]
    UnsupportedVersion { found: u32, expected: u32 },

    #[error("Envelope field '{field}' is invalid: {message}")]
    InvalidField { field: String, message: String },
}

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    #[error("Missing required configuration: {key}")]
    Missing { key: String },

    #[error("Configuration parsing failed: {message}")]
    Parsing { message: String },
}

/// Validation errors
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Required field missing: {field}")]
    Required { field: String },

    #[error("Invalid format for {field}: {message}")]
    InvalidFormat { field: String, message: String },

    #[error("Value out of range for {field}: {message}")]
    OutOfRange { field: String, message: String },
}

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;
