//! Envelope types for transport operations including core domain identifiers.

use crate::error::ValidationError;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;

/// Header carrying the correlation id across serialization boundaries
pub const CORRELATION_ID_HEADER: &str = "CorrelationId";

/// Header marking a redelivered copy with the id of the original message
pub const ORIGINAL_ID_HEADER: &str = "OriginalId";

// ============================================================================
// Core Domain Identifiers
// ============================================================================

/// Validated queue name with length and character restrictions
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QueueName(String);

impl QueueName {
    /// Create new queue name with validation
    pub fn new(name: String) -> Result<Self, ValidationError> {
        // Validate length
        if name.is_empty() || name.len() > 260 {
            return Err(ValidationError::OutOfRange {
                field: "queue_name".to_string(),
                message: "must be 1-260 characters".to_string(),
            });
        }

        // Service Bus entity paths may also contain periods and slashes
        if !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '/'))
        {
            return Err(ValidationError::InvalidFormat {
                field: "queue_name".to_string(),
                message: "only ASCII alphanumeric, hyphens, underscores, periods and slashes allowed"
                    .to_string(),
            });
        }

        if name.starts_with('-') || name.ends_with('-') || name.contains("--") {
            return Err(ValidationError::InvalidFormat {
                field: "queue_name".to_string(),
                message: "no leading/trailing hyphens or consecutive hyphens".to_string(),
            });
        }

        if name.starts_with('/') || name.ends_with('/') {
            return Err(ValidationError::InvalidFormat {
                field: "queue_name".to_string(),
                message: "no leading or trailing slashes".to_string(),
            });
        }

        Ok(Self(name))
    }

    /// Create a per-instance queue name, e.g. `orders-worker-3`
    pub fn individualize(base_name: &str, instance_id: &str) -> Result<Self, ValidationError> {
        let full_name = format!("{}-{}", base_name, instance_id);
        Self::new(full_name)
    }

    /// Get queue name as string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for QueueName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for QueueName {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s.to_string())
    }
}

/// Transport-assigned identifier of a single send attempt
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(String);

impl MessageId {
    /// Generate new random message ID
    pub fn new() -> Self {
        let id = uuid::Uuid::new_v4();
        Self(id.to_string())
    }

    /// Get message ID as string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for MessageId {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(ValidationError::Required {
                field: "message_id".to_string(),
            });
        }

        Ok(Self(s.to_string()))
    }
}

// ============================================================================
// Envelope
// ============================================================================

/// The unit of transport handed over by the application bus
///
/// The `id` is owned by the transport: it is replaced on every send attempt
/// and restored from the [`ORIGINAL_ID_HEADER`] on receive. The correlation
/// id is the stable identity callers should deduplicate or correlate on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub id: MessageId,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    pub headers: HashMap<String, String>,
    pub body: Bytes,
}

impl Envelope {
    /// Create new envelope with body
    pub fn new(body: Bytes) -> Self {
        Self {
            id: MessageId::new(),
            correlation_id: None,
            reply_to: None,
            headers: HashMap::new(),
            body,
        }
    }

    /// Add correlation ID for tracking
    pub fn with_correlation_id(mut self, correlation_id: String) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }

    /// Add return address for replies
    pub fn with_reply_to(mut self, reply_to: String) -> Self {
        self.reply_to = Some(reply_to);
        self
    }

    /// Add header
    pub fn with_header(mut self, key: String, value: String) -> Self {
        self.headers.insert(key, value);
        self
    }

    /// Get the header value if present and non-empty
    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers
            .get(key)
            .map(String::as_str)
            .filter(|value| !value.is_empty())
    }

    /// Get correlation ID, treating an empty value as absent
    pub fn correlation(&self) -> Option<&str> {
        self.correlation_id
            .as_deref()
            .filter(|value| !value.is_empty())
    }
}

#[cfg(test)]
#[path = "message_tests.rs"]
mod tests;
