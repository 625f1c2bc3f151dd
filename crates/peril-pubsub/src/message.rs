//! Message metadata and validated broker identifiers.

use crate::error::ValidationError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Longest queue name or routing key the AMQP short-string type can carry
const MAX_SHORT_STRING_LEN: usize = 255;

/// Queue names starting with this prefix are reserved by the broker
const RESERVED_QUEUE_PREFIX: &str = "amq.";

fn validate_short_string(field: &str, value: &str) -> Result<(), ValidationError> {
    if value.len() > MAX_SHORT_STRING_LEN {
        return Err(ValidationError::OutOfRange {
            field: field.to_string(),
            message: format!("must be at most {} bytes", MAX_SHORT_STRING_LEN),
        });
    }

    if value.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(ValidationError::InvalidFormat {
            field: field.to_string(),
            message: "whitespace and control characters are not allowed".to_string(),
        });
    }

    Ok(())
}

// ============================================================================
// Core Domain Identifiers
// ============================================================================

/// Validated queue name
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QueueName(String);

impl QueueName {
    /// Create new queue name with validation
    pub fn new(name: impl Into<String>) -> Result<Self, ValidationError> {
        let name = name.into();
        if name.is_empty() {
            return Err(ValidationError::Required {
                field: "queue_name".to_string(),
            });
        }
        validate_short_string("queue_name", &name)?;

        if name.starts_with(RESERVED_QUEUE_PREFIX) {
            return Err(ValidationError::InvalidFormat {
                field: "queue_name".to_string(),
                message: format!("the '{}' prefix is reserved", RESERVED_QUEUE_PREFIX),
            });
        }

        Ok(Self(name))
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
        Self::new(s)
    }
}

/// Validated dot-segmented routing key or binding pattern.
///
/// Binding patterns may contain `*` and `#` segments; matching them is left
/// to the broker. The empty key is valid: fanout exchanges ignore the key and
/// are conventionally bound with `""`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RoutingKey(String);

impl RoutingKey {
    /// Create new routing key with validation
    pub fn new(key: impl Into<String>) -> Result<Self, ValidationError> {
        let key = key.into();
        validate_short_string("routing_key", &key)?;
        Ok(Self(key))
    }

    /// Join a prefix and a suffix into `prefix.suffix`
    pub fn with_prefix(prefix: &str, suffix: &str) -> Result<Self, ValidationError> {
        Self::new(format!("{}.{}", prefix, suffix))
    }

    /// Get routing key as string
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Check whether the key uses topic wildcards
    pub fn is_pattern(&self) -> bool {
        self.0.split('.').any(|segment| segment == "*" || segment == "#")
    }
}

impl std::fmt::Display for RoutingKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for RoutingKey {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

/// Unique identifier stamped on every published message
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

/// Timestamp wrapper for consistent time handling
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Timestamp(DateTime<Utc>);

impl Timestamp {
    /// Create timestamp for current time
    pub fn now() -> Self {
        Self(Utc::now())
    }

    /// Create timestamp from DateTime
    pub fn from_datetime(dt: DateTime<Utc>) -> Self {
        Self(dt)
    }

    /// Create timestamp from whole seconds since the Unix epoch
    pub fn from_unix_seconds(seconds: i64) -> Option<Self> {
        DateTime::from_timestamp(seconds, 0).map(Self)
    }

    /// Get underlying DateTime
    pub fn as_datetime(&self) -> DateTime<Utc> {
        self.0
    }

    /// Whole seconds since the Unix epoch, as carried in AMQP properties
    pub fn unix_seconds(&self) -> i64 {
        self.0.timestamp()
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.to_rfc3339())
    }
}

// ============================================================================
// Message Properties
// ============================================================================

/// Broker-level properties attached to a published message
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MessageProperties {
    /// MIME type of the body, set from the codec
    pub content_type: Option<String>,
    /// Publisher-assigned message identifier
    pub message_id: Option<MessageId>,
    /// Publish time
    pub timestamp: Option<Timestamp>,
}

impl MessageProperties {
    /// Properties for a fresh publish: new message id, current time
    pub fn new(content_type: &str) -> Self {
        Self {
            content_type: Some(content_type.to_string()),
            message_id: Some(MessageId::new()),
            timestamp: Some(Timestamp::now()),
        }
    }

    /// Set content type
    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }
}

#[cfg(test)]
#[path = "message_tests.rs"]
mod tests;
