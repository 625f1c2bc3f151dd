//! Error types for topology, codec, publish and subscription operations.

use crate::subscriber::AckDecision;
use thiserror::Error;

/// Top-level error type for all pub/sub operations
#[derive(Debug, Error)]
pub enum PubSubError {
    #[error("Topology setup failed: {0}")]
    Topology(#[from] TopologyError),

    #[error("Encoding failed: {0}")]
    Encode(#[from] EncodeError),

    #[error("Decoding failed: {0}")]
    Decode(#[from] DecodeError),

    #[error("Failed to resolve delivery {delivery_tag} as {decision}: {source}")]
    AckTransport {
        delivery_tag: u64,
        decision: AckDecision,
        #[source]
        source: BrokerError,
    },

    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),

    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),
}

impl PubSubError {
    /// Check if the error is transient and the whole operation may be retried
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Topology(e) => e.broker_error().is_transient(),
            Self::Encode(_) => false,
            Self::Decode(_) => false,
            Self::AckTransport { source, .. } => source.is_transient(),
            Self::Broker(e) => e.is_transient(),
            Self::Configuration(_) => false,
            Self::Validation(_) => false,
        }
    }
}

/// Failures while declaring queues, exchanges or bindings.
///
/// Always fatal to the setup call that produced it; never retried internally.
#[derive(Debug, Error)]
pub enum TopologyError {
    #[error("Could not open channel: {source}")]
    ChannelOpen {
        #[source]
        source: BrokerError,
    },

    #[error("Could not declare exchange '{exchange}': {source}")]
    ExchangeDeclare {
        exchange: String,
        #[source]
        source: BrokerError,
    },

    #[error("Could not declare queue '{queue}': {source}")]
    QueueDeclare {
        queue: String,
        #[source]
        source: BrokerError,
    },

    #[error("Could not bind queue '{queue}' to exchange '{exchange}' with key '{routing_key}': {source}")]
    QueueBind {
        queue: String,
        exchange: String,
        routing_key: String,
        #[source]
        source: BrokerError,
    },
}

impl TopologyError {
    /// The broker failure underneath this topology error
    pub fn broker_error(&self) -> &BrokerError {
        match self {
            Self::ChannelOpen { source }
            | Self::ExchangeDeclare { source, .. }
            | Self::QueueDeclare { source, .. }
            | Self::QueueBind { source, .. } => source,
        }
    }
}

/// Errors reported by a broker backend
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BrokerError {
    #[error("Exchange not found: {exchange}")]
    ExchangeNotFound { exchange: String },

    #[error("Queue not found: {queue}")]
    QueueNotFound { queue: String },

    #[error("Precondition failed: {message}")]
    PreconditionFailed { message: String },

    #[error("Resource locked: {message}")]
    ResourceLocked { message: String },

    #[error("Channel is closed")]
    ChannelClosed,

    #[error("Connection is closed")]
    ConnectionClosed,

    #[error("Unknown delivery tag: {delivery_tag}")]
    UnknownDeliveryTag { delivery_tag: u64 },

    #[error("Provider error ({provider}): {message}")]
    Provider { provider: String, message: String },
}

impl BrokerError {
    /// Check if error is transient and should be retried
    pub fn is_transient(&self) -> bool {
        match self {
            Self::ExchangeNotFound { .. } => false,
            Self::QueueNotFound { .. } => false,
            Self::PreconditionFailed { .. } => false,
            Self::ResourceLocked { .. } => true,
            Self::ChannelClosed => true,
            Self::ConnectionClosed => true,
            Self::UnknownDeliveryTag { .. } => false,
            Self::Provider { .. } => true,
        }
    }
}

/// Errors while turning a value into a message body
#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("JSON encoding failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Binary encoding failed: {0}")]
    Binary(#[from] bincode::Error),
}

/// Errors while turning a message body back into a value
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("Malformed JSON payload: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Malformed binary payload: {0}")]
    Binary(#[from] bincode::Error),

    #[error("Payload truncated: expected at least {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },

    #[error("Payload is not a binary frame (bad magic)")]
    BadMagic,

    #[error("Payload was produced for a different type (fingerprint {found}, expected {expected})")]
    SchemaMismatch { expected: String, found: String },

    #[error("Payload was produced with a different field layout (digest {written}, decoded as {read})")]
    LayoutMismatch { written: String, read: String },
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
