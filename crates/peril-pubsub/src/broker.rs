//! Broker traits shared by every backend.
//!
//! The topology declarer, publisher and subscription engine only talk to a
//! broker through [`BrokerConnection`] and [`BrokerChannel`]. Concrete
//! backends live in [`crate::providers`].

use crate::error::BrokerError;
use crate::message::MessageProperties;
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[cfg(test)]
#[path = "broker_tests.rs"]
mod tests;

/// Queue argument naming the exchange that receives rejected messages
pub const DEAD_LETTER_EXCHANGE_ARG: &str = "x-dead-letter-exchange";

/// Exchange routing strategies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExchangeKind {
    /// Exact routing-key match
    Direct,
    /// Dot-segmented pattern match with `*` and `#` wildcards
    Topic,
    /// Every bound queue, routing key ignored
    Fanout,
}

impl ExchangeKind {
    /// Protocol name of the exchange type
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::Topic => "topic",
            Self::Fanout => "fanout",
        }
    }
}

impl std::fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Optional `x-` arguments attached to a queue declaration
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct QueueArguments {
    /// Exchange that receives messages rejected without requeue
    pub dead_letter_exchange: Option<String>,
}

impl QueueArguments {
    /// Arguments as `(name, value)` pairs in protocol form
    pub fn entries(&self) -> Vec<(&'static str, &str)> {
        let mut entries = Vec::new();
        if let Some(dlx) = &self.dead_letter_exchange {
            entries.push((DEAD_LETTER_EXCHANGE_ARG, dlx.as_str()));
        }
        entries
    }
}

/// Flags and arguments for a queue declaration
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct QueueOptions {
    /// Survives a broker restart
    pub durable: bool,
    /// Usable only by the declaring connection, deleted when it closes
    pub exclusive: bool,
    /// Deleted once the last consumer goes away
    pub auto_delete: bool,
    /// Extra arguments
    pub arguments: QueueArguments,
}

/// Broker answer to a queue declaration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeclaredQueue {
    pub name: String,
    pub message_count: u32,
    pub consumer_count: u32,
}

/// Resolves one delivery against the broker
#[async_trait]
pub trait DeliveryAcker: Send + Sync {
    /// Accept the delivery and remove it from the queue
    async fn ack(&self) -> Result<(), BrokerError>;

    /// Reject the delivery, optionally putting it back on the queue
    async fn nack(&self, requeue: bool) -> Result<(), BrokerError>;
}

/// One broker-to-consumer message instance awaiting ack or reject
pub struct Delivery {
    /// Channel-scoped delivery tag
    pub delivery_tag: u64,
    /// Exchange the message was published to
    pub exchange: String,
    /// Routing key the message was published with
    pub routing_key: String,
    /// Whether the broker delivered this message before
    pub redelivered: bool,
    /// Raw payload
    pub body: Bytes,
    /// Publisher properties
    pub properties: MessageProperties,
    acker: Box<dyn DeliveryAcker>,
}

impl Delivery {
    /// Create a delivery resolved through `acker`
    pub fn new(
        delivery_tag: u64,
        exchange: String,
        routing_key: String,
        redelivered: bool,
        body: Bytes,
        properties: MessageProperties,
        acker: Box<dyn DeliveryAcker>,
    ) -> Self {
        Self {
            delivery_tag,
            exchange,
            routing_key,
            redelivered,
            body,
            properties,
            acker,
        }
    }

    /// Acknowledge the delivery
    pub async fn ack(&self) -> Result<(), BrokerError> {
        self.acker.ack().await
    }

    /// Reject the delivery
    pub async fn nack(&self, requeue: bool) -> Result<(), BrokerError> {
        self.acker.nack(requeue).await
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("delivery_tag", &self.delivery_tag)
            .field("exchange", &self.exchange)
            .field("routing_key", &self.routing_key)
            .field("redelivered", &self.redelivered)
            .field("body_len", &self.body.len())
            .finish()
    }
}

/// Stream of deliveries for one consumer; ends when its channel closes
pub type DeliveryStream = BoxStream<'static, Result<Delivery, BrokerError>>;

/// A broker connection able to open channels
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    /// Open a new channel owned by the caller
    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>, BrokerError>;
}

/// A single broker channel
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// Declare an exchange; idempotent for identical parameters
    async fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        durable: bool,
    ) -> Result<(), BrokerError>;

    /// Declare a queue; idempotent for identical options
    async fn declare_queue(
        &self,
        name: &str,
        options: &QueueOptions,
    ) -> Result<DeclaredQueue, BrokerError>;

    /// Bind a queue to an exchange with a routing key or pattern
    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError>;

    /// Limit unacknowledged deliveries outstanding per consumer
    async fn set_prefetch(&self, count: u16) -> Result<(), BrokerError>;

    /// Start a manual-ack consumer on a queue
    async fn consume(&self, queue: &str, consumer_tag: &str)
        -> Result<DeliveryStream, BrokerError>;

    /// Publish a message without waiting for confirmation
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: Bytes,
        properties: &MessageProperties,
    ) -> Result<(), BrokerError>;

    /// Close the channel, ending its delivery streams
    async fn close(&self) -> Result<(), BrokerError>;

    /// Check whether the channel is still usable
    fn is_open(&self) -> bool;
}
