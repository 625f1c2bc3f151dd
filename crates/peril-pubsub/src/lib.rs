//! # Peril Pub/Sub
//!
//! Typed publish/subscribe over a topic-routed message broker.
//!
//! This library provides:
//! - Queue declaration and binding with dead-letter routing
//! - JSON and binary codecs for message payloads
//! - Fire-and-forget typed publishing
//! - A subscription engine with manual ack/nack, prefetch backpressure and
//!   per-delivery error isolation
//! - An AMQP 0-9-1 backend (feature `amqp`) and an in-memory broker
//!
//! ## Module Organization
//!
//! - [`broker`] - Broker connection and channel traits
//! - [`codec`] - Payload codecs
//! - [`topology`] - Exchange and queue declaration
//! - [`publisher`] - Typed publishing
//! - [`subscriber`] - Subscriptions and handler contract
//! - [`providers`] - Broker backends
//! - [`routing`] - Exchange names, routing keys and payloads of the game
//! - [`config`] / [`telemetry`] - Configuration and logging setup
//!
//! ## Example
//!
//! ```
//! use peril_pubsub::providers::memory::InMemoryBroker;
//! use peril_pubsub::routing::{PlayingState, EXCHANGE_PERIL_TOPIC};
//! use peril_pubsub::{
//!     declare_application_exchanges, publish_json, subscribe_json, AckDecision,
//!     BrokerConnection, DurabilityClass, SubscribeOptions,
//! };
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let broker = InMemoryBroker::new();
//! let connection = broker.connect();
//! declare_application_exchanges(&connection).await?;
//!
//! let subscription = subscribe_json(
//!     &connection,
//!     EXCHANGE_PERIL_TOPIC,
//!     "pause.alice",
//!     "pause.*",
//!     DurabilityClass::Transient,
//!     SubscribeOptions::default(),
//!     |state: PlayingState| async move {
//!         println!("paused: {}", state.is_paused);
//!         AckDecision::Ack
//!     },
//! )
//! .await?;
//!
//! let channel = connection.open_channel().await?;
//! publish_json(channel.as_ref(), EXCHANGE_PERIL_TOPIC, "pause.bob", &PlayingState { is_paused: true }).await?;
//!
//! subscription.channel().close().await?;
//! subscription.closed().await;
//! # Ok(())
//! # }
//! ```

pub mod broker;
pub mod codec;
pub mod config;
pub mod error;
pub mod message;
pub mod providers;
pub mod publisher;
pub mod retry;
pub mod routing;
pub mod subscriber;
pub mod telemetry;
pub mod topology;

// Re-export commonly used types at crate root for convenience
pub use broker::{
    BrokerChannel, BrokerConnection, Delivery, DeliveryStream, ExchangeKind, QueueOptions,
};
pub use codec::{BinaryCodec, Codec, JsonCodec};
pub use config::PubSubConfig;
pub use error::{
    BrokerError, ConfigurationError, DecodeError, EncodeError, PubSubError, TopologyError,
    ValidationError,
};
pub use message::{MessageId, MessageProperties, QueueName, RoutingKey, Timestamp};
pub use publisher::{publish, publish_binary, publish_json};
pub use retry::RetryPolicy;
pub use subscriber::{
    subscribe, subscribe_binary, subscribe_json, AckDecision, MessageHandler, SubscribeOptions,
    Subscription, SubscriptionState, SubscriptionStats,
};
pub use topology::{
    declare_and_bind, declare_application_exchanges, DurabilityClass, QueueDescriptor,
};

#[cfg(test)]
#[path = "lib_tests.rs"]
mod tests;
