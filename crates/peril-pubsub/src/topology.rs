//! Queue and exchange declaration.
//!
//! Every queue declared here is bound to its exchange and dead-letters into
//! [`DEAD_LETTER_EXCHANGE`], so rejected messages are redirected instead of
//! silently dropped.

use crate::broker::{BrokerChannel, BrokerConnection, ExchangeKind, QueueArguments, QueueOptions};
use crate::error::{PubSubError, TopologyError};
use crate::message::{QueueName, RoutingKey};
use crate::routing::DEAD_LETTER_EXCHANGE;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};

#[cfg(test)]
#[path = "topology_tests.rs"]
mod tests;

/// Lifetime class of a declared queue, fixed at declaration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DurabilityClass {
    /// Survives broker restarts; shared, never auto-deleted
    Durable,
    /// Exclusive to the declaring connection, deleted with its last consumer
    Transient,
}

impl DurabilityClass {
    /// Queue flags and arguments implied by this class
    pub fn queue_options(&self) -> QueueOptions {
        let arguments = QueueArguments {
            dead_letter_exchange: Some(DEAD_LETTER_EXCHANGE.to_string()),
        };

        match self {
            Self::Durable => QueueOptions {
                durable: true,
                exclusive: false,
                auto_delete: false,
                arguments,
            },
            Self::Transient => QueueOptions {
                durable: false,
                exclusive: true,
                auto_delete: true,
                arguments,
            },
        }
    }
}

impl std::fmt::Display for DurabilityClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Durable => f.write_str("durable"),
            Self::Transient => f.write_str("transient"),
        }
    }
}

/// A declared and bound queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueDescriptor {
    pub name: QueueName,
    pub exchange: String,
    pub routing_key: RoutingKey,
    pub durability: DurabilityClass,
}

/// Open a channel, declare `queue_name` and bind it to `exchange`.
///
/// The returned channel is owned by the caller; the subscription engine
/// consumes from it.
///
/// # Errors
///
/// - [`PubSubError::Validation`] for an invalid queue name or routing key
/// - [`PubSubError::Topology`] when the channel cannot be opened, the queue
///   cannot be declared (e.g. durability mismatch with an existing queue) or
///   the binding fails (e.g. missing exchange)
///
/// # Example
///
/// ```rust
/// use peril_pubsub::providers::InMemoryBroker;
/// use peril_pubsub::routing::EXCHANGE_PERIL_TOPIC;
/// use peril_pubsub::{declare_and_bind, declare_application_exchanges, DurabilityClass};
///
/// # tokio_test::block_on(async {
/// let broker = InMemoryBroker::new();
/// let connection = broker.connect();
/// declare_application_exchanges(&connection).await.unwrap();
///
/// let (_channel, descriptor) = declare_and_bind(
///     &connection,
///     EXCHANGE_PERIL_TOPIC,
///     "army_moves",
///     "army_moves.*",
///     DurabilityClass::Durable,
/// )
/// .await
/// .unwrap();
///
/// assert_eq!(descriptor.name.as_str(), "army_moves");
/// assert!(broker.queue_exists("army_moves"));
/// # });
/// ```
pub async fn declare_and_bind(
    connection: &dyn BrokerConnection,
    exchange: &str,
    queue_name: &str,
    routing_key: &str,
    durability: DurabilityClass,
) -> Result<(Arc<dyn BrokerChannel>, QueueDescriptor), PubSubError> {
    let queue_name = QueueName::new(queue_name)?;
    let routing_key = RoutingKey::new(routing_key)?;

    let channel = connection
        .open_channel()
        .await
        .map_err(|source| TopologyError::ChannelOpen { source })?;

    if let Err(error) =
        declare_and_bind_on(channel.as_ref(), &queue_name, exchange, &routing_key, durability)
            .await
    {
        // The caller never sees this channel, so it must not outlive the failure
        if let Err(close_error) = channel.close().await {
            debug!(error = %close_error, "Channel close after failed declaration");
        }
        return Err(error.into());
    }

    let descriptor = QueueDescriptor {
        name: queue_name,
        exchange: exchange.to_string(),
        routing_key,
        durability,
    };

    Ok((channel, descriptor))
}

async fn declare_and_bind_on(
    channel: &dyn BrokerChannel,
    queue_name: &QueueName,
    exchange: &str,
    routing_key: &RoutingKey,
    durability: DurabilityClass,
) -> Result<(), TopologyError> {
    let declared = channel
        .declare_queue(queue_name.as_str(), &durability.queue_options())
        .await
        .map_err(|source| TopologyError::QueueDeclare {
            queue: queue_name.to_string(),
            source,
        })?;

    debug!(
        queue = %declared.name,
        message_count = declared.message_count,
        consumer_count = declared.consumer_count,
        durability = %durability,
        "Queue declared"
    );

    channel
        .bind_queue(queue_name.as_str(), exchange, routing_key.as_str())
        .await
        .map_err(|source| TopologyError::QueueBind {
            queue: queue_name.to_string(),
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            source,
        })?;

    info!(
        queue = %queue_name,
        exchange = %exchange,
        routing_key = %routing_key,
        durability = %durability,
        "Queue bound to exchange"
    );

    Ok(())
}

/// Declare an exchange on an existing channel.
pub async fn declare_exchange(
    channel: &dyn BrokerChannel,
    name: &str,
    kind: ExchangeKind,
    durable: bool,
) -> Result<(), PubSubError> {
    channel
        .declare_exchange(name, kind, durable)
        .await
        .map_err(|source| TopologyError::ExchangeDeclare {
            exchange: name.to_string(),
            source,
        })?;

    debug!(exchange = %name, kind = %kind, durable, "Exchange declared");
    Ok(())
}

/// Declare the application exchanges and the dead-letter exchange.
///
/// Both peril exchanges are durable; the dead-letter exchange is a durable
/// fanout so every queue bound to it sees every rejected message. The
/// declaring channel is closed whether or not the declarations succeed.
pub async fn declare_application_exchanges(
    connection: &dyn BrokerConnection,
) -> Result<(), PubSubError> {
    let channel = connection
        .open_channel()
        .await
        .map_err(|source| TopologyError::ChannelOpen { source })?;

    if let Err(error) = declare_application_exchanges_on(channel.as_ref()).await {
        if let Err(close_error) = channel.close().await {
            debug!(error = %close_error, "Channel close after failed exchange declaration");
        }
        return Err(error);
    }

    channel.close().await?;
    Ok(())
}

async fn declare_application_exchanges_on(channel: &dyn BrokerChannel) -> Result<(), PubSubError> {
    declare_exchange(
        channel,
        crate::routing::EXCHANGE_PERIL_DIRECT,
        ExchangeKind::Direct,
        true,
    )
    .await?;
    declare_exchange(
        channel,
        crate::routing::EXCHANGE_PERIL_TOPIC,
        ExchangeKind::Topic,
        true,
    )
    .await?;
    declare_exchange(channel, DEAD_LETTER_EXCHANGE, ExchangeKind::Fanout, true).await
}
