//! Typed publishing onto an exchange.

use crate::broker::BrokerChannel;
use crate::codec::{BinaryCodec, Codec, JsonCodec};
use crate::error::PubSubError;
use crate::message::MessageProperties;
use bytes::Bytes;
use serde::Serialize;
use tracing::{debug, warn};

#[cfg(test)]
#[path = "publisher_tests.rs"]
mod tests;

/// Encode `value` with `codec` and publish it to `exchange` under `routing_key`.
///
/// Fire-and-forget: returns once the broker channel accepted the message and
/// does not wait for any consumer. A message matching no binding is dropped by
/// the broker and is not an error here.
///
/// # Errors
///
/// - [`PubSubError::Encode`] if the value cannot be encoded; nothing is sent
/// - [`PubSubError::Broker`] if the channel rejects the publish
pub async fn publish<T, C>(
    channel: &dyn BrokerChannel,
    exchange: &str,
    routing_key: &str,
    value: &T,
    codec: &C,
) -> Result<(), PubSubError>
where
    T: Serialize,
    C: Codec,
{
    let body = codec.encode(value)?;
    let properties = MessageProperties::new(codec.content_type());
    let size = body.len();

    channel
        .publish(exchange, routing_key, Bytes::from(body), &properties)
        .await
        .map_err(|error| {
            warn!(
                exchange = %exchange,
                routing_key = %routing_key,
                error = %error,
                "Publish failed"
            );
            PubSubError::Broker(error)
        })?;

    debug!(
        exchange = %exchange,
        routing_key = %routing_key,
        content_type = codec.content_type(),
        size,
        "Message published"
    );
    Ok(())
}

/// Publish `value` as JSON
pub async fn publish_json<T>(
    channel: &dyn BrokerChannel,
    exchange: &str,
    routing_key: &str,
    value: &T,
) -> Result<(), PubSubError>
where
    T: Serialize,
{
    publish(channel, exchange, routing_key, value, &JsonCodec).await
}

/// Publish `value` with the binary codec
pub async fn publish_binary<T>(
    channel: &dyn BrokerChannel,
    exchange: &str,
    routing_key: &str,
    value: &T,
) -> Result<(), PubSubError>
where
    T: Serialize,
{
    publish(channel, exchange, routing_key, value, &BinaryCodec).await
}
