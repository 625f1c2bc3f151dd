//! # Subscription Engine
//!
//! Declares and binds a queue, opens a manual-ack delivery stream and runs one
//! background consumption task per subscription. Deliveries on a subscription
//! are processed strictly in order: decode, hand to the handler, resolve the
//! handler's [`AckDecision`] against the broker, then take the next one.
//!
//! A delivery that fails to decode is rejected without requeue and never
//! reaches the handler. A panicking handler counts as [`AckDecision::NackDiscard`].
//! If the ack/nack call itself keeps failing after the configured retries the
//! subscription closes its channel, which hands the unresolved delivery back to
//! the broker for redelivery, and the task ends.

use crate::broker::{BrokerChannel, BrokerConnection, Delivery, DeliveryStream};
use crate::codec::{BinaryCodec, Codec, JsonCodec};
use crate::error::{BrokerError, PubSubError};
use crate::retry::RetryPolicy;
use crate::topology::{declare_and_bind, DurabilityClass, QueueDescriptor};
use async_trait::async_trait;
use futures::{FutureExt, StreamExt};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::future::Future;
use std::marker::PhantomData;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

#[cfg(test)]
#[path = "subscriber_tests.rs"]
mod tests;

/// Default number of unacknowledged deliveries a subscription may hold
pub const DEFAULT_PREFETCH_COUNT: u16 = 10;

// ============================================================================
// Handler contract
// ============================================================================

/// Outcome a handler returns for one decoded message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AckDecision {
    /// Processed; remove the message permanently
    Ack,
    /// Not processed; make the message available for redelivery
    NackRequeue,
    /// Not processable; reject and let the broker dead-letter it
    NackDiscard,
}

impl std::fmt::Display for AckDecision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ack => f.write_str("ack"),
            Self::NackRequeue => f.write_str("nack-requeue"),
            Self::NackDiscard => f.write_str("nack-discard"),
        }
    }
}

/// Consumer of decoded messages of type `T`.
///
/// Implemented for every `Fn(T) -> impl Future<Output = AckDecision>` closure,
/// so handlers can await their own publishes. State the handler needs should
/// be moved into the closure when subscribing.
#[async_trait]
pub trait MessageHandler<T: Send + 'static>: Send + Sync + 'static {
    /// Process one message and decide how the broker should resolve it
    async fn handle(&self, message: T) -> AckDecision;
}

#[async_trait]
impl<T, F, Fut> MessageHandler<T> for F
where
    T: Send + 'static,
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = AckDecision> + Send + 'static,
{
    async fn handle(&self, message: T) -> AckDecision {
        (self)(message).await
    }
}

// ============================================================================
// Options and state
// ============================================================================

/// Per-subscription settings
#[derive(Debug, Clone, PartialEq)]
pub struct SubscribeOptions {
    /// Unacknowledged deliveries the broker may push before waiting
    pub prefetch_count: u16,

    /// Consumer tag; generated from the queue name when absent
    pub consumer_tag: Option<String>,

    /// Retries applied when an ack/nack call fails
    pub ack_retry: RetryPolicy,
}

impl Default for SubscribeOptions {
    fn default() -> Self {
        Self {
            prefetch_count: DEFAULT_PREFETCH_COUNT,
            consumer_tag: None,
            ack_retry: RetryPolicy::default(),
        }
    }
}

impl SubscribeOptions {
    pub fn with_prefetch_count(mut self, prefetch_count: u16) -> Self {
        self.prefetch_count = prefetch_count;
        self
    }

    pub fn with_consumer_tag(mut self, consumer_tag: impl Into<String>) -> Self {
        self.consumer_tag = Some(consumer_tag.into());
        self
    }

    pub fn with_ack_retry(mut self, ack_retry: RetryPolicy) -> Self {
        self.ack_retry = ack_retry;
        self
    }
}

/// Where a subscription currently is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubscriptionState {
    /// Queue declaration and binding in progress
    Declaring,
    /// Waiting for the next delivery
    Streaming,
    /// Decoding a delivery payload
    Decoding,
    /// Handler is running
    Handling,
    /// Resolving the handler decision against the broker
    Acking,
    /// Consumption task has ended; never left again
    Closed,
}

impl std::fmt::Display for SubscriptionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Declaring => "declaring",
            Self::Streaming => "streaming",
            Self::Decoding => "decoding",
            Self::Handling => "handling",
            Self::Acking => "acking",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Point-in-time copy of a subscription's counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubscriptionStats {
    /// Deliveries taken from the stream
    pub delivered: u64,
    /// Deliveries acknowledged
    pub acked: u64,
    /// Deliveries rejected with requeue
    pub requeued: u64,
    /// Deliveries rejected without requeue, decode failures included
    pub discarded: u64,
    /// Payloads that could not be decoded
    pub decode_failures: u64,
    /// Handler invocations that panicked
    pub handler_panics: u64,
    /// Deliveries whose ack/nack could not be delivered to the broker
    pub ack_failures: u64,
}

#[derive(Debug, Default)]
struct SubscriptionCounters {
    delivered: AtomicU64,
    acked: AtomicU64,
    requeued: AtomicU64,
    discarded: AtomicU64,
    decode_failures: AtomicU64,
    handler_panics: AtomicU64,
    ack_failures: AtomicU64,
}

impl SubscriptionCounters {
    fn increment(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn record_resolution(&self, decision: AckDecision) {
        match decision {
            AckDecision::Ack => Self::increment(&self.acked),
            AckDecision::NackRequeue => Self::increment(&self.requeued),
            AckDecision::NackDiscard => Self::increment(&self.discarded),
        }
    }

    fn snapshot(&self) -> SubscriptionStats {
        SubscriptionStats {
            delivered: self.delivered.load(Ordering::Relaxed),
            acked: self.acked.load(Ordering::Relaxed),
            requeued: self.requeued.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
            decode_failures: self.decode_failures.load(Ordering::Relaxed),
            handler_panics: self.handler_panics.load(Ordering::Relaxed),
            ack_failures: self.ack_failures.load(Ordering::Relaxed),
        }
    }
}

// ============================================================================
// Subscription handle
// ============================================================================

/// Handle to a running subscription.
///
/// Dropping the handle does not stop consumption. The task ends when its
/// channel (see [`Subscription::channel`]) or the connection is closed.
pub struct Subscription {
    descriptor: QueueDescriptor,
    consumer_tag: String,
    channel: Arc<dyn BrokerChannel>,
    state: watch::Receiver<SubscriptionState>,
    counters: Arc<SubscriptionCounters>,
}

impl Subscription {
    /// The declared and bound queue
    pub fn descriptor(&self) -> &QueueDescriptor {
        &self.descriptor
    }

    pub fn consumer_tag(&self) -> &str {
        &self.consumer_tag
    }

    /// The channel this subscription consumes on
    pub fn channel(&self) -> &Arc<dyn BrokerChannel> {
        &self.channel
    }

    /// Current lifecycle state
    pub fn state(&self) -> SubscriptionState {
        *self.state.borrow()
    }

    /// Receiver notified on every state transition
    pub fn watch_state(&self) -> watch::Receiver<SubscriptionState> {
        self.state.clone()
    }

    pub fn stats(&self) -> SubscriptionStats {
        self.counters.snapshot()
    }

    pub fn is_closed(&self) -> bool {
        self.state() == SubscriptionState::Closed
    }

    /// Wait until the consumption task has ended
    pub async fn closed(&self) {
        let mut state = self.state.clone();
        // An Err means the task is gone, which is closed as well
        let _ = state
            .wait_for(|current| *current == SubscriptionState::Closed)
            .await;
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("descriptor", &self.descriptor)
            .field("consumer_tag", &self.consumer_tag)
            .field("state", &self.state())
            .field("stats", &self.stats())
            .finish()
    }
}

// ============================================================================
// Subscribe
// ============================================================================

/// Subscribe `handler` to messages routed from `exchange` by `routing_key`.
///
/// Declares `queue_name` with the given durability, binds it, applies the
/// prefetch limit and opens a manual-ack delivery stream. Returns as soon as
/// the stream is open; consumption runs on a spawned task.
///
/// # Errors
///
/// - [`PubSubError::Validation`] for an invalid queue name or routing key
/// - [`PubSubError::Topology`] if declaring or binding fails
/// - [`PubSubError::Broker`] if the prefetch limit or the consumer cannot be set up
#[allow(clippy::too_many_arguments)]
pub async fn subscribe<T, C, H>(
    connection: &dyn BrokerConnection,
    exchange: &str,
    queue_name: &str,
    routing_key: &str,
    durability: DurabilityClass,
    options: SubscribeOptions,
    codec: C,
    handler: H,
) -> Result<Subscription, PubSubError>
where
    T: Serialize + DeserializeOwned + Send + 'static,
    C: Codec,
    H: MessageHandler<T>,
{
    let (state_tx, state_rx) = watch::channel(SubscriptionState::Declaring);

    let (channel, descriptor) =
        declare_and_bind(connection, exchange, queue_name, routing_key, durability).await?;

    let consumer_tag = options
        .consumer_tag
        .clone()
        .unwrap_or_else(|| format!("{}-{}", descriptor.name, Uuid::new_v4().simple()));

    let stream = match open_stream(
        channel.as_ref(),
        &descriptor,
        &consumer_tag,
        options.prefetch_count,
    )
    .await
    {
        Ok(stream) => stream,
        Err(error) => {
            // Nobody else holds this channel yet
            if let Err(close_error) = channel.close().await {
                debug!(error = %close_error, "Channel close after failed setup");
            }
            return Err(error.into());
        }
    };

    state_tx.send_replace(SubscriptionState::Streaming);

    info!(
        queue = %descriptor.name,
        exchange = %descriptor.exchange,
        routing_key = %descriptor.routing_key,
        consumer_tag = %consumer_tag,
        prefetch_count = options.prefetch_count,
        content_type = codec.content_type(),
        "Subscription started"
    );

    let counters = Arc::new(SubscriptionCounters::default());
    let consumer = Consumer {
        queue: descriptor.name.to_string(),
        consumer_tag: consumer_tag.clone(),
        channel: Arc::clone(&channel),
        codec,
        handler,
        ack_retry: options.ack_retry,
        state: state_tx,
        counters: Arc::clone(&counters),
        _message: PhantomData,
    };
    tokio::spawn(consumer.run(stream));

    Ok(Subscription {
        descriptor,
        consumer_tag,
        channel,
        state: state_rx,
        counters,
    })
}

/// Subscribe with the JSON codec
pub async fn subscribe_json<T, H>(
    connection: &dyn BrokerConnection,
    exchange: &str,
    queue_name: &str,
    routing_key: &str,
    durability: DurabilityClass,
    options: SubscribeOptions,
    handler: H,
) -> Result<Subscription, PubSubError>
where
    T: Serialize + DeserializeOwned + Send + 'static,
    H: MessageHandler<T>,
{
    subscribe(
        connection,
        exchange,
        queue_name,
        routing_key,
        durability,
        options,
        JsonCodec,
        handler,
    )
    .await
}

/// Subscribe with the binary codec
pub async fn subscribe_binary<T, H>(
    connection: &dyn BrokerConnection,
    exchange: &str,
    queue_name: &str,
    routing_key: &str,
    durability: DurabilityClass,
    options: SubscribeOptions,
    handler: H,
) -> Result<Subscription, PubSubError>
where
    T: Serialize + DeserializeOwned + Send + 'static,
    H: MessageHandler<T>,
{
    subscribe(
        connection,
        exchange,
        queue_name,
        routing_key,
        durability,
        options,
        BinaryCodec,
        handler,
    )
    .await
}

async fn open_stream(
    channel: &dyn BrokerChannel,
    descriptor: &QueueDescriptor,
    consumer_tag: &str,
    prefetch_count: u16,
) -> Result<DeliveryStream, BrokerError> {
    channel.set_prefetch(prefetch_count).await?;
    channel
        .consume(descriptor.name.as_str(), consumer_tag)
        .await
}

// ============================================================================
// Consumption task
// ============================================================================

struct Consumer<T, C, H> {
    queue: String,
    consumer_tag: String,
    channel: Arc<dyn BrokerChannel>,
    codec: C,
    handler: H,
    ack_retry: RetryPolicy,
    state: watch::Sender<SubscriptionState>,
    counters: Arc<SubscriptionCounters>,
    _message: PhantomData<fn() -> T>,
}

impl<T, C, H> Consumer<T, C, H>
where
    T: Serialize + DeserializeOwned + Send + 'static,
    C: Codec,
    H: MessageHandler<T>,
{
    async fn run(self, mut stream: DeliveryStream) {
        while let Some(next) = stream.next().await {
            let delivery = match next {
                Ok(delivery) => delivery,
                Err(error) => {
                    warn!(
                        queue = %self.queue,
                        consumer_tag = %self.consumer_tag,
                        error = %error,
                        "Delivery stream failed, closing subscription channel"
                    );
                    self.close_channel().await;
                    break;
                }
            };

            // Buffered deliveries of a closed channel were already returned to the queue
            if !self.channel.is_open() {
                debug!(
                    queue = %self.queue,
                    delivery_tag = delivery.delivery_tag,
                    "Channel closed, leaving delivery to the broker"
                );
                break;
            }

            SubscriptionCounters::increment(&self.counters.delivered);

            if !self.process(delivery).await {
                break;
            }
        }

        self.state.send_replace(SubscriptionState::Closed);
        info!(
            queue = %self.queue,
            consumer_tag = %self.consumer_tag,
            "Subscription closed"
        );
    }

    /// Fully resolve one delivery. Returns false when the subscription must stop.
    async fn process(&self, delivery: Delivery) -> bool {
        let delivery_tag = delivery.delivery_tag;

        self.state.send_replace(SubscriptionState::Decoding);
        let decision = match self.codec.decode::<T>(&delivery.body) {
            Ok(message) => {
                self.state.send_replace(SubscriptionState::Handling);
                self.invoke_handler(message, delivery_tag).await
            }
            Err(error) => {
                SubscriptionCounters::increment(&self.counters.decode_failures);
                warn!(
                    queue = %self.queue,
                    delivery_tag,
                    routing_key = %delivery.routing_key,
                    error = %error,
                    "Payload could not be decoded, discarding"
                );
                AckDecision::NackDiscard
            }
        };

        self.state.send_replace(SubscriptionState::Acking);
        match self.resolve(&delivery, decision).await {
            Ok(()) => {
                self.counters.record_resolution(decision);
                debug!(
                    queue = %self.queue,
                    delivery_tag,
                    decision = %decision,
                    "Delivery resolved"
                );
                self.state.send_replace(SubscriptionState::Streaming);
                true
            }
            Err(error) => {
                SubscriptionCounters::increment(&self.counters.ack_failures);
                error!(
                    queue = %self.queue,
                    consumer_tag = %self.consumer_tag,
                    delivery_tag,
                    decision = %decision,
                    error = %error,
                    "Delivery could not be resolved, closing subscription channel"
                );

                // Closing hands the unresolved delivery back to the broker
                self.close_channel().await;
                false
            }
        }
    }

    async fn close_channel(&self) {
        if let Err(close_error) = self.channel.close().await {
            warn!(
                queue = %self.queue,
                error = %close_error,
                "Channel close failed"
            );
        }
    }

    async fn invoke_handler(&self, message: T, delivery_tag: u64) -> AckDecision {
        match AssertUnwindSafe(self.handler.handle(message))
            .catch_unwind()
            .await
        {
            Ok(decision) => decision,
            Err(panic) => {
                SubscriptionCounters::increment(&self.counters.handler_panics);
                error!(
                    queue = %self.queue,
                    delivery_tag,
                    panic = %panic_message(panic.as_ref()),
                    "Handler panicked, discarding delivery"
                );
                AckDecision::NackDiscard
            }
        }
    }

    /// Send the decision to the broker, retrying transient failures
    async fn resolve(&self, delivery: &Delivery, decision: AckDecision) -> Result<(), PubSubError> {
        let mut delays = self.ack_retry.delays();
        let mut attempt: u32 = 1;

        loop {
            let result = match decision {
                AckDecision::Ack => delivery.ack().await,
                AckDecision::NackRequeue => delivery.nack(true).await,
                AckDecision::NackDiscard => delivery.nack(false).await,
            };

            let source = match result {
                Ok(()) => return Ok(()),
                Err(source) => source,
            };

            let delay = match delays.next() {
                Some(delay) if ack_retriable(&source) => delay,
                _ => {
                    return Err(PubSubError::AckTransport {
                        delivery_tag: delivery.delivery_tag,
                        decision,
                        source,
                    })
                }
            };

            warn!(
                queue = %self.queue,
                delivery_tag = delivery.delivery_tag,
                decision = %decision,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %source,
                "Ack call failed, retrying"
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}

/// A delivery tag is only valid on the channel that delivered it, so once that
/// channel or its connection is gone no retry can succeed.
fn ack_retriable(error: &BrokerError) -> bool {
    match error {
        BrokerError::ChannelClosed | BrokerError::ConnectionClosed => false,
        other => other.is_transient(),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&'static str>() {
        *message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.as_str()
    } else {
        "non-string panic payload"
    }
}
