//! In-memory broker implementation for testing and development.
//!
//! This module provides a fully functional in-process broker that:
//! - Routes through direct, topic and fanout exchanges (plus the nameless
//!   default exchange)
//! - Honours queue durability, exclusivity and auto-delete flags
//! - Enforces per-consumer prefetch limits
//! - Requeues or dead-letters rejected deliveries
//!
//! This provider is intended for:
//! - Unit and integration testing of subscription consumers
//! - Development without a running RabbitMQ
//! - Reference behaviour for the AMQP backend

use crate::broker::{
    BrokerChannel, BrokerConnection, DeclaredQueue, Delivery, DeliveryAcker, DeliveryStream,
    ExchangeKind, QueueOptions,
};
use crate::error::BrokerError;
use crate::message::MessageProperties;
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

#[cfg(test)]
#[path = "memory_tests.rs"]
mod tests;

type ConnectionId = u64;
type ChannelId = u64;
type DeliverySender = mpsc::UnboundedSender<Result<Delivery, BrokerError>>;

/// Check whether a routing key matches a topic binding pattern.
///
/// Segments are separated by `.`; `*` matches exactly one segment and `#`
/// matches zero or more.
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    matches_segments(&pattern, &key)
}

fn matches_segments(pattern: &[&str], key: &[&str]) -> bool {
    match pattern.split_first() {
        None => key.is_empty(),
        Some((&"#", rest)) => (0..=key.len()).any(|skip| matches_segments(rest, &key[skip..])),
        Some((&"*", rest)) => !key.is_empty() && matches_segments(rest, &key[1..]),
        Some((segment, rest)) => {
            key.first() == Some(segment) && matches_segments(rest, &key[1..])
        }
    }
}

// ============================================================================
// Internal Storage Structures
// ============================================================================

/// All broker state, guarded by one mutex
#[derive(Default)]
struct BrokerState {
    exchanges: HashMap<String, ExchangeState>,
    queues: HashMap<String, QueueState>,
    connections: HashMap<ConnectionId, HashSet<ChannelId>>,
    channels: HashMap<ChannelId, ChannelState>,
    next_connection_id: u64,
    next_channel_id: u64,
    dead_lettered: u64,
}

struct ExchangeState {
    kind: ExchangeKind,
    durable: bool,
    bindings: Vec<Binding>,
}

#[derive(Clone, PartialEq, Eq)]
struct Binding {
    queue: String,
    routing_key: String,
}

struct QueueState {
    options: QueueOptions,
    /// Owning connection of an exclusive queue
    owner: Option<ConnectionId>,
    ready: VecDeque<StoredMessage>,
    consumers: Vec<ConsumerState>,
    next_consumer: usize,
    /// Auto-delete only applies once a consumer has attached
    had_consumer: bool,
}

struct ConsumerState {
    tag: String,
    channel_id: ChannelId,
    sender: DeliverySender,
    /// Handed to ackers so pending deliveries do not keep the broker alive
    broker: Weak<Mutex<BrokerState>>,
}

struct ChannelState {
    connection_id: ConnectionId,
    prefetch: u16,
    next_delivery_tag: u64,
    unacked: BTreeMap<u64, UnackedMessage>,
}

impl ChannelState {
    fn outstanding_for(&self, consumer_tag: &str) -> usize {
        self.unacked
            .values()
            .filter(|u| u.consumer_tag == consumer_tag)
            .count()
    }
}

struct UnackedMessage {
    queue: String,
    consumer_tag: String,
    message: StoredMessage,
}

#[derive(Clone)]
struct StoredMessage {
    exchange: String,
    routing_key: String,
    body: Bytes,
    properties: MessageProperties,
    redelivered: bool,
}

fn lock_state(state: &Mutex<BrokerState>) -> MutexGuard<'_, BrokerState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

impl BrokerState {
    fn channel(&self, channel_id: ChannelId) -> Result<&ChannelState, BrokerError> {
        self.channels
            .get(&channel_id)
            .ok_or(BrokerError::ChannelClosed)
    }

    fn check_exclusive(
        &self,
        queue: &str,
        connection_id: ConnectionId,
    ) -> Result<&QueueState, BrokerError> {
        let state = self.queues.get(queue).ok_or_else(|| BrokerError::QueueNotFound {
            queue: queue.to_string(),
        })?;

        match state.owner {
            Some(owner) if owner != connection_id => Err(BrokerError::ResourceLocked {
                message: format!(
                    "cannot obtain exclusive access to locked queue '{}'",
                    queue
                ),
            }),
            _ => Ok(state),
        }
    }

    /// Route a message, returning the queues it was enqueued into
    fn route(
        &mut self,
        exchange: &str,
        routing_key: &str,
        message: StoredMessage,
    ) -> Result<Vec<String>, BrokerError> {
        let targets: Vec<String> = if exchange.is_empty() {
            self.queues
                .contains_key(routing_key)
                .then(|| routing_key.to_string())
                .into_iter()
                .collect()
        } else {
            let state = self
                .exchanges
                .get(exchange)
                .ok_or_else(|| BrokerError::ExchangeNotFound {
                    exchange: exchange.to_string(),
                })?;

            let mut seen = HashSet::new();
            state
                .bindings
                .iter()
                .filter(|b| match state.kind {
                    ExchangeKind::Direct => b.routing_key == routing_key,
                    ExchangeKind::Topic => topic_matches(&b.routing_key, routing_key),
                    ExchangeKind::Fanout => true,
                })
                .filter(|b| seen.insert(b.queue.clone()))
                .map(|b| b.queue.clone())
                .collect()
        };

        for queue in &targets {
            if let Some(state) = self.queues.get_mut(queue) {
                state.ready.push_back(message.clone());
            }
        }
        for queue in &targets {
            self.dispatch(queue);
        }

        trace!(
            exchange = %exchange,
            routing_key = %routing_key,
            matched = targets.len(),
            "Message routed"
        );
        Ok(targets)
    }

    /// Push ready messages to consumers that still have prefetch credit
    fn dispatch(&mut self, queue_name: &str) {
        let BrokerState {
            queues, channels, ..
        } = self;

        let Some(queue) = queues.get_mut(queue_name) else {
            return;
        };

        while !queue.ready.is_empty() && !queue.consumers.is_empty() {
            let count = queue.consumers.len();
            let chosen = (0..count)
                .map(|offset| (queue.next_consumer + offset) % count)
                .find(|&index| {
                    let consumer = &queue.consumers[index];
                    channels.get(&consumer.channel_id).is_some_and(|channel| {
                        channel.prefetch == 0
                            || channel.outstanding_for(&consumer.tag) < channel.prefetch as usize
                    })
                });

            let Some(index) = chosen else {
                break;
            };
            queue.next_consumer = (index + 1) % count;

            let consumer = &queue.consumers[index];
            let Some(channel) = channels.get_mut(&consumer.channel_id) else {
                break;
            };
            let Some(message) = queue.ready.pop_front() else {
                break;
            };

            channel.next_delivery_tag += 1;
            let delivery_tag = channel.next_delivery_tag;

            let delivery = Delivery::new(
                delivery_tag,
                message.exchange.clone(),
                message.routing_key.clone(),
                message.redelivered,
                message.body.clone(),
                message.properties.clone(),
                Box::new(InMemoryAcker {
                    state: consumer.broker.clone(),
                    channel_id: consumer.channel_id,
                    delivery_tag,
                }),
            );

            channel.unacked.insert(
                delivery_tag,
                UnackedMessage {
                    queue: queue_name.to_string(),
                    consumer_tag: consumer.tag.clone(),
                    message,
                },
            );

            if consumer.sender.send(Ok(delivery)).is_err() {
                // Receiver dropped: forget the consumer and put the message back
                let tag = consumer.tag.clone();
                if let Some(unacked) = channel.unacked.remove(&delivery_tag) {
                    queue.ready.push_front(unacked.message);
                }
                queue.consumers.retain(|c| c.tag != tag);
                queue.next_consumer = 0;
                debug!(queue = %queue_name, consumer = %tag, "Dropped consumer with closed stream");
            }
        }
    }

    fn dead_letter(&mut self, queue_name: &str, message: StoredMessage) {
        let dlx = self
            .queues
            .get(queue_name)
            .and_then(|q| q.options.arguments.dead_letter_exchange.clone());

        let Some(dlx) = dlx else {
            debug!(queue = %queue_name, "Rejected message dropped (no dead-letter exchange)");
            return;
        };

        let routing_key = message.routing_key.clone();
        let message = StoredMessage {
            exchange: dlx.clone(),
            redelivered: false,
            ..message
        };

        match self.route(&dlx, &routing_key, message) {
            Ok(_) => self.dead_lettered += 1,
            Err(error) => {
                warn!(queue = %queue_name, dead_letter_exchange = %dlx, error = %error, "Dead-lettering failed");
            }
        }
    }

    fn delete_queue(&mut self, queue_name: &str) {
        if self.queues.remove(queue_name).is_some() {
            for exchange in self.exchanges.values_mut() {
                exchange.bindings.retain(|b| b.queue != queue_name);
            }
            debug!(queue = %queue_name, "Queue deleted");
        }
    }

    /// Close a channel: requeue its unacked deliveries and drop its consumers
    fn close_channel(&mut self, channel_id: ChannelId) {
        let Some(channel) = self.channels.remove(&channel_id) else {
            return;
        };

        if let Some(channels) = self.connections.get_mut(&channel.connection_id) {
            channels.remove(&channel_id);
        }

        let mut touched = HashSet::new();
        for (_, unacked) in channel.unacked.into_iter().rev() {
            if let Some(queue) = self.queues.get_mut(&unacked.queue) {
                let mut message = unacked.message;
                message.redelivered = true;
                queue.ready.push_front(message);
            }
            touched.insert(unacked.queue);
        }

        let mut abandoned = Vec::new();
        for (name, queue) in self.queues.iter_mut() {
            let before = queue.consumers.len();
            queue.consumers.retain(|c| c.channel_id != channel_id);
            if queue.consumers.len() != before {
                queue.next_consumer = 0;
                touched.insert(name.clone());
            }
            if queue.options.auto_delete && queue.had_consumer && queue.consumers.is_empty() {
                abandoned.push(name.clone());
            }
        }

        for name in abandoned {
            self.delete_queue(&name);
        }
        for name in touched {
            self.dispatch(&name);
        }
    }

    fn close_connection(&mut self, connection_id: ConnectionId) {
        let Some(channels) = self.connections.remove(&connection_id) else {
            return;
        };

        for channel_id in channels {
            self.close_channel(channel_id);
        }

        let exclusive: Vec<String> = self
            .queues
            .iter()
            .filter(|(_, q)| q.owner == Some(connection_id))
            .map(|(name, _)| name.clone())
            .collect();
        for name in exclusive {
            self.delete_queue(&name);
        }
    }
}

// ============================================================================
// InMemoryBroker
// ============================================================================

/// In-process broker; cheap to clone, clones share state
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl InMemoryBroker {
    /// Create an empty broker with no exchanges or queues
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a new connection
    pub fn connect(&self) -> InMemoryConnection {
        let mut state = lock_state(&self.state);
        state.next_connection_id += 1;
        let id = state.next_connection_id;
        state.connections.insert(id, HashSet::new());

        InMemoryConnection {
            id,
            state: Arc::clone(&self.state),
        }
    }

    /// Simulate a broker restart.
    ///
    /// Every connection is dropped, non-durable queues and exchanges vanish,
    /// durable queues keep their messages (unacked ones are requeued).
    pub fn restart(&self) {
        let mut state = lock_state(&self.state);

        let connections: Vec<ConnectionId> = state.connections.keys().copied().collect();
        for connection_id in connections {
            state.close_connection(connection_id);
        }

        let transient: Vec<String> = state
            .queues
            .iter()
            .filter(|(_, q)| !q.options.durable)
            .map(|(name, _)| name.clone())
            .collect();
        for name in transient {
            state.delete_queue(&name);
        }

        state.exchanges.retain(|_, e| e.durable);
        debug!("In-memory broker restarted");
    }

    /// Number of messages ready for delivery, `None` if the queue is absent
    pub fn queue_depth(&self, queue: &str) -> Option<usize> {
        lock_state(&self.state).queues.get(queue).map(|q| q.ready.len())
    }

    /// Number of delivered but unresolved messages for a queue
    pub fn unacked_count(&self, queue: &str) -> usize {
        lock_state(&self.state)
            .channels
            .values()
            .flat_map(|c| c.unacked.values())
            .filter(|u| u.queue == queue)
            .count()
    }

    /// Number of consumers attached to a queue
    pub fn consumer_count(&self, queue: &str) -> Option<usize> {
        lock_state(&self.state)
            .queues
            .get(queue)
            .map(|q| q.consumers.len())
    }

    /// Check whether a queue exists
    pub fn queue_exists(&self, queue: &str) -> bool {
        lock_state(&self.state).queues.contains_key(queue)
    }

    /// Check whether an exchange exists
    pub fn exchange_exists(&self, exchange: &str) -> bool {
        lock_state(&self.state).exchanges.contains_key(exchange)
    }

    /// Options a queue was declared with
    pub fn queue_options(&self, queue: &str) -> Option<QueueOptions> {
        lock_state(&self.state)
            .queues
            .get(queue)
            .map(|q| q.options.clone())
    }

    /// Bodies of the ready messages in a queue, head first
    pub fn peek_messages(&self, queue: &str) -> Vec<Bytes> {
        lock_state(&self.state)
            .queues
            .get(queue)
            .map(|q| q.ready.iter().map(|m| m.body.clone()).collect())
            .unwrap_or_default()
    }

    /// Total messages rejected into an existing dead-letter exchange
    pub fn dead_lettered_count(&self) -> u64 {
        lock_state(&self.state).dead_lettered
    }

    /// Number of channels currently open across all connections
    pub fn open_channel_count(&self) -> usize {
        lock_state(&self.state).channels.len()
    }
}

// ============================================================================
// InMemoryConnection
// ============================================================================

/// A connection to an [`InMemoryBroker`]
pub struct InMemoryConnection {
    id: ConnectionId,
    state: Arc<Mutex<BrokerState>>,
}

impl InMemoryConnection {
    /// Close the connection, its channels and its exclusive queues
    pub fn close(&self) {
        lock_state(&self.state).close_connection(self.id);
    }

    /// Check whether the connection is still open
    pub fn is_open(&self) -> bool {
        lock_state(&self.state).connections.contains_key(&self.id)
    }
}

#[async_trait]
impl BrokerConnection for InMemoryConnection {
    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>, BrokerError> {
        let mut state = lock_state(&self.state);
        state.next_channel_id += 1;
        let channel_id = state.next_channel_id;

        let channels = state
            .connections
            .get_mut(&self.id)
            .ok_or(BrokerError::ConnectionClosed)?;
        channels.insert(channel_id);

        state.channels.insert(
            channel_id,
            ChannelState {
                connection_id: self.id,
                prefetch: 0,
                next_delivery_tag: 0,
                unacked: BTreeMap::new(),
            },
        );

        Ok(Arc::new(InMemoryChannel {
            id: channel_id,
            connection_id: self.id,
            state: Arc::clone(&self.state),
            closed: AtomicBool::new(false),
        }))
    }
}

// ============================================================================
// InMemoryChannel
// ============================================================================

/// A channel on an [`InMemoryConnection`]
pub struct InMemoryChannel {
    id: ChannelId,
    connection_id: ConnectionId,
    state: Arc<Mutex<BrokerState>>,
    closed: AtomicBool,
}

impl InMemoryChannel {
    fn lock_open(&self) -> Result<MutexGuard<'_, BrokerState>, BrokerError> {
        let state = lock_state(&self.state);
        state.channel(self.id)?;
        Ok(state)
    }
}

#[async_trait]
impl BrokerChannel for InMemoryChannel {
    async fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        durable: bool,
    ) -> Result<(), BrokerError> {
        let mut state = self.lock_open()?;

        match state.exchanges.get(name) {
            Some(existing) if existing.kind != kind || existing.durable != durable => {
                Err(BrokerError::PreconditionFailed {
                    message: format!(
                        "inequivalent arguments for exchange '{}': declared {} (durable={}), existing {} (durable={})",
                        name, kind, durable, existing.kind, existing.durable
                    ),
                })
            }
            Some(_) => Ok(()),
            None => {
                state.exchanges.insert(
                    name.to_string(),
                    ExchangeState {
                        kind,
                        durable,
                        bindings: Vec::new(),
                    },
                );
                Ok(())
            }
        }
    }

    async fn declare_queue(
        &self,
        name: &str,
        options: &QueueOptions,
    ) -> Result<DeclaredQueue, BrokerError> {
        let mut state = self.lock_open()?;

        if state.queues.contains_key(name) {
            let existing = state.check_exclusive(name, self.connection_id)?;
            if existing.options != *options {
                return Err(BrokerError::PreconditionFailed {
                    message: format!(
                        "inequivalent arguments for queue '{}': declared {:?}, existing {:?}",
                        name, options, existing.options
                    ),
                });
            }

            return Ok(DeclaredQueue {
                name: name.to_string(),
                message_count: existing.ready.len() as u32,
                consumer_count: existing.consumers.len() as u32,
            });
        }

        state.queues.insert(
            name.to_string(),
            QueueState {
                options: options.clone(),
                owner: options.exclusive.then_some(self.connection_id),
                ready: VecDeque::new(),
                consumers: Vec::new(),
                next_consumer: 0,
                had_consumer: false,
            },
        );

        Ok(DeclaredQueue {
            name: name.to_string(),
            message_count: 0,
            consumer_count: 0,
        })
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError> {
        let mut state = self.lock_open()?;
        state.check_exclusive(queue, self.connection_id)?;

        let exchange_state =
            state
                .exchanges
                .get_mut(exchange)
                .ok_or_else(|| BrokerError::ExchangeNotFound {
                    exchange: exchange.to_string(),
                })?;

        let binding = Binding {
            queue: queue.to_string(),
            routing_key: routing_key.to_string(),
        };
        if !exchange_state.bindings.contains(&binding) {
            exchange_state.bindings.push(binding);
        }
        Ok(())
    }

    async fn set_prefetch(&self, count: u16) -> Result<(), BrokerError> {
        let mut state = self.lock_open()?;
        if let Some(channel) = state.channels.get_mut(&self.id) {
            channel.prefetch = count;
        }
        state.dispatch_all();
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<DeliveryStream, BrokerError> {
        let mut state = self.lock_open()?;
        state.check_exclusive(queue, self.connection_id)?;

        let (sender, receiver) = mpsc::unbounded_channel();

        if let Some(queue_state) = state.queues.get_mut(queue) {
            queue_state.consumers.push(ConsumerState {
                tag: consumer_tag.to_string(),
                channel_id: self.id,
                sender,
                broker: Arc::downgrade(&self.state),
            });
            queue_state.had_consumer = true;
        }
        state.dispatch(queue);

        debug!(queue = %queue, consumer = %consumer_tag, "Consumer attached");

        let stream = futures::stream::unfold(receiver, |mut receiver| async move {
            receiver.recv().await.map(|item| (item, receiver))
        });

        Ok(stream.boxed())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: Bytes,
        properties: &MessageProperties,
    ) -> Result<(), BrokerError> {
        let mut state = self.lock_open()?;
        let message = StoredMessage {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            body: payload,
            properties: properties.clone(),
            redelivered: false,
        };
        state.route(exchange, routing_key, message)?;
        Ok(())
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.closed.store(true, Ordering::SeqCst);
        lock_state(&self.state).close_channel(self.id);
        Ok(())
    }

    fn is_open(&self) -> bool {
        !self.closed.load(Ordering::SeqCst) && lock_state(&self.state).channels.contains_key(&self.id)
    }
}

impl BrokerState {
    fn dispatch_all(&mut self) {
        let names: Vec<String> = self.queues.keys().cloned().collect();
        for name in names {
            self.dispatch(&name);
        }
    }

    fn resolve(
        &mut self,
        channel_id: ChannelId,
        delivery_tag: u64,
        outcome: Resolution,
    ) -> Result<(), BrokerError> {
        let channel = self
            .channels
            .get_mut(&channel_id)
            .ok_or(BrokerError::ChannelClosed)?;
        let unacked = channel
            .unacked
            .remove(&delivery_tag)
            .ok_or(BrokerError::UnknownDeliveryTag { delivery_tag })?;

        let queue_name = unacked.queue;
        match outcome {
            Resolution::Ack => {}
            Resolution::Requeue => {
                if let Some(queue) = self.queues.get_mut(&queue_name) {
                    let mut message = unacked.message;
                    message.redelivered = true;
                    queue.ready.push_front(message);
                }
            }
            Resolution::Discard => self.dead_letter(&queue_name, unacked.message),
        }

        self.dispatch(&queue_name);
        Ok(())
    }
}

// ============================================================================
// InMemoryAcker
// ============================================================================

enum Resolution {
    Ack,
    Requeue,
    Discard,
}

/// Resolves deliveries against the broker state without keeping it alive
struct InMemoryAcker {
    state: Weak<Mutex<BrokerState>>,
    channel_id: ChannelId,
    delivery_tag: u64,
}

impl InMemoryAcker {
    fn resolve(&self, outcome: Resolution) -> Result<(), BrokerError> {
        let state = self.state.upgrade().ok_or(BrokerError::ConnectionClosed)?;
        let mut state = lock_state(&state);
        state.resolve(self.channel_id, self.delivery_tag, outcome)
    }
}

#[async_trait]
impl DeliveryAcker for InMemoryAcker {
    async fn ack(&self) -> Result<(), BrokerError> {
        self.resolve(Resolution::Ack)
    }

    async fn nack(&self, requeue: bool) -> Result<(), BrokerError> {
        self.resolve(if requeue {
            Resolution::Requeue
        } else {
            Resolution::Discard
        })
    }
}
