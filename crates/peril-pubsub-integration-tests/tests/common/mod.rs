//! Common test utilities for peril-pubsub integration tests
//!
//! This module provides:
//! - An in-memory broker with the application exchanges declared
//! - A recording handler that captures decoded messages
//! - Polling helpers for asserting on asynchronous consumption

use peril_pubsub::providers::memory::{InMemoryBroker, InMemoryConnection};
use peril_pubsub::routing::DEAD_LETTER_EXCHANGE;
use peril_pubsub::{
    declare_and_bind, declare_application_exchanges, AckDecision, BrokerChannel,
    BrokerConnection, DurabilityClass,
};
use futures::future::{self, Ready};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Queue bound to the dead-letter exchange
#[allow(dead_code)]
pub const DEAD_LETTER_QUEUE: &str = "peril_dlq";

// ============================================================================
// Broker fixture
// ============================================================================

/// In-memory broker plus one connection, exchanges already declared
pub struct TestBroker {
    pub broker: InMemoryBroker,
    pub connection: InMemoryConnection,
}

impl TestBroker {
    pub async fn new() -> Self {
        let broker = InMemoryBroker::new();
        let connection = broker.connect();
        declare_application_exchanges(&connection)
            .await
            .expect("declare exchanges");
        Self { broker, connection }
    }

    /// Same as [`TestBroker::new`] with a durable queue catching dead letters
    #[allow(dead_code)]
    pub async fn with_dead_letter_queue() -> Self {
        let fixture = Self::new().await;
        declare_and_bind(
            &fixture.connection,
            DEAD_LETTER_EXCHANGE,
            DEAD_LETTER_QUEUE,
            "",
            DurabilityClass::Durable,
        )
        .await
        .expect("declare dead-letter queue");
        fixture
    }

    /// Open a channel for publishing
    pub async fn publisher(&self) -> Arc<dyn BrokerChannel> {
        self.connection
            .open_channel()
            .await
            .expect("open publisher channel")
    }

    #[allow(dead_code)]
    pub fn dead_letters(&self) -> usize {
        self.broker.queue_depth(DEAD_LETTER_QUEUE).unwrap_or(0)
    }
}

// ============================================================================
// Recording handler
// ============================================================================

/// Captures every message handed to a handler built from it
pub struct Recorder<T> {
    received: Arc<Mutex<Vec<T>>>,
}

impl<T> Clone for Recorder<T> {
    fn clone(&self) -> Self {
        Self {
            received: Arc::clone(&self.received),
        }
    }
}

impl<T: Clone + Send + 'static> Recorder<T> {
    pub fn new() -> Self {
        Self {
            received: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Handler recording the message and answering `decision`
    pub fn handler(
        &self,
        decision: AckDecision,
    ) -> impl Fn(T) -> Ready<AckDecision> + Send + Sync + 'static {
        let received = Arc::clone(&self.received);
        move |message: T| {
            received.lock().unwrap().push(message);
            future::ready(decision)
        }
    }

    pub fn received(&self) -> Vec<T> {
        self.received.lock().unwrap().clone()
    }

    pub fn count(&self) -> usize {
        self.received.lock().unwrap().len()
    }
}

// ============================================================================
// Polling
// ============================================================================

/// Poll `condition` until it holds, failing the test after five seconds
pub async fn wait_until(description: &str, mut condition: impl FnMut() -> bool) {
    let reached = tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;

    assert!(reached.is_ok(), "timed out waiting for {}", description);
}
