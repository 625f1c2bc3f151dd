//! Broker backend implementations.
//!
//! This module contains concrete implementations of the `BrokerConnection`
//! and `BrokerChannel` traits.

#[cfg(feature = "amqp")]
pub mod amqp;
pub mod memory;

#[cfg(feature = "amqp")]
pub use amqp::{AmqpChannel, AmqpConnection};
pub use memory::{InMemoryBroker, InMemoryChannel, InMemoryConnection};
