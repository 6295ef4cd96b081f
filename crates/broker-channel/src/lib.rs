//! Broker connection and channel resilience layer.
//!
//! This crate provides:
//! - The broker transport trait boundary (`BrokerTransport`,
//!   `BrokerConnection`, `BrokerChannel`, `Delivery`)
//! - `AmqpTransport`: the `lapin`-backed AMQP 0.9.1 implementation
//! - `ChannelClient`: connection ownership, serialized confirm-channel
//!   creation with unbounded fixed-delay retry, and confirmed
//!   produce/publish
//! - `testing::MockBroker`: an in-memory transport for tests

mod amqp;
mod client;
mod error;
pub mod testing;
mod transport;

pub use amqp::AmqpTransport;
pub use client::{ChannelClient, ChannelClientConfig, ChannelState, ConnectionState};
pub use error::{TransportError, TransportResult};
pub use transport::{BrokerChannel, BrokerConnection, BrokerTransport, Delivery};
