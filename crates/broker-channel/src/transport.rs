//! Broker transport trait boundary.
//!
//! The resilience layer talks to the broker exclusively through these
//! traits; the AMQP wire protocol itself is delegated to the underlying
//! client implementation (see `amqp`).

use crate::TransportResult;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;

/// One message delivered to a consumer.
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Broker-assigned tag used to acknowledge this delivery.
    pub delivery_tag: u64,
    /// Raw message payload.
    pub payload: Vec<u8>,
}

/// Factory for broker connections.
#[async_trait]
pub trait BrokerTransport: Send + Sync {
    /// Establish a connection to the broker at `url`.
    async fn connect(&self, url: &str) -> TransportResult<Arc<dyn BrokerConnection>>;
}

/// An established broker connection.
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    /// Open a channel in confirm mode.
    async fn create_confirm_channel(&self) -> TransportResult<Arc<dyn BrokerChannel>>;

    /// Close the connection.
    async fn close(&self) -> TransportResult<()>;
}

/// A confirm-mode channel.
///
/// `send_to_queue` and `publish` resolve only once the broker confirms
/// receipt. `consume` yields `None` when the broker cancels the consumer,
/// a terminal signal for that subscription.
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    async fn declare_queue(&self, queue: &str) -> TransportResult<()>;

    async fn declare_exchange(&self, exchange: &str) -> TransportResult<()>;

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> TransportResult<()>;

    async fn send_to_queue(&self, queue: &str, payload: Vec<u8>) -> TransportResult<()>;

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: Vec<u8>,
    ) -> TransportResult<()>;

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> TransportResult<mpsc::Receiver<Option<Delivery>>>;

    async fn cancel(&self, consumer_tag: &str) -> TransportResult<()>;

    async fn ack(&self, delivery_tag: u64) -> TransportResult<()>;
}
