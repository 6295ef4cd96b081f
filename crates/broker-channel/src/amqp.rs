//! AMQP transport backed by `lapin`.

use crate::{BrokerChannel, BrokerConnection, BrokerTransport, Delivery, TransportError,
    TransportResult};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicPublishOptions,
    ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::publisher_confirm::Confirmation;
use lapin::types::FieldTable;
use lapin::{BasicProperties, Connection, ConnectionProperties, ExchangeKind};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error};

/// Channel capacity for forwarding consumer deliveries.
const DELIVERY_CHANNEL_CAPACITY: usize = 64;

/// AMQP 0.9.1 transport.
pub struct AmqpTransport;

#[async_trait]
impl BrokerTransport for AmqpTransport {
    async fn connect(&self, url: &str) -> TransportResult<Arc<dyn BrokerConnection>> {
        let connection = Connection::connect(url, ConnectionProperties::default()).await?;
        Ok(Arc::new(AmqpConnection { connection }))
    }
}

struct AmqpConnection {
    connection: Connection,
}

#[async_trait]
impl BrokerConnection for AmqpConnection {
    async fn create_confirm_channel(&self) -> TransportResult<Arc<dyn BrokerChannel>> {
        let channel = self.connection.create_channel().await?;
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await?;
        Ok(Arc::new(AmqpChannel { channel }))
    }

    async fn close(&self) -> TransportResult<()> {
        self.connection.close(200, "closed by client").await?;
        Ok(())
    }
}

struct AmqpChannel {
    channel: lapin::Channel,
}

impl AmqpChannel {
    async fn confirmed_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: Vec<u8>,
    ) -> TransportResult<()> {
        let confirmation = self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                &payload,
                BasicProperties::default(),
            )
            .await?
            .await?;

        match confirmation {
            Confirmation::Nack(_) => Err(TransportError::NotConfirmed),
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl BrokerChannel for AmqpChannel {
    async fn declare_queue(&self, queue: &str) -> TransportResult<()> {
        self.channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;
        Ok(())
    }

    async fn declare_exchange(&self, exchange: &str) -> TransportResult<()> {
        self.channel
            .exchange_declare(
                exchange,
                ExchangeKind::Topic,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;
        Ok(())
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> TransportResult<()> {
        self.channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;
        Ok(())
    }

    async fn send_to_queue(&self, queue: &str, payload: Vec<u8>) -> TransportResult<()> {
        // Default exchange routes directly to the named queue.
        self.confirmed_publish("", queue, payload).await
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: Vec<u8>,
    ) -> TransportResult<()> {
        self.confirmed_publish(exchange, routing_key, payload).await
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> TransportResult<mpsc::Receiver<Option<Delivery>>> {
        let mut consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;

        let (tx, rx) = mpsc::channel(DELIVERY_CHANNEL_CAPACITY);
        let queue = queue.to_string();
        tokio::spawn(async move {
            while let Some(delivery) = consumer.next().await {
                match delivery {
                    Ok(delivery) => {
                        let forwarded = tx
                            .send(Some(Delivery {
                                delivery_tag: delivery.delivery_tag,
                                payload: delivery.data,
                            }))
                            .await;
                        if forwarded.is_err() {
                            debug!(queue = %queue, "delivery receiver dropped");
                            return;
                        }
                    }
                    Err(e) => {
                        error!(queue = %queue, error = %e, "consumer stream error");
                        break;
                    }
                }
            }
            // Stream end means the broker cancelled the consumer.
            let _ = tx.send(None).await;
        });

        Ok(rx)
    }

    async fn cancel(&self, consumer_tag: &str) -> TransportResult<()> {
        self.channel
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await?;
        Ok(())
    }

    async fn ack(&self, delivery_tag: u64) -> TransportResult<()> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions::default())
            .await?;
        Ok(())
    }
}
