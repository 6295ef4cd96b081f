//! Messaging facade: composes the channel client, the buffer variants,
//! and the subscribe engine behind the public produce/publish/subscribe
//! surface.

use crate::config::{BufferVariant, MessagingConfig};
use crate::subscribe::{spawn_delivery_loop, AckPolicy, MessageHandler};
use crate::{MessagingError, MessagingResult};
use broker_channel::{
    AmqpTransport, BrokerChannel, BrokerTransport, ChannelClient, ChannelClientConfig,
    ChannelState, ConnectionState,
};
use message_buffer::{Buffer, BufferConfig};
use record_store::{RecordKind, SendParams};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::info;
use uuid::Uuid;

/// Parameters for `publish`.
#[derive(Debug, Clone, Default)]
pub struct PublishParams {
    pub topic: String,
    /// Exchange override; the configured exchange when unset.
    pub exchange: Option<String>,
    pub content: Value,
    /// Buffering override; the configured default variant when unset.
    pub buffer: Option<BufferVariant>,
}

/// Parameters for `produce`.
#[derive(Debug, Clone, Default)]
pub struct ProduceParams {
    pub queue: String,
    pub content: Value,
    pub buffer: Option<BufferVariant>,
}

/// Parameters for `subscribe`.
#[derive(Debug, Clone, Default)]
pub struct SubscribeParams {
    pub topic: String,
    pub exchange: Option<String>,
    /// Queue to bind; defaults to the topic name.
    pub queue: Option<String>,
    pub ack: AckPolicy,
}

/// Parameters for `consume`.
#[derive(Debug, Clone, Default)]
pub struct ConsumeParams {
    pub queue: String,
    pub ack: AckPolicy,
}

/// State snapshot for health reporting.
#[derive(Debug, Clone)]
pub struct MessagingInfo {
    pub connection: ConnectionState,
    pub channel: ChannelState,
    pub memory_pending: u64,
    pub file_pending: u64,
    pub consumers: usize,
}

/// Resilient publish/subscribe client over an AMQP broker.
pub struct Messaging {
    config: MessagingConfig,
    client: ChannelClient,
    memory: Buffer,
    file: Buffer,
    consumers: Mutex<HashMap<String, Arc<dyn BrokerChannel>>>,
}

impl Messaging {
    /// Build a client speaking AMQP to the configured broker.
    pub fn new(config: MessagingConfig) -> MessagingResult<Self> {
        Self::with_transport(Box::new(AmqpTransport), config)
    }

    /// Build a client over a custom transport implementation.
    pub fn with_transport(
        transport: Box<dyn BrokerTransport>,
        config: MessagingConfig,
    ) -> MessagingResult<Self> {
        match config.provider.as_str() {
            "amqp" | "rabbitmq" => {}
            other => {
                return Err(MessagingError::Config(format!(
                    "unsupported provider: {other}"
                )))
            }
        }

        let client = ChannelClient::new(
            transport,
            ChannelClientConfig {
                url: config.url.clone(),
                re_channel_after: Duration::from_millis(config.re_channel_after_ms),
            },
        );

        let buffer_config = BufferConfig {
            flush_interval: Duration::from_millis(config.buffer.flush_interval_ms),
            flush_threshold: config.buffer.flush_threshold,
        };
        let memory = Buffer::memory(client.clone(), buffer_config.clone());
        memory.start()?;
        let file = Buffer::file(client.clone(), buffer_config, &config.buffer.location)?;
        file.start()?;

        info!(provider = %config.provider, url = %config.url, "messaging client ready");
        Ok(Self {
            config,
            client,
            memory,
            file,
            consumers: Mutex::new(HashMap::new()),
        })
    }

    fn buffer_for(&self, variant: Option<BufferVariant>) -> Option<&Buffer> {
        match variant.unwrap_or(self.config.buffer.variant) {
            BufferVariant::None => None,
            BufferVariant::Memory => Some(&self.memory),
            BufferVariant::File => Some(&self.file),
        }
    }

    /// Publish `content` to a topic.
    ///
    /// Buffered sends resolve once the record is durably appended, even
    /// while the broker is down; unbuffered sends resolve on broker
    /// confirmation.
    pub async fn publish(&self, params: PublishParams) -> MessagingResult<()> {
        if params.topic.is_empty() {
            return Err(MessagingError::InvalidParams("empty topic".to_string()));
        }
        let exchange = params
            .exchange
            .unwrap_or_else(|| self.config.exchange.clone());

        match self.buffer_for(params.buffer) {
            None => {
                self.client
                    .publish(&exchange, &params.topic, &params.content)
                    .await?
            }
            Some(buffer) => {
                buffer
                    .append(SendParams::Topic {
                        exchange,
                        topic: params.topic,
                        content: params.content,
                    })
                    .await?
            }
        }
        Ok(())
    }

    /// Send `content` to a queue, with the same buffering contract as
    /// `publish`.
    pub async fn produce(&self, params: ProduceParams) -> MessagingResult<()> {
        if params.queue.is_empty() {
            return Err(MessagingError::InvalidParams("empty queue".to_string()));
        }

        match self.buffer_for(params.buffer) {
            None => self.client.produce(&params.queue, &params.content).await?,
            Some(buffer) => {
                buffer
                    .append(SendParams::Queue {
                        queue: params.queue,
                        content: params.content,
                    })
                    .await?
            }
        }
        Ok(())
    }

    /// Subscribe to a topic, invoking `callback` per decoded message.
    ///
    /// Returns the consumer tag, usable with `cancel`.
    pub async fn subscribe<F, Fut>(
        &self,
        params: SubscribeParams,
        callback: F,
    ) -> MessagingResult<String>
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        if params.topic.is_empty() {
            return Err(MessagingError::InvalidParams("empty topic".to_string()));
        }
        let exchange = params
            .exchange
            .unwrap_or_else(|| self.config.exchange.clone());
        let queue = params.queue.unwrap_or_else(|| params.topic.clone());

        let channel = self.client.channel().await?;
        channel.declare_exchange(&exchange).await?;
        channel.declare_queue(&queue).await?;
        channel.bind_queue(&queue, &exchange, &params.topic).await?;

        self.start_consumer(channel, &queue, params.ack, callback)
            .await
    }

    /// Consume a queue directly, without exchange binding.
    pub async fn consume<F, Fut>(
        &self,
        params: ConsumeParams,
        callback: F,
    ) -> MessagingResult<String>
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        if params.queue.is_empty() {
            return Err(MessagingError::InvalidParams("empty queue".to_string()));
        }

        let channel = self.client.channel().await?;
        channel.declare_queue(&params.queue).await?;

        self.start_consumer(channel, &params.queue, params.ack, callback)
            .await
    }

    async fn start_consumer<F, Fut>(
        &self,
        channel: Arc<dyn BrokerChannel>,
        queue: &str,
        ack: AckPolicy,
        callback: F,
    ) -> MessagingResult<String>
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let consumer_tag = format!("consumer-{}", Uuid::new_v4());
        let deliveries = channel.consume(queue, &consumer_tag).await?;
        info!(queue = %queue, consumer_tag = %consumer_tag, ack = ?ack, "consuming");

        let handler: MessageHandler = Arc::new(move |content| Box::pin(callback(content)));
        spawn_delivery_loop(channel.clone(), deliveries, ack, handler);

        self.consumers
            .lock()
            .unwrap()
            .insert(consumer_tag.clone(), channel);
        Ok(consumer_tag)
    }

    /// Cancel a running consumer by tag.
    pub async fn cancel(&self, consumer_tag: &str) -> MessagingResult<()> {
        let channel = self
            .consumers
            .lock()
            .unwrap()
            .remove(consumer_tag)
            .ok_or_else(|| MessagingError::UnknownConsumer(consumer_tag.to_string()))?;
        channel.cancel(consumer_tag).await?;
        info!(consumer_tag = %consumer_tag, "consumer cancelled");
        Ok(())
    }

    /// State snapshot for health reporting.
    pub fn info(&self) -> MessagingInfo {
        MessagingInfo {
            connection: self.client.connection_state(),
            channel: self.client.channel_state(),
            memory_pending: self.memory.pending(),
            file_pending: self.file.pending(),
            consumers: self.consumers.lock().unwrap().len(),
        }
    }

    /// Pending buffered records for one destination, by variant.
    pub fn pending(&self, variant: BufferVariant, kind: RecordKind, key: &str) -> u64 {
        match variant {
            BufferVariant::None => 0,
            BufferVariant::Memory => self.memory.pending_for(kind, key),
            BufferVariant::File => self.file.pending_for(kind, key),
        }
    }

    /// Graceful shutdown: stop buffer timers, cancel consumers, close
    /// the connection.
    pub async fn close(&self) {
        self.memory.stop();
        self.file.stop();

        let consumers: Vec<(String, Arc<dyn BrokerChannel>)> =
            self.consumers.lock().unwrap().drain().collect();
        for (tag, channel) in consumers {
            if let Err(e) = channel.cancel(&tag).await {
                tracing::warn!(consumer_tag = %tag, error = %e, "error cancelling consumer");
            }
        }

        self.client.close().await;
        info!("messaging client closed");
    }
}
