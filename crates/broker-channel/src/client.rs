//! Channel client: connection ownership, serialized confirm-channel
//! creation, and fixed-delay channel retry.

use crate::{BrokerChannel, BrokerConnection, BrokerTransport, TransportError, TransportResult};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::sleep;
use tracing::{error, info};

/// Channel client configuration.
#[derive(Debug, Clone)]
pub struct ChannelClientConfig {
    /// Broker URL (e.g. amqp://127.0.0.1:5672).
    pub url: String,
    /// Delay before retrying a failed channel creation.
    pub re_channel_after: Duration,
}

impl Default for ChannelClientConfig {
    fn default() -> Self {
        Self {
            url: "amqp://127.0.0.1:5672".to_string(),
            re_channel_after: Duration::from_millis(2000),
        }
    }
}

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Channel lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    NoChannel,
    CreatingChannel,
    ChannelReady,
}

enum ChannelSlot {
    NoChannel,
    RetryPending,
    Ready(Arc<dyn BrokerChannel>),
}

struct ClientInner {
    transport: Box<dyn BrokerTransport>,
    config: ChannelClientConfig,
    connection: Mutex<Option<Arc<dyn BrokerConnection>>>,
    slot: Mutex<ChannelSlot>,
    connection_state: std::sync::Mutex<ConnectionState>,
    channel_state: std::sync::Mutex<ChannelState>,
}

/// Owns the broker connection and the confirm-mode channel shared by all
/// buffers and direct-send callers.
///
/// Channel acquisition is serialized: at most one creation attempt is in
/// flight, concurrent requesters share its outcome, and a failed attempt
/// schedules an unbounded fixed-delay retry while current callers fail
/// fast.
///
/// Cheap to clone; clones share the same connection and channel.
#[derive(Clone)]
pub struct ChannelClient {
    inner: Arc<ClientInner>,
}

impl ChannelClient {
    pub fn new(transport: Box<dyn BrokerTransport>, config: ChannelClientConfig) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                transport,
                config,
                connection: Mutex::new(None),
                slot: Mutex::new(ChannelSlot::NoChannel),
                connection_state: std::sync::Mutex::new(ConnectionState::Disconnected),
                channel_state: std::sync::Mutex::new(ChannelState::NoChannel),
            }),
        }
    }

    /// Current connection state.
    pub fn connection_state(&self) -> ConnectionState {
        *self.inner.connection_state.lock().unwrap()
    }

    /// Current channel state.
    pub fn channel_state(&self) -> ChannelState {
        *self.inner.channel_state.lock().unwrap()
    }

    fn set_connection_state(&self, state: ConnectionState) {
        *self.inner.connection_state.lock().unwrap() = state;
    }

    fn set_channel_state(&self, state: ChannelState) {
        *self.inner.channel_state.lock().unwrap() = state;
    }

    /// Establish (or return) the broker connection.
    ///
    /// Connection failures are reported to the caller and not retried
    /// here; retry is a channel-level concern.
    pub async fn connect(&self) -> TransportResult<Arc<dyn BrokerConnection>> {
        let mut connection = self.inner.connection.lock().await;
        if let Some(existing) = connection.as_ref() {
            return Ok(existing.clone());
        }

        self.set_connection_state(ConnectionState::Connecting);
        info!(url = %self.inner.config.url, "connecting to broker");

        match self.inner.transport.connect(&self.inner.config.url).await {
            Ok(established) => {
                self.set_connection_state(ConnectionState::Connected);
                info!("broker connection established");
                *connection = Some(established.clone());
                Ok(established)
            }
            Err(e) => {
                self.set_connection_state(ConnectionState::Disconnected);
                error!(error = %e, "broker connection failed");
                Err(e)
            }
        }
    }

    /// Return the ready confirm-mode channel, creating it if needed.
    ///
    /// On creation failure the current caller gets the error and a retry
    /// is scheduled after `re_channel_after`; callers arriving while the
    /// retry is pending fail fast with `ChannelUnavailable`.
    pub async fn channel(&self) -> TransportResult<Arc<dyn BrokerChannel>> {
        let mut slot = self.inner.slot.lock().await;
        match &*slot {
            ChannelSlot::Ready(channel) => Ok(channel.clone()),
            ChannelSlot::RetryPending => Err(TransportError::ChannelUnavailable),
            ChannelSlot::NoChannel => match self.try_create_channel().await {
                Ok(channel) => {
                    *slot = ChannelSlot::Ready(channel.clone());
                    Ok(channel)
                }
                Err(e) => {
                    *slot = ChannelSlot::RetryPending;
                    self.spawn_retry();
                    Err(e)
                }
            },
        }
    }

    async fn try_create_channel(&self) -> TransportResult<Arc<dyn BrokerChannel>> {
        self.set_channel_state(ChannelState::CreatingChannel);
        info!("creating confirm channel");

        let connection = match self.connect().await {
            Ok(connection) => connection,
            Err(e) => {
                self.set_channel_state(ChannelState::NoChannel);
                error!(
                    error = %e,
                    retry_in_ms = self.inner.config.re_channel_after.as_millis() as u64,
                    "no connection for channel creation, scheduling retry"
                );
                return Err(e);
            }
        };
        match connection.create_confirm_channel().await {
            Ok(channel) => {
                self.set_channel_state(ChannelState::ChannelReady);
                info!("confirm channel ready");
                Ok(channel)
            }
            Err(e) => {
                self.set_channel_state(ChannelState::NoChannel);
                error!(
                    error = %e,
                    retry_in_ms = self.inner.config.re_channel_after.as_millis() as u64,
                    "channel creation failed, scheduling retry"
                );
                Err(e)
            }
        }
    }

    fn spawn_retry(&self) {
        let client = self.clone();
        tokio::spawn(async move {
            loop {
                sleep(client.inner.config.re_channel_after).await;
                info!("retrying channel creation");
                let mut slot = client.inner.slot.lock().await;
                match client.try_create_channel().await {
                    Ok(channel) => {
                        *slot = ChannelSlot::Ready(channel);
                        return;
                    }
                    Err(_) => {
                        // Stays RetryPending; next attempt after the same delay.
                    }
                }
            }
        });
    }

    /// Send `content` to a queue, resolving on broker confirmation.
    pub async fn produce(&self, queue: &str, content: &Value) -> TransportResult<()> {
        let channel = self.channel().await?;
        channel.declare_queue(queue).await?;
        let payload = serde_json::to_vec(content)?;
        channel.send_to_queue(queue, payload).await
    }

    /// Publish `content` to a topic exchange, resolving on broker
    /// confirmation.
    pub async fn publish(
        &self,
        exchange: &str,
        topic: &str,
        content: &Value,
    ) -> TransportResult<()> {
        let channel = self.channel().await?;
        channel.declare_exchange(exchange).await?;
        let payload = serde_json::to_vec(content)?;
        channel.publish(exchange, topic, payload).await
    }

    /// Drop the channel and close the connection.
    pub async fn close(&self) {
        {
            let mut slot = self.inner.slot.lock().await;
            *slot = ChannelSlot::NoChannel;
        }
        self.set_channel_state(ChannelState::NoChannel);

        let mut connection = self.inner.connection.lock().await;
        if let Some(existing) = connection.take() {
            if let Err(e) = existing.close().await {
                error!(error = %e, "error closing broker connection");
            }
        }
        self.set_connection_state(ConnectionState::Disconnected);
        info!("broker connection closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockBroker;
    use serde_json::json;

    fn client(mock: &MockBroker, re_channel_after_ms: u64) -> ChannelClient {
        ChannelClient::new(
            Box::new(mock.clone()),
            ChannelClientConfig {
                url: "amqp://test".to_string(),
                re_channel_after: Duration::from_millis(re_channel_after_ms),
            },
        )
    }

    #[tokio::test]
    async fn test_connect_reuses_established_connection() {
        let mock = MockBroker::new();
        let client = client(&mock, 50);

        client.connect().await.unwrap();
        client.connect().await.unwrap();

        assert_eq!(mock.connects(), 1);
        assert_eq!(client.connection_state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_connect_failure_is_not_retried() {
        let mock = MockBroker::new();
        mock.fail_connects(1);
        let client = client(&mock, 50);

        assert!(client.connect().await.is_err());
        assert_eq!(client.connection_state(), ConnectionState::Disconnected);
        assert_eq!(mock.connects(), 1);

        // A later explicit call succeeds.
        client.connect().await.unwrap();
        assert_eq!(mock.connects(), 2);
    }

    #[tokio::test]
    async fn test_channel_is_created_once_and_reused() {
        let mock = MockBroker::new();
        let client = client(&mock, 50);

        client.channel().await.unwrap();
        client.channel().await.unwrap();

        assert_eq!(mock.channels_created(), 1);
        assert_eq!(client.channel_state(), ChannelState::ChannelReady);
    }

    #[tokio::test]
    async fn test_channel_failure_fails_caller_and_retries_once_after_delay() {
        let mock = MockBroker::new();
        mock.fail_channels(1);
        let client = client(&mock, 50);

        let err = client.channel().await.unwrap_err();
        assert!(matches!(err, TransportError::Channel(_)));
        assert_eq!(mock.channels_created(), 1);

        // While the retry is pending, callers fail fast without starting
        // another attempt.
        let err = client.channel().await.unwrap_err();
        assert!(matches!(err, TransportError::ChannelUnavailable));
        assert_eq!(mock.channels_created(), 1);

        tokio::time::sleep(Duration::from_millis(90)).await;
        assert_eq!(mock.channels_created(), 2);

        // The successful retry satisfies subsequent requests.
        client.channel().await.unwrap();
        assert_eq!(mock.channels_created(), 2);
    }

    #[tokio::test]
    async fn test_channel_retry_is_unbounded() {
        let mock = MockBroker::new();
        mock.fail_channels(3);
        let client = client(&mock, 20);

        assert!(client.channel().await.is_err());
        tokio::time::sleep(Duration::from_millis(120)).await;

        // Attempts: initial + two failed retries + one successful retry.
        assert_eq!(mock.channels_created(), 4);
        client.channel().await.unwrap();
    }

    #[tokio::test]
    async fn test_produce_sends_to_queue_with_confirmation() {
        let mock = MockBroker::new();
        let client = client(&mock, 50);

        client
            .produce("jobs", &json!({ "task": "index" }))
            .await
            .unwrap();

        let sent = mock.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].queue.as_deref(), Some("jobs"));
        assert_eq!(sent[0].json()["task"], "index");
    }

    #[tokio::test]
    async fn test_publish_sends_to_exchange_with_routing_key() {
        let mock = MockBroker::new();
        let client = client(&mock, 50);

        client
            .publish("events", "orders.created", &json!({ "id": 7 }))
            .await
            .unwrap();

        let sent = mock.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].exchange.as_deref(), Some("events"));
        assert_eq!(sent[0].topic.as_deref(), Some("orders.created"));
    }

    #[tokio::test]
    async fn test_produce_propagates_unconfirmed_send() {
        let mock = MockBroker::new();
        mock.fail_sends(1);
        let client = client(&mock, 50);

        let err = client.produce("jobs", &json!({})).await.unwrap_err();
        assert!(matches!(err, TransportError::Send(_)));
        assert!(mock.sent().is_empty());
    }
}
