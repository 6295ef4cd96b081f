//! In-memory mock broker for tests.
//!
//! Implements the transport traits with scriptable failures, recorded
//! sends, and hand-driven consumer deliveries so resilience behavior can
//! be exercised without a running broker.

use crate::{BrokerChannel, BrokerConnection, BrokerTransport, Delivery, TransportError,
    TransportResult};
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

/// One message the mock broker accepted.
#[derive(Debug, Clone)]
pub struct SentMessage {
    /// Destination queue for direct sends.
    pub queue: Option<String>,
    /// Destination exchange for publishes.
    pub exchange: Option<String>,
    /// Routing key for publishes.
    pub topic: Option<String>,
    pub payload: Vec<u8>,
}

impl SentMessage {
    /// Decode the payload as JSON.
    pub fn json(&self) -> serde_json::Value {
        serde_json::from_slice(&self.payload).unwrap_or(serde_json::Value::Null)
    }
}

struct MockConsumer {
    queue: String,
    consumer_tag: String,
    tx: mpsc::Sender<Option<Delivery>>,
}

#[derive(Default)]
struct MockState {
    connects: AtomicUsize,
    channels_created: AtomicUsize,
    connect_failures: AtomicUsize,
    channel_failures: AtomicUsize,
    send_failures: AtomicUsize,
    send_delay_ms: AtomicU64,
    sent: Mutex<Vec<SentMessage>>,
    acks: Mutex<Vec<u64>>,
    cancelled: Mutex<Vec<String>>,
    bindings: Mutex<Vec<(String, String, String)>>,
    consumers: Mutex<Vec<MockConsumer>>,
    next_delivery_tag: AtomicU64,
}

impl MockState {
    fn take_failure(&self, counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

/// Scriptable in-memory broker.
#[derive(Clone)]
pub struct MockBroker {
    state: Arc<MockState>,
}

impl MockBroker {
    pub fn new() -> Self {
        Self {
            state: Arc::new(MockState::default()),
        }
    }

    /// Fail the next `n` connection attempts.
    pub fn fail_connects(&self, n: usize) {
        self.state.connect_failures.store(n, Ordering::SeqCst);
    }

    /// Fail the next `n` channel creations.
    pub fn fail_channels(&self, n: usize) {
        self.state.channel_failures.store(n, Ordering::SeqCst);
    }

    /// Fail the next `n` sends (queue or topic).
    pub fn fail_sends(&self, n: usize) {
        self.state.send_failures.store(n, Ordering::SeqCst);
    }

    /// Delay every send by `delay` before it is recorded.
    pub fn set_send_delay(&self, delay: Duration) {
        self.state
            .send_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn connects(&self) -> usize {
        self.state.connects.load(Ordering::SeqCst)
    }

    pub fn channels_created(&self) -> usize {
        self.state.channels_created.load(Ordering::SeqCst)
    }

    pub fn sent(&self) -> Vec<SentMessage> {
        self.state.sent.lock().unwrap().clone()
    }

    pub fn acks(&self) -> Vec<u64> {
        self.state.acks.lock().unwrap().clone()
    }

    pub fn cancelled(&self) -> Vec<String> {
        self.state.cancelled.lock().unwrap().clone()
    }

    /// Queue/exchange/routing-key bindings declared so far.
    pub fn bindings(&self) -> Vec<(String, String, String)> {
        self.state.bindings.lock().unwrap().clone()
    }

    /// Deliver a payload to the most recent consumer on `queue`.
    /// Returns the delivery tag, or None when nothing consumes the queue.
    pub async fn deliver(&self, queue: &str, payload: Vec<u8>) -> Option<u64> {
        let tx = {
            let consumers = self.state.consumers.lock().unwrap();
            consumers
                .iter()
                .rev()
                .find(|c| c.queue == queue)
                .map(|c| c.tx.clone())
        }?;
        let tag = self.state.next_delivery_tag.fetch_add(1, Ordering::SeqCst) + 1;
        tx.send(Some(Delivery {
            delivery_tag: tag,
            payload,
        }))
        .await
        .ok()?;
        Some(tag)
    }

    /// Signal broker-side consumer cancellation on `queue` (a null
    /// delivery).
    pub async fn cancel_delivery(&self, queue: &str) {
        let tx = {
            let consumers = self.state.consumers.lock().unwrap();
            consumers
                .iter()
                .rev()
                .find(|c| c.queue == queue)
                .map(|c| c.tx.clone())
        };
        if let Some(tx) = tx {
            let _ = tx.send(None).await;
        }
    }
}

impl Default for MockBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BrokerTransport for MockBroker {
    async fn connect(&self, _url: &str) -> TransportResult<Arc<dyn BrokerConnection>> {
        self.state.connects.fetch_add(1, Ordering::SeqCst);
        if self.state.take_failure(&self.state.connect_failures) {
            return Err(TransportError::Connection(
                "forced connect failure".to_string(),
            ));
        }
        Ok(Arc::new(MockConnection {
            state: self.state.clone(),
        }))
    }
}

struct MockConnection {
    state: Arc<MockState>,
}

#[async_trait]
impl BrokerConnection for MockConnection {
    async fn create_confirm_channel(&self) -> TransportResult<Arc<dyn BrokerChannel>> {
        self.state.channels_created.fetch_add(1, Ordering::SeqCst);
        if self.state.take_failure(&self.state.channel_failures) {
            return Err(TransportError::Channel(
                "forced channel failure".to_string(),
            ));
        }
        Ok(Arc::new(MockChannel {
            state: self.state.clone(),
        }))
    }

    async fn close(&self) -> TransportResult<()> {
        Ok(())
    }
}

struct MockChannel {
    state: Arc<MockState>,
}

impl MockChannel {
    async fn record_send(&self, message: SentMessage) -> TransportResult<()> {
        let delay = self.state.send_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.state.take_failure(&self.state.send_failures) {
            return Err(TransportError::Send("forced send failure".to_string()));
        }
        self.state.sent.lock().unwrap().push(message);
        Ok(())
    }
}

#[async_trait]
impl BrokerChannel for MockChannel {
    async fn declare_queue(&self, _queue: &str) -> TransportResult<()> {
        Ok(())
    }

    async fn declare_exchange(&self, _exchange: &str) -> TransportResult<()> {
        Ok(())
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> TransportResult<()> {
        self.state.bindings.lock().unwrap().push((
            queue.to_string(),
            exchange.to_string(),
            routing_key.to_string(),
        ));
        Ok(())
    }

    async fn send_to_queue(&self, queue: &str, payload: Vec<u8>) -> TransportResult<()> {
        self.record_send(SentMessage {
            queue: Some(queue.to_string()),
            exchange: None,
            topic: None,
            payload,
        })
        .await
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: Vec<u8>,
    ) -> TransportResult<()> {
        self.record_send(SentMessage {
            queue: None,
            exchange: Some(exchange.to_string()),
            topic: Some(routing_key.to_string()),
            payload,
        })
        .await
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> TransportResult<mpsc::Receiver<Option<Delivery>>> {
        let (tx, rx) = mpsc::channel(64);
        self.state.consumers.lock().unwrap().push(MockConsumer {
            queue: queue.to_string(),
            consumer_tag: consumer_tag.to_string(),
            tx,
        });
        Ok(rx)
    }

    async fn cancel(&self, consumer_tag: &str) -> TransportResult<()> {
        self.state
            .cancelled
            .lock()
            .unwrap()
            .push(consumer_tag.to_string());
        let tx = {
            let consumers = self.state.consumers.lock().unwrap();
            consumers
                .iter()
                .find(|c| c.consumer_tag == consumer_tag)
                .map(|c| c.tx.clone())
        };
        if let Some(tx) = tx {
            let _ = tx.send(None).await;
        }
        Ok(())
    }

    async fn ack(&self, delivery_tag: u64) -> TransportResult<()> {
        self.state.acks.lock().unwrap().push(delivery_tag);
        Ok(())
    }
}
