//! Store-and-forward buffer engine.
//!
//! Decouples "caller wants to send" from "broker is currently reachable":
//! appended records are committed to a record store, counted per flush
//! key, and drained downstream in batches when a key reaches the flush
//! threshold or the flush interval elapses.

use crate::{BufferError, BufferResult};
use broker_channel::ChannelClient;
use record_store::{
    MemoryRecordStore, NewRecord, RecordKind, RecordStore, SendParams, SqliteRecordStore,
};
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, error, info, warn};

/// Buffer configuration.
#[derive(Debug, Clone)]
pub struct BufferConfig {
    /// Period of the background flush task.
    pub flush_interval: std::time::Duration,
    /// Per-key record count that triggers an immediate flush; also the
    /// maximum batch size read by one flush.
    pub flush_threshold: usize,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            flush_interval: std::time::Duration::from_millis(5000),
            flush_threshold: 100,
        }
    }
}

type FlushKey = (RecordKind, String);

struct BufferInner {
    store: Box<dyn RecordStore>,
    client: ChannelClient,
    config: BufferConfig,
    /// Pending-record count per flush key, kept equal to the number of
    /// not-yet-deleted records in the store for that key.
    counters: Mutex<HashMap<FlushKey, u64>>,
    /// Keys with a flush currently running.
    in_flight: Mutex<HashSet<FlushKey>>,
    timer: Mutex<Option<JoinHandle<()>>>,
}

/// A buffering variant (memory or file) sharing one flush engine.
///
/// Cheap to clone; clones share the same store, counters, and timer.
#[derive(Clone)]
pub struct Buffer {
    inner: Arc<BufferInner>,
}

impl Buffer {
    /// Volatile in-process buffer.
    pub fn memory(client: ChannelClient, config: BufferConfig) -> Self {
        Self::with_store(Box::new(MemoryRecordStore::new()), client, config)
    }

    /// Crash-durable buffer persisted under `location`.
    pub fn file(
        client: ChannelClient,
        config: BufferConfig,
        location: &Path,
    ) -> BufferResult<Self> {
        let store = SqliteRecordStore::open(location)?;
        Ok(Self::with_store(Box::new(store), client, config))
    }

    fn with_store(
        store: Box<dyn RecordStore>,
        client: ChannelClient,
        config: BufferConfig,
    ) -> Self {
        Self {
            inner: Arc::new(BufferInner {
                store,
                client,
                config,
                counters: Mutex::new(HashMap::new()),
                in_flight: Mutex::new(HashSet::new()),
                timer: Mutex::new(None),
            }),
        }
    }

    /// Run crash recovery and start the periodic flush task.
    ///
    /// Recovery scans persisted records and rebuilds the per-key counters
    /// before normal operation; records found here flush exactly like
    /// newly appended ones. Idempotent once started.
    pub fn start(&self) -> BufferResult<()> {
        let recovered = self.inner.store.pending_counts()?;
        if !recovered.is_empty() {
            let mut counters = self.inner.counters.lock().unwrap();
            let mut total = 0u64;
            for pending in recovered {
                total += pending.count;
                counters.insert((pending.kind, pending.key), pending.count);
            }
            info!(records = total, "recovered buffered records");
        }

        let mut timer = self.inner.timer.lock().unwrap();
        if timer.is_some() {
            return Ok(());
        }

        info!(
            interval_ms = self.inner.config.flush_interval.as_millis() as u64,
            "starting buffer flush task"
        );
        let buffer = self.clone();
        *timer = Some(tokio::spawn(async move {
            let mut ticker = interval(buffer.inner.config.flush_interval);
            loop {
                ticker.tick().await;
                buffer.flush_all().await;
            }
        }));
        Ok(())
    }

    /// Stop the periodic flush task. Buffered records stay in the store.
    pub fn stop(&self) {
        if let Some(task) = self.inner.timer.lock().unwrap().take() {
            task.abort();
            info!("stopped buffer flush task");
        }
    }

    /// Durably commit a record and count it toward its flush key.
    ///
    /// Resolves once the store commit succeeds; reaching the broker is
    /// the flush engine's job. A store failure propagates to the caller,
    /// the record is never silently dropped.
    pub async fn append(&self, params: SendParams) -> BufferResult<()> {
        let record = NewRecord::from_params(params);
        let kind = record.kind;
        let key = record.key.clone();

        self.inner.store.insert(record)?;

        let count = {
            let mut counters = self.inner.counters.lock().unwrap();
            let entry = counters.entry((kind, key.clone())).or_insert(0);
            *entry += 1;
            *entry
        };

        if count as usize >= self.inner.config.flush_threshold {
            let buffer = self.clone();
            tokio::spawn(async move {
                if let Err(e) = buffer.flush(kind, &key).await {
                    error!(key = %key, error = %e, "threshold flush failed");
                }
            });
        } else {
            debug!(key = %key, count, "buffered record");
        }

        Ok(())
    }

    /// Attempt a flush for every tracked key.
    pub async fn flush_all(&self) {
        let keys: Vec<FlushKey> = {
            let counters = self.inner.counters.lock().unwrap();
            counters.keys().cloned().collect()
        };
        for (kind, key) in keys {
            if let Err(e) = self.flush(kind, &key).await {
                warn!(key = %key, error = %e, "interval flush failed");
            }
        }
    }

    /// Flush up to `flush_threshold` oldest records for `(kind, key)` as
    /// one batched downstream send, deleting exactly the flushed records
    /// on confirmation.
    ///
    /// At most one flush per key runs at a time; a concurrent attempt is
    /// skipped and reports zero records. On send or delete failure the
    /// records stay put for the next trigger.
    pub async fn flush(&self, kind: RecordKind, key: &str) -> BufferResult<usize> {
        if !self.begin_flush(kind, key) {
            debug!(key = %key, "flush already in progress");
            return Ok(0);
        }
        let result = self.flush_batch(kind, key).await;
        self.end_flush(kind, key);
        result
    }

    async fn flush_batch(&self, kind: RecordKind, key: &str) -> BufferResult<usize> {
        let records = self
            .inner
            .store
            .find(kind, key, self.inner.config.flush_threshold)?;
        if records.is_empty() {
            return Ok(0);
        }

        let messages: Vec<serde_json::Value> =
            records.iter().map(|r| r.params.content().clone()).collect();
        let batch = json!({ "messages": messages });

        match kind {
            RecordKind::Queue => {
                self.inner.client.produce(key, &batch).await?;
                info!(count = records.len(), queue = %key, "produced buffered records");
            }
            RecordKind::Topic => {
                // Records sharing a key share the same exchange and topic
                // by construction.
                let SendParams::Topic {
                    exchange, topic, ..
                } = &records[0].params
                else {
                    return Err(BufferError::InvalidRecord(format!(
                        "topic record without topic params for key {key}"
                    )));
                };
                self.inner.client.publish(exchange, topic, &batch).await?;
                info!(count = records.len(), key = %key, "published buffered records");
            }
        }

        let ids: Vec<i64> = records.iter().map(|r| r.id).collect();
        let removed = self.inner.store.remove(&ids)?;
        debug!(removed, key = %key, "removed flushed records");

        let mut counters = self.inner.counters.lock().unwrap();
        if let Some(count) = counters.get_mut(&(kind, key.to_string())) {
            *count = count.saturating_sub(removed as u64);
            if *count == 0 {
                counters.remove(&(kind, key.to_string()));
            }
        }

        Ok(removed)
    }

    fn begin_flush(&self, kind: RecordKind, key: &str) -> bool {
        self.inner
            .in_flight
            .lock()
            .unwrap()
            .insert((kind, key.to_string()))
    }

    fn end_flush(&self, kind: RecordKind, key: &str) {
        self.inner
            .in_flight
            .lock()
            .unwrap()
            .remove(&(kind, key.to_string()));
    }

    /// Pending records for one flush key.
    pub fn pending_for(&self, kind: RecordKind, key: &str) -> u64 {
        self.inner
            .counters
            .lock()
            .unwrap()
            .get(&(kind, key.to_string()))
            .copied()
            .unwrap_or(0)
    }

    /// Total pending records across all keys.
    pub fn pending(&self) -> u64 {
        self.inner.counters.lock().unwrap().values().sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use broker_channel::testing::MockBroker;
    use broker_channel::ChannelClientConfig;
    use serde_json::json;
    use std::time::Duration;
    use tempfile::TempDir;

    fn channel_client(mock: &MockBroker) -> ChannelClient {
        ChannelClient::new(
            Box::new(mock.clone()),
            ChannelClientConfig {
                url: "amqp://test".to_string(),
                re_channel_after: Duration::from_millis(20),
            },
        )
    }

    fn topic_params(topic: &str, content: serde_json::Value) -> SendParams {
        SendParams::Topic {
            exchange: "events".to_string(),
            topic: topic.to_string(),
            content,
        }
    }

    fn config(interval_ms: u64, threshold: usize) -> BufferConfig {
        BufferConfig {
            flush_interval: Duration::from_millis(interval_ms),
            flush_threshold: threshold,
        }
    }

    #[tokio::test]
    async fn test_append_below_threshold_does_not_send() {
        let mock = MockBroker::new();
        let buffer = Buffer::memory(channel_client(&mock), config(60_000, 5));

        for n in 0..4 {
            buffer
                .append(topic_params("t1", json!({ "n": n })))
                .await
                .unwrap();
        }
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(mock.sent().is_empty());
        assert_eq!(buffer.pending_for(RecordKind::Topic, "events-t1"), 4);
    }

    #[tokio::test]
    async fn test_threshold_triggers_one_batched_publish() {
        let mock = MockBroker::new();
        let dir = TempDir::new().unwrap();
        let buffer =
            Buffer::file(channel_client(&mock), config(60_000, 5), dir.path()).unwrap();

        for _ in 0..5 {
            buffer
                .append(topic_params("t1", json!({ "a": 1 })))
                .await
                .unwrap();
        }
        tokio::time::sleep(Duration::from_millis(100)).await;

        let sent = mock.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].exchange.as_deref(), Some("events"));
        assert_eq!(sent[0].topic.as_deref(), Some("t1"));
        let messages = sent[0].json()["messages"].as_array().unwrap().clone();
        assert_eq!(messages.len(), 5);
        assert!(messages.iter().all(|m| m == &json!({ "a": 1 })));
        assert_eq!(buffer.pending_for(RecordKind::Topic, "events-t1"), 0);
    }

    #[tokio::test]
    async fn test_queue_records_flush_as_batched_produce_in_order() {
        let mock = MockBroker::new();
        let buffer = Buffer::memory(channel_client(&mock), config(60_000, 100));

        for n in 0..3 {
            buffer
                .append(SendParams::Queue {
                    queue: "jobs".to_string(),
                    content: json!({ "n": n }),
                })
                .await
                .unwrap();
        }
        let flushed = buffer.flush(RecordKind::Queue, "jobs").await.unwrap();
        assert_eq!(flushed, 3);

        let sent = mock.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].queue.as_deref(), Some("jobs"));
        let messages = sent[0].json()["messages"].as_array().unwrap().clone();
        let ns: Vec<u64> = messages.iter().map(|m| m["n"].as_u64().unwrap()).collect();
        assert_eq!(ns, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_interval_flush_drains_keys_below_threshold() {
        let mock = MockBroker::new();
        let buffer = Buffer::memory(channel_client(&mock), config(30, 100));
        buffer.start().unwrap();

        buffer
            .append(topic_params("t1", json!({ "n": 1 })))
            .await
            .unwrap();
        buffer
            .append(topic_params("t1", json!({ "n": 2 })))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(120)).await;
        buffer.stop();

        // Both records drained within the interval window, never twice.
        let sent = mock.sent();
        let delivered: usize = sent
            .iter()
            .map(|m| m.json()["messages"].as_array().unwrap().len())
            .sum();
        assert_eq!(delivered, 2);
        assert_eq!(buffer.pending(), 0);
    }

    #[tokio::test]
    async fn test_failed_send_keeps_records_for_next_flush() {
        let mock = MockBroker::new();
        let buffer = Buffer::memory(channel_client(&mock), config(60_000, 100));

        for n in 0..3 {
            buffer
                .append(topic_params("t1", json!({ "n": n })))
                .await
                .unwrap();
        }

        mock.fail_sends(1);
        let err = buffer.flush(RecordKind::Topic, "events-t1").await;
        assert!(err.is_err());
        assert_eq!(buffer.pending_for(RecordKind::Topic, "events-t1"), 3);

        // Next trigger drains exactly the same records, once.
        let flushed = buffer.flush(RecordKind::Topic, "events-t1").await.unwrap();
        assert_eq!(flushed, 3);
        assert_eq!(mock.sent().len(), 1);
        assert_eq!(buffer.pending_for(RecordKind::Topic, "events-t1"), 0);
    }

    #[tokio::test]
    async fn test_concurrent_flush_is_single_flight_per_key() {
        let mock = MockBroker::new();
        let buffer = Buffer::memory(channel_client(&mock), config(60_000, 100));

        for n in 0..3 {
            buffer
                .append(topic_params("t1", json!({ "n": n })))
                .await
                .unwrap();
        }

        mock.set_send_delay(Duration::from_millis(50));
        let first = buffer.clone();
        let second = buffer.clone();
        let (a, b) = tokio::join!(
            first.flush(RecordKind::Topic, "events-t1"),
            second.flush(RecordKind::Topic, "events-t1"),
        );

        let mut flushed = vec![a.unwrap(), b.unwrap()];
        flushed.sort();
        assert_eq!(flushed, vec![0, 3]);
        assert_eq!(mock.sent().len(), 1);
    }

    #[tokio::test]
    async fn test_recovery_recounts_and_flushes_persisted_records() {
        let mock = MockBroker::new();
        let dir = TempDir::new().unwrap();

        {
            let buffer =
                Buffer::file(channel_client(&mock), config(60_000, 100), dir.path()).unwrap();
            for n in 0..3 {
                buffer
                    .append(topic_params("t1", json!({ "n": n })))
                    .await
                    .unwrap();
            }
        }

        // Reinitialized buffer over the same location.
        let buffer =
            Buffer::file(channel_client(&mock), config(60_000, 100), dir.path()).unwrap();
        assert_eq!(buffer.pending_for(RecordKind::Topic, "events-t1"), 0);
        buffer.start().unwrap();
        assert_eq!(buffer.pending_for(RecordKind::Topic, "events-t1"), 3);

        let flushed = buffer.flush(RecordKind::Topic, "events-t1").await.unwrap();
        assert_eq!(flushed, 3);

        let sent = mock.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].json()["messages"].as_array().unwrap().len(), 3);
        assert_eq!(buffer.pending(), 0);
        buffer.stop();
    }

    #[tokio::test]
    async fn test_keys_flush_independently() {
        let mock = MockBroker::new();
        let buffer = Buffer::memory(channel_client(&mock), config(60_000, 2));

        buffer
            .append(topic_params("t1", json!({ "n": 1 })))
            .await
            .unwrap();
        buffer
            .append(topic_params("t2", json!({ "n": 2 })))
            .await
            .unwrap();
        buffer
            .append(topic_params("t2", json!({ "n": 3 })))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(80)).await;

        // Only t2 reached the threshold.
        let sent = mock.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].topic.as_deref(), Some("t2"));
        assert_eq!(buffer.pending_for(RecordKind::Topic, "events-t1"), 1);
        assert_eq!(buffer.pending_for(RecordKind::Topic, "events-t2"), 0);
    }
}
