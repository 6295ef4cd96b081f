//! Persisted record model shared by the buffer variants.

use crate::{StoreError, StoreResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Destination family a record belongs to.
///
/// Queue records replay as a direct send to a named queue; topic records
/// replay as a publish to an exchange with a routing key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordKind {
    Queue,
    Topic,
}

impl RecordKind {
    /// Stable string form used in the persisted store.
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordKind::Queue => "queue",
            RecordKind::Topic => "topic",
        }
    }

    /// Parse the persisted string form.
    pub fn parse(s: &str) -> StoreResult<Self> {
        match s {
            "queue" => Ok(RecordKind::Queue),
            "topic" => Ok(RecordKind::Topic),
            other => Err(StoreError::InvalidData(format!(
                "unknown record kind: {other}"
            ))),
        }
    }
}

/// Original send parameters, kept whole so a flush can replay the send.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SendParams {
    Queue {
        queue: String,
        content: Value,
    },
    Topic {
        exchange: String,
        topic: String,
        content: Value,
    },
}

impl SendParams {
    /// Which destination family these parameters target.
    pub fn record_kind(&self) -> RecordKind {
        match self {
            SendParams::Queue { .. } => RecordKind::Queue,
            SendParams::Topic { .. } => RecordKind::Topic,
        }
    }

    /// The flush grouping key: the queue name, or `exchange-topic`
    /// (just the exchange when the topic is empty).
    pub fn flush_key(&self) -> String {
        match self {
            SendParams::Queue { queue, .. } => queue.clone(),
            SendParams::Topic {
                exchange, topic, ..
            } => {
                if topic.is_empty() {
                    exchange.clone()
                } else {
                    format!("{exchange}-{topic}")
                }
            }
        }
    }

    /// The message content to be batched into a flush.
    pub fn content(&self) -> &Value {
        match self {
            SendParams::Queue { content, .. } => content,
            SendParams::Topic { content, .. } => content,
        }
    }
}

/// A record about to be inserted.
#[derive(Debug, Clone)]
pub struct NewRecord {
    pub kind: RecordKind,
    pub key: String,
    pub params: SendParams,
}

impl NewRecord {
    /// Build a record from send parameters, deriving kind and key.
    pub fn from_params(params: SendParams) -> Self {
        Self {
            kind: params.record_kind(),
            key: params.flush_key(),
            params,
        }
    }
}

/// A record as read back from a store, with its assigned identity.
#[derive(Debug, Clone)]
pub struct StoredRecord {
    /// Store-assigned unique id, used to delete exactly the records
    /// flushed in one batch.
    pub id: i64,
    pub kind: RecordKind,
    pub key: String,
    pub params: SendParams,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_queue_params_key_is_queue_name() {
        let params = SendParams::Queue {
            queue: "jobs".to_string(),
            content: json!({"a": 1}),
        };
        assert_eq!(params.record_kind(), RecordKind::Queue);
        assert_eq!(params.flush_key(), "jobs");
    }

    #[test]
    fn test_topic_params_key_joins_exchange_and_topic() {
        let params = SendParams::Topic {
            exchange: "events".to_string(),
            topic: "orders.created".to_string(),
            content: json!({}),
        };
        assert_eq!(params.record_kind(), RecordKind::Topic);
        assert_eq!(params.flush_key(), "events-orders.created");
    }

    #[test]
    fn test_topic_params_key_omits_empty_topic() {
        let params = SendParams::Topic {
            exchange: "events".to_string(),
            topic: String::new(),
            content: json!({}),
        };
        assert_eq!(params.flush_key(), "events");
    }

    #[test]
    fn test_record_kind_parse_rejects_unknown() {
        assert!(RecordKind::parse("queue").is_ok());
        assert!(RecordKind::parse("topic").is_ok());
        assert!(RecordKind::parse("fanout").is_err());
    }
}
