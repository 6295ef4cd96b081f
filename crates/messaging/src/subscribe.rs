//! Subscribe-side delivery loop and acknowledgment policy.

use broker_channel::{BrokerChannel, Delivery};
use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc::Receiver;
use tracing::{debug, error, info, warn};

/// When a consumed message is acknowledged back to the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AckPolicy {
    /// The engine never acknowledges; the caller or broker configuration
    /// is responsible.
    None,
    /// Acknowledge on successful decode, before the callback runs.
    #[default]
    Auto,
    /// Acknowledge only after the callback resolves successfully; a
    /// failing callback leaves the message unacknowledged.
    Resolve,
}

/// User callback invoked per decoded message.
pub type MessageHandler =
    Arc<dyn Fn(Value) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Run the delivery loop for one consumer until the broker cancels it.
pub(crate) fn spawn_delivery_loop(
    channel: Arc<dyn BrokerChannel>,
    mut deliveries: Receiver<Option<Delivery>>,
    ack: AckPolicy,
    handler: MessageHandler,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(item) = deliveries.recv().await {
            let Some(delivery) = item else {
                info!("consumer cancelled by broker");
                break;
            };
            handle_delivery(&channel, delivery, ack, &handler).await;
        }
        debug!("delivery loop closed");
    })
}

async fn handle_delivery(
    channel: &Arc<dyn BrokerChannel>,
    delivery: Delivery,
    ack: AckPolicy,
    handler: &MessageHandler,
) {
    let tag = delivery.delivery_tag;

    let Some(content) = decode(&delivery.payload) else {
        // Undecodable payloads skip the handler; acknowledge as if
        // handling trivially succeeded so the broker does not keep
        // redelivering them.
        debug!(delivery_tag = tag, "undecodable payload, skipping handler");
        if matches!(ack, AckPolicy::Auto | AckPolicy::Resolve) {
            ack_delivery(channel, tag).await;
        }
        return;
    };

    match ack {
        AckPolicy::Auto => {
            ack_delivery(channel, tag).await;
            run_handler(handler, content).await;
        }
        AckPolicy::Resolve => {
            if run_handler(handler, content).await {
                ack_delivery(channel, tag).await;
            } else {
                debug!(delivery_tag = tag, "leaving delivery unacknowledged");
            }
        }
        AckPolicy::None => {
            run_handler(handler, content).await;
        }
    }
}

fn decode(payload: &[u8]) -> Option<Value> {
    serde_json::from_slice(payload).ok()
}

/// Invoke the handler in its own task so a panic cannot take down the
/// delivery loop. Returns whether the handler succeeded.
async fn run_handler(handler: &MessageHandler, content: Value) -> bool {
    match tokio::spawn(handler(content)).await {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            error!(error = %e, "subscriber callback failed");
            false
        }
        Err(e) => {
            error!(error = %e, "subscriber callback panicked");
            false
        }
    }
}

async fn ack_delivery(channel: &Arc<dyn BrokerChannel>, tag: u64) {
    if let Err(e) = channel.ack(tag).await {
        warn!(delivery_tag = tag, error = %e, "failed to acknowledge delivery");
    }
}
