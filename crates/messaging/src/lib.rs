//! Resilient publish/subscribe client over an AMQP broker.
//!
//! This crate provides:
//! - `Messaging`: the facade composing the channel client, the memory and
//!   file buffer variants, and the subscribe engine
//! - `MessagingConfig`: the configuration surface (provider, broker URL,
//!   buffer variant/location, flush interval/threshold, channel retry
//!   delay)
//! - `AckPolicy`: per-subscription acknowledgment policy
//! - `logging::init`: tracing setup helper

mod client;
mod config;
mod error;
pub mod logging;
mod subscribe;

#[cfg(test)]
mod tests;

pub use client::{
    ConsumeParams, Messaging, MessagingInfo, ProduceParams, PublishParams, SubscribeParams,
};
pub use config::{BufferSettings, BufferVariant, MessagingConfig};
pub use error::{MessagingError, MessagingResult};
pub use subscribe::AckPolicy;

// Re-exported so callers can match on transport/channel state and build
// buffered send keys without depending on the component crates directly.
pub use broker_channel::{ChannelState, ConnectionState};
pub use record_store::RecordKind;
