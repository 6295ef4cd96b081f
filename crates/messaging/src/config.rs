//! Messaging client configuration.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Default broker URL.
pub const DEFAULT_URL: &str = "amqp://127.0.0.1:5672";

/// Default topic exchange.
pub const DEFAULT_EXCHANGE: &str = "pubsub";

/// Default channel-retry delay in milliseconds.
pub const DEFAULT_RE_CHANNEL_AFTER_MS: u64 = 2000;

/// Default flush interval in milliseconds.
pub const DEFAULT_FLUSH_INTERVAL_MS: u64 = 5000;

/// Default flush threshold.
pub const DEFAULT_FLUSH_THRESHOLD: usize = 100;

/// Which buffering path a send takes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BufferVariant {
    /// Straight to the broker; resolves on broker confirmation.
    #[default]
    None,
    /// Volatile in-process buffer.
    Memory,
    /// Crash-durable file-backed buffer.
    File,
}

/// Buffer settings shared by both buffer variants.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BufferSettings {
    /// Default variant for sends that do not pick one per call.
    #[serde(default)]
    pub variant: BufferVariant,
    /// Directory holding the file buffer database.
    #[serde(default = "default_location")]
    pub location: PathBuf,
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,
    #[serde(default = "default_flush_threshold")]
    pub flush_threshold: usize,
}

fn default_location() -> PathBuf {
    std::env::temp_dir().join("messaging-buffer")
}

fn default_flush_interval_ms() -> u64 {
    DEFAULT_FLUSH_INTERVAL_MS
}

fn default_flush_threshold() -> usize {
    DEFAULT_FLUSH_THRESHOLD
}

impl Default for BufferSettings {
    fn default() -> Self {
        Self {
            variant: BufferVariant::None,
            location: default_location(),
            flush_interval_ms: DEFAULT_FLUSH_INTERVAL_MS,
            flush_threshold: DEFAULT_FLUSH_THRESHOLD,
        }
    }
}

/// Main messaging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagingConfig {
    /// Provider name; `amqp` (alias `rabbitmq`) is the supported provider.
    #[serde(default = "default_provider")]
    pub provider: String,
    /// Broker URL.
    #[serde(default = "default_url")]
    pub url: String,
    /// Default topic exchange.
    #[serde(default = "default_exchange")]
    pub exchange: String,
    /// Delay before retrying a failed channel creation.
    #[serde(default = "default_re_channel_after_ms")]
    pub re_channel_after_ms: u64,
    #[serde(default)]
    pub buffer: BufferSettings,
}

fn default_provider() -> String {
    "amqp".to_string()
}

fn default_url() -> String {
    DEFAULT_URL.to_string()
}

fn default_exchange() -> String {
    DEFAULT_EXCHANGE.to_string()
}

fn default_re_channel_after_ms() -> u64 {
    DEFAULT_RE_CHANNEL_AFTER_MS
}

impl Default for MessagingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            url: default_url(),
            exchange: default_exchange(),
            re_channel_after_ms: DEFAULT_RE_CHANNEL_AFTER_MS,
            buffer: BufferSettings::default(),
        }
    }
}
