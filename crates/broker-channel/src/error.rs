//! Transport and channel error types.

use thiserror::Error;

/// Transport error type.
#[derive(Error, Debug)]
pub enum TransportError {
    /// AMQP client error
    #[error("AMQP error: {0}")]
    Amqp(#[from] lapin::Error),

    /// Connection failure
    #[error("Connection failed: {0}")]
    Connection(String),

    /// Channel creation failure
    #[error("Channel creation failed: {0}")]
    Channel(String),

    /// A channel retry is pending; no channel is available right now
    #[error("Channel unavailable, retry pending")]
    ChannelUnavailable,

    /// The broker refused the message (publisher confirm nack)
    #[error("Send not confirmed by broker")]
    NotConfirmed,

    /// Send failure
    #[error("Send failed: {0}")]
    Send(String),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias using TransportError.
pub type TransportResult<T> = Result<T, TransportError>;
