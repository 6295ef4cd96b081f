//! Messaging facade error types.

use thiserror::Error;

/// Messaging error type.
#[derive(Error, Debug)]
pub enum MessagingError {
    /// Broker transport or channel error
    #[error("Transport error: {0}")]
    Transport(#[from] broker_channel::TransportError),

    /// Buffer error
    #[error("Buffer error: {0}")]
    Buffer(#[from] message_buffer::BufferError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid call parameters
    #[error("Invalid parameters: {0}")]
    InvalidParams(String),

    /// Unknown consumer tag
    #[error("Unknown consumer: {0}")]
    UnknownConsumer(String),
}

/// Result type alias using MessagingError.
pub type MessagingResult<T> = Result<T, MessagingError>;
