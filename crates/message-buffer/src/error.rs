//! Buffer error types.

use thiserror::Error;

/// Buffer error type.
#[derive(Error, Debug)]
pub enum BufferError {
    /// Record store error
    #[error("Store error: {0}")]
    Store(#[from] record_store::StoreError),

    /// Downstream transport error
    #[error("Transport error: {0}")]
    Transport(#[from] broker_channel::TransportError),

    /// A persisted record does not match its kind
    #[error("Invalid record: {0}")]
    InvalidRecord(String),
}

/// Result type alias using BufferError.
pub type BufferResult<T> = Result<T, BufferError>;
