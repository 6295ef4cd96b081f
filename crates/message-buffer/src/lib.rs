//! Store-and-forward buffering for outbound broker sends.
//!
//! This crate provides:
//! - `Buffer`: the flush engine shared by the memory and file variants,
//!   with threshold- and interval-driven batched sends, per-key
//!   single-flight flushing, and crash recovery
//! - `BufferConfig`: flush interval and threshold settings

mod engine;
mod error;

pub use engine::{Buffer, BufferConfig};
pub use error::{BufferError, BufferResult};
