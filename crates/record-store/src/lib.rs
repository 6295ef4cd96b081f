//! Persistent record store for the store-and-forward buffer.
//!
//! This crate provides:
//! - The record data model (`RecordKind`, `SendParams`, `NewRecord`, `StoredRecord`)
//! - The `RecordStore` trait the buffer engine flushes against
//! - `MemoryRecordStore`: volatile, insertion-ordered, in-process
//! - `SqliteRecordStore`: crash-durable, file-backed via SQLite

mod error;
mod memory;
mod models;
mod sqlite;

pub use error::{StoreError, StoreResult};
pub use memory::MemoryRecordStore;
pub use models::{NewRecord, RecordKind, SendParams, StoredRecord};
pub use sqlite::SqliteRecordStore;

/// Pending-record count for one `(kind, key)` group, as re-derived from
/// the store during recovery.
#[derive(Debug, Clone)]
pub struct PendingCount {
    pub kind: RecordKind,
    pub key: String,
    pub count: u64,
}

/// Ordered store of not-yet-flushed records.
///
/// Implementations keep records in insertion order per `(kind, key)` so a
/// flush always drains oldest-first. A record inserted here is owned by the
/// store until `remove` deletes it after a confirmed downstream send.
pub trait RecordStore: Send + Sync {
    /// Durably commit a record, returning its assigned id.
    fn insert(&self, record: NewRecord) -> StoreResult<i64>;

    /// Read up to `limit` oldest records for `(kind, key)`.
    fn find(&self, kind: RecordKind, key: &str, limit: usize) -> StoreResult<Vec<StoredRecord>>;

    /// Delete exactly the given ids, returning how many were deleted.
    fn remove(&self, ids: &[i64]) -> StoreResult<usize>;

    /// Count remaining records per `(kind, key)`, for counter recovery.
    fn pending_counts(&self) -> StoreResult<Vec<PendingCount>>;
}
