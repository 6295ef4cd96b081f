//! Volatile in-process record store.

use crate::{NewRecord, PendingCount, RecordKind, RecordStore, StoreResult, StoredRecord};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;

/// In-memory record store backing the memory buffer variant.
///
/// Records live in an insertion-ordered list; ids are assigned from a
/// monotonic sequence so flush order matches append order.
pub struct MemoryRecordStore {
    records: Mutex<Vec<StoredRecord>>,
    next_id: AtomicI64,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self {
            records: Mutex::new(Vec::new()),
            next_id: AtomicI64::new(1),
        }
    }
}

impl Default for MemoryRecordStore {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordStore for MemoryRecordStore {
    fn insert(&self, record: NewRecord) -> StoreResult<i64> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let mut records = self.records.lock().unwrap();
        records.push(StoredRecord {
            id,
            kind: record.kind,
            key: record.key,
            params: record.params,
            created_at: Utc::now(),
        });
        Ok(id)
    }

    fn find(&self, kind: RecordKind, key: &str, limit: usize) -> StoreResult<Vec<StoredRecord>> {
        let records = self.records.lock().unwrap();
        Ok(records
            .iter()
            .filter(|r| r.kind == kind && r.key == key)
            .take(limit)
            .cloned()
            .collect())
    }

    fn remove(&self, ids: &[i64]) -> StoreResult<usize> {
        let mut records = self.records.lock().unwrap();
        let before = records.len();
        records.retain(|r| !ids.contains(&r.id));
        Ok(before - records.len())
    }

    fn pending_counts(&self) -> StoreResult<Vec<PendingCount>> {
        let records = self.records.lock().unwrap();
        let mut counts: HashMap<(RecordKind, String), u64> = HashMap::new();
        for record in records.iter() {
            *counts.entry((record.kind, record.key.clone())).or_insert(0) += 1;
        }
        Ok(counts
            .into_iter()
            .map(|((kind, key), count)| PendingCount { kind, key, count })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SendParams;
    use serde_json::json;

    fn queue_record(queue: &str, n: u64) -> NewRecord {
        NewRecord::from_params(SendParams::Queue {
            queue: queue.to_string(),
            content: json!({ "n": n }),
        })
    }

    #[test]
    fn test_find_returns_records_in_insertion_order() {
        let store = MemoryRecordStore::new();
        for n in 0..5 {
            store.insert(queue_record("jobs", n)).unwrap();
        }

        let records = store.find(RecordKind::Queue, "jobs", 10).unwrap();
        assert_eq!(records.len(), 5);
        let ns: Vec<u64> = records
            .iter()
            .map(|r| r.params.content()["n"].as_u64().unwrap())
            .collect();
        assert_eq!(ns, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_find_respects_limit_and_key() {
        let store = MemoryRecordStore::new();
        for n in 0..4 {
            store.insert(queue_record("jobs", n)).unwrap();
        }
        store.insert(queue_record("other", 99)).unwrap();

        let records = store.find(RecordKind::Queue, "jobs", 2).unwrap();
        assert_eq!(records.len(), 2);
        assert!(records.iter().all(|r| r.key == "jobs"));
    }

    #[test]
    fn test_remove_deletes_exactly_the_given_ids() {
        let store = MemoryRecordStore::new();
        let a = store.insert(queue_record("jobs", 1)).unwrap();
        let b = store.insert(queue_record("jobs", 2)).unwrap();
        let c = store.insert(queue_record("jobs", 3)).unwrap();

        let removed = store.remove(&[a, c]).unwrap();
        assert_eq!(removed, 2);

        let remaining = store.find(RecordKind::Queue, "jobs", 10).unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id, b);
    }

    #[test]
    fn test_pending_counts_groups_by_kind_and_key() {
        let store = MemoryRecordStore::new();
        store.insert(queue_record("jobs", 1)).unwrap();
        store.insert(queue_record("jobs", 2)).unwrap();
        store
            .insert(NewRecord::from_params(SendParams::Topic {
                exchange: "events".to_string(),
                topic: "t1".to_string(),
                content: json!({}),
            }))
            .unwrap();

        let mut counts = store.pending_counts().unwrap();
        counts.sort_by(|a, b| a.key.cmp(&b.key));
        assert_eq!(counts.len(), 2);
        assert_eq!(counts[0].key, "events-t1");
        assert_eq!(counts[0].count, 1);
        assert_eq!(counts[1].key, "jobs");
        assert_eq!(counts[1].count, 2);
    }
}
