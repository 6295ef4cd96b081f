//! SQLite-backed record store for the file buffer variant.

use crate::{
    NewRecord, PendingCount, RecordKind, RecordStore, StoreError, StoreResult, StoredRecord,
};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use std::path::Path;
use std::sync::Mutex;
use tracing::info;

/// File name of the buffer database inside the configured location.
const BUFFER_DB_FILE: &str = "buffer.db";

/// Crash-durable record store backed by a SQLite file.
///
/// The database lives at `<location>/buffer.db` and is auto-created on
/// first open. Records survive process restarts; recovery re-derives the
/// per-key counters with `pending_counts`.
pub struct SqliteRecordStore {
    conn: Mutex<Connection>,
}

impl SqliteRecordStore {
    /// Open (or create) the buffer database under the given directory.
    pub fn open(location: &Path) -> StoreResult<Self> {
        std::fs::create_dir_all(location)?;
        let path = location.join(BUFFER_DB_FILE);
        info!(path = %path.display(), "opening file buffer store");

        let conn = Connection::open(&path)?;
        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA busy_timeout = 5000;
        ",
        )?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS records (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                kind TEXT NOT NULL,
                key TEXT NOT NULL,
                params TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_records_kind_key ON records(kind, key);",
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database for testing.
    pub fn open_in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS records (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                kind TEXT NOT NULL,
                key TEXT NOT NULL,
                params TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_records_kind_key ON records(kind, key);",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

fn parse_datetime(s: String) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(&s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

impl RecordStore for SqliteRecordStore {
    fn insert(&self, record: NewRecord) -> StoreResult<i64> {
        let conn = self.conn.lock().unwrap();
        let params_json = serde_json::to_string(&record.params)?;
        conn.execute(
            "INSERT INTO records (kind, key, params, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![
                record.kind.as_str(),
                record.key,
                params_json,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    fn find(&self, kind: RecordKind, key: &str, limit: usize) -> StoreResult<Vec<StoredRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, kind, key, params, created_at FROM records
             WHERE kind = ?1 AND key = ?2 ORDER BY id ASC LIMIT ?3",
        )?;

        let rows = stmt.query_map(params![kind.as_str(), key, limit as i64], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
            ))
        })?;

        let mut records = Vec::new();
        for row in rows {
            let (id, kind, key, params_json, created_at) = row?;
            records.push(StoredRecord {
                id,
                kind: RecordKind::parse(&kind)?,
                key,
                params: serde_json::from_str(&params_json)?,
                created_at: parse_datetime(created_at),
            });
        }
        Ok(records)
    }

    fn remove(&self, ids: &[i64]) -> StoreResult<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        let conn = self.conn.lock().unwrap();
        let placeholders = vec!["?"; ids.len()].join(",");
        let sql = format!("DELETE FROM records WHERE id IN ({placeholders})");
        let deleted = conn.execute(&sql, rusqlite::params_from_iter(ids.iter()))?;
        Ok(deleted)
    }

    fn pending_counts(&self) -> StoreResult<Vec<PendingCount>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt =
            conn.prepare("SELECT kind, key, COUNT(*) FROM records GROUP BY kind, key")?;

        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
            ))
        })?;

        let mut counts = Vec::new();
        for row in rows {
            let (kind, key, count) = row?;
            counts.push(PendingCount {
                kind: RecordKind::parse(&kind)?,
                key,
                count: count.max(0) as u64,
            });
        }
        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SendParams;
    use serde_json::json;
    use tempfile::TempDir;

    fn topic_record(topic: &str, n: u64) -> NewRecord {
        NewRecord::from_params(SendParams::Topic {
            exchange: "events".to_string(),
            topic: topic.to_string(),
            content: json!({ "n": n }),
        })
    }

    #[test]
    fn test_insert_and_find_oldest_first() {
        let store = SqliteRecordStore::open_in_memory().unwrap();
        for n in 0..3 {
            store.insert(topic_record("t1", n)).unwrap();
        }

        let records = store.find(RecordKind::Topic, "events-t1", 10).unwrap();
        assert_eq!(records.len(), 3);
        assert!(records.windows(2).all(|w| w[0].id < w[1].id));
        assert_eq!(records[0].params.content()["n"], 0);
    }

    #[test]
    fn test_find_limit_leaves_newer_records() {
        let store = SqliteRecordStore::open_in_memory().unwrap();
        for n in 0..5 {
            store.insert(topic_record("t1", n)).unwrap();
        }

        let batch = store.find(RecordKind::Topic, "events-t1", 3).unwrap();
        assert_eq!(batch.len(), 3);
        assert_eq!(batch.last().unwrap().params.content()["n"], 2);
    }

    #[test]
    fn test_remove_returns_deleted_count() {
        let store = SqliteRecordStore::open_in_memory().unwrap();
        let a = store.insert(topic_record("t1", 1)).unwrap();
        let b = store.insert(topic_record("t1", 2)).unwrap();

        assert_eq!(store.remove(&[a, b]).unwrap(), 2);
        assert_eq!(store.remove(&[a, b]).unwrap(), 0);
        assert!(store.find(RecordKind::Topic, "events-t1", 10).unwrap().is_empty());
    }

    #[test]
    fn test_records_survive_reopen() {
        let dir = TempDir::new().unwrap();

        {
            let store = SqliteRecordStore::open(dir.path()).unwrap();
            store.insert(topic_record("t1", 1)).unwrap();
            store.insert(topic_record("t1", 2)).unwrap();
            store
                .insert(NewRecord::from_params(SendParams::Queue {
                    queue: "jobs".to_string(),
                    content: json!({}),
                }))
                .unwrap();
        }

        let store = SqliteRecordStore::open(dir.path()).unwrap();
        let mut counts = store.pending_counts().unwrap();
        counts.sort_by(|a, b| a.key.cmp(&b.key));
        assert_eq!(counts.len(), 2);
        assert_eq!(counts[0].key, "events-t1");
        assert_eq!(counts[0].count, 2);
        assert_eq!(counts[1].key, "jobs");
        assert_eq!(counts[1].count, 1);

        let records = store.find(RecordKind::Topic, "events-t1", 10).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].params.content()["n"], 1);
    }
}
