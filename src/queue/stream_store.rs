//! Durable ordered stream store with consumer groups.
//!
//! An append-only table per the event-store storage idiom: entries get a
//! per-stream monotonically increasing id; consumer groups track the highest
//! delivered id plus a pending-delivery list so unacked entries are
//! redelivered after a visibility timeout. Delivery is at-least-once: a crash
//! between processing and ack means the entry is claimed again.

use anyhow::{Context, Result};
use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::{params, Connection};
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA temp_store = MEMORY;

CREATE TABLE IF NOT EXISTS stream_entries (
    stream TEXT NOT NULL,
    entry_id INTEGER NOT NULL,
    fields_json TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    PRIMARY KEY (stream, entry_id)
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS stream_groups (
    stream TEXT NOT NULL,
    grp TEXT NOT NULL,
    last_delivered_id INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (stream, grp)
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS stream_deliveries (
    stream TEXT NOT NULL,
    grp TEXT NOT NULL,
    entry_id INTEGER NOT NULL,
    consumer TEXT NOT NULL,
    delivered_at INTEGER NOT NULL,
    delivery_count INTEGER NOT NULL DEFAULT 1,
    PRIMARY KEY (stream, grp, entry_id)
) WITHOUT ROWID;
"#;

/// Interval between polls while blocking for new entries.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct StreamEntry {
    pub id: i64,
    pub fields: HashMap<String, String>,
}

pub struct StreamStore {
    conn: Mutex<Connection>,
    /// Seconds after which an unacked delivery may be claimed by another
    /// consumer in the group.
    visibility_timeout_s: i64,
}

impl StreamStore {
    pub fn new(path: &str, visibility_timeout_s: i64) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open stream store at {path}"))?;
        conn.execute_batch(SCHEMA_SQL)
            .context("Failed to apply stream store schema")?;
        debug!(path, "Stream store opened");
        Ok(Self {
            conn: Mutex::new(conn),
            visibility_timeout_s: visibility_timeout_s.max(1),
        })
    }

    /// Append fields to a stream; returns the entry's monotone id.
    pub fn append(&self, stream: &str, fields: &HashMap<String, String>) -> Result<i64> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let next_id: i64 = tx.query_row(
            "SELECT COALESCE(MAX(entry_id), 0) + 1 FROM stream_entries WHERE stream = ?1",
            params![stream],
            |r| r.get(0),
        )?;
        tx.execute(
            "INSERT INTO stream_entries (stream, entry_id, fields_json, created_at)
             VALUES (?1,?2,?3,?4)",
            params![
                stream,
                next_id,
                serde_json::to_string(fields)?,
                Utc::now().timestamp()
            ],
        )?;
        tx.commit()?;
        Ok(next_id)
    }

    /// Idempotent consumer-group creation.
    pub fn ensure_group(&self, stream: &str, group: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR IGNORE INTO stream_groups (stream, grp, last_delivered_id)
             VALUES (?1,?2,0)",
            params![stream, group],
        )?;
        Ok(())
    }

    /// Blocking group read: claims expired deliveries first, then new entries.
    /// Returns an empty vec once `block` elapses with nothing available.
    pub async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamEntry>> {
        let deadline = tokio::time::Instant::now() + block;
        loop {
            let claimed = self.claim(stream, group, consumer, count)?;
            if !claimed.is_empty() {
                return Ok(claimed);
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(Vec::new());
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    fn claim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> Result<Vec<StreamEntry>> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let now = Utc::now().timestamp();
        let cutoff = now - self.visibility_timeout_s;

        // 1) Reclaim deliveries whose visibility timeout expired.
        let expired: Vec<i64> = {
            let mut stmt = tx.prepare(
                "SELECT entry_id FROM stream_deliveries
                 WHERE stream = ?1 AND grp = ?2 AND delivered_at < ?3
                 ORDER BY entry_id ASC LIMIT ?4",
            )?;
            let rows = stmt
                .query_map(params![stream, group, cutoff, count as i64], |r| r.get(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows
        };
        let ids: Vec<i64> = if !expired.is_empty() {
            for id in &expired {
                tx.execute(
                    "UPDATE stream_deliveries
                     SET consumer = ?1, delivered_at = ?2, delivery_count = delivery_count + 1
                     WHERE stream = ?3 AND grp = ?4 AND entry_id = ?5",
                    params![consumer, now, stream, group, id],
                )?;
            }
            expired
        } else {
            // 2) Deliver new entries past the group's cursor.
            let last_delivered: i64 = tx.query_row(
                "SELECT last_delivered_id FROM stream_groups WHERE stream = ?1 AND grp = ?2",
                params![stream, group],
                |r| r.get(0),
            )?;
            let fresh: Vec<i64> = {
                let mut stmt = tx.prepare(
                    "SELECT entry_id FROM stream_entries
                     WHERE stream = ?1 AND entry_id > ?2
                     ORDER BY entry_id ASC LIMIT ?3",
                )?;
                let rows = stmt
                    .query_map(params![stream, last_delivered, count as i64], |r| r.get(0))?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                rows
            };
            if let Some(max_id) = fresh.last() {
                tx.execute(
                    "UPDATE stream_groups SET last_delivered_id = ?1
                     WHERE stream = ?2 AND grp = ?3",
                    params![max_id, stream, group],
                )?;
                for id in &fresh {
                    tx.execute(
                        "INSERT OR REPLACE INTO stream_deliveries
                            (stream, grp, entry_id, consumer, delivered_at, delivery_count)
                         VALUES (?1,?2,?3,?4,?5,1)",
                        params![stream, group, id, consumer, now],
                    )?;
                }
            }
            fresh
        };

        let mut entries = Vec::with_capacity(ids.len());
        for id in ids {
            let fields_json: String = tx.query_row(
                "SELECT fields_json FROM stream_entries WHERE stream = ?1 AND entry_id = ?2",
                params![stream, id],
                |r| r.get(0),
            )?;
            entries.push(StreamEntry {
                id,
                fields: serde_json::from_str(&fields_json)?,
            });
        }
        tx.commit()?;
        Ok(entries)
    }

    /// Acknowledge a delivered entry; it will not be redelivered to the group.
    pub fn ack(&self, stream: &str, group: &str, id: i64) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "DELETE FROM stream_deliveries WHERE stream = ?1 AND grp = ?2 AND entry_id = ?3",
            params![stream, group, id],
        )?;
        Ok(())
    }

    /// Total number of entries ever appended to the stream.
    pub fn len(&self, stream: &str) -> Result<i64> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM stream_entries WHERE stream = ?1",
            params![stream],
            |r| r.get(0),
        )?;
        Ok(count)
    }

    /// Entries delivered to the group but not yet acked.
    pub fn pending(&self, stream: &str, group: &str) -> Result<i64> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM stream_deliveries WHERE stream = ?1 AND grp = ?2",
            params![stream, group],
            |r| r.get(0),
        )?;
        Ok(count)
    }

    /// Entries not yet delivered to the group.
    pub fn depth(&self, stream: &str, group: &str) -> Result<i64> {
        let conn = self.conn.lock();
        let last_delivered: i64 = conn
            .query_row(
                "SELECT last_delivered_id FROM stream_groups WHERE stream = ?1 AND grp = ?2",
                params![stream, group],
                |r| r.get(0),
            )
            .unwrap_or(0);
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM stream_entries WHERE stream = ?1 AND entry_id > ?2",
            params![stream, last_delivered],
            |r| r.get(0),
        )?;
        Ok(count)
    }

    pub fn ping(&self) -> Result<()> {
        let conn = self.conn.lock();
        conn.query_row("SELECT 1", [], |_| Ok(()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_streams(visibility_s: i64) -> (tempfile::TempDir, StreamStore) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("streams.db");
        let store = StreamStore::new(path.to_str().unwrap(), visibility_s).unwrap();
        (dir, store)
    }

    fn fields(event_id: &str) -> HashMap<String, String> {
        let mut f = HashMap::new();
        f.insert("event_id".to_string(), event_id.to_string());
        f.insert("payload".to_string(), "{}".to_string());
        f.insert("retry_count".to_string(), "0".to_string());
        f
    }

    #[test]
    fn append_ids_are_monotone() {
        let (_dir, store) = temp_streams(60);
        let a = store.append("s", &fields("e1")).unwrap();
        let b = store.append("s", &fields("e2")).unwrap();
        assert!(b > a);
        assert_eq!(store.len("s").unwrap(), 2);
    }

    #[tokio::test]
    async fn group_delivers_each_entry_once_until_ack() {
        let (_dir, store) = temp_streams(60);
        store.ensure_group("s", "g").unwrap();
        store.append("s", &fields("e1")).unwrap();

        let batch = store
            .read_group("s", "g", "c1", 10, Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].fields["event_id"], "e1");

        // Not redelivered while the delivery is in flight.
        let again = store
            .read_group("s", "g", "c2", 10, Duration::from_millis(10))
            .await
            .unwrap();
        assert!(again.is_empty());

        store.ack("s", "g", batch[0].id).unwrap();
        assert_eq!(store.pending("s", "g").unwrap(), 0);
    }

    #[tokio::test]
    async fn unacked_entry_is_reclaimed_after_visibility_timeout() {
        let (_dir, store) = temp_streams(0);
        store.ensure_group("s", "g").unwrap();
        store.append("s", &fields("e1")).unwrap();

        let first = store
            .read_group("s", "g", "c1", 10, Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(first.len(), 1);

        // visibility_timeout_s is clamped to 1; wait past it.
        tokio::time::sleep(Duration::from_millis(1100)).await;
        let reclaimed = store
            .read_group("s", "g", "c2", 10, Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(reclaimed.len(), 1);
        assert_eq!(reclaimed[0].id, first[0].id);
    }

    #[test]
    fn ensure_group_is_idempotent() {
        let (_dir, store) = temp_streams(60);
        store.ensure_group("s", "g").unwrap();
        store.ensure_group("s", "g").unwrap();
    }

    #[tokio::test]
    async fn two_groups_both_see_every_entry() {
        let (_dir, store) = temp_streams(60);
        store.ensure_group("s", "g1").unwrap();
        store.ensure_group("s", "g2").unwrap();
        store.append("s", &fields("e1")).unwrap();

        let b1 = store
            .read_group("s", "g1", "c", 10, Duration::from_millis(10))
            .await
            .unwrap();
        let b2 = store
            .read_group("s", "g2", "c", 10, Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(b1.len(), 1);
        assert_eq!(b2.len(), 1);
    }
}
