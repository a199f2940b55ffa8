//! Durable SQLite index for the stream engine.
//!
//! # Schema
//! See `schema.sql`: streams, messages (byte pointers), producers
//! (idempotency fences), schema_registry, plus provisioned search tables.
//!
//! # SQLite durability settings
//! Applied at open: WAL, synchronous=FULL, wal_autocheckpoint=1000,
//! foreign_keys=ON. PRAGMA integrity_check runs at open; open fails if it
//! does not return "ok".
//!
//! All writes are serialised by the engine that owns this connection; this
//! module only groups multi-row mutations into transactions.

use crate::error::{StoreError, StoreResult};
use chrono::Utc;
use rill_protocol::{ProducerFence, StreamOffset};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;

const SCHEMA_SQL: &str = include_str!("schema.sql");

// ---------------------------------------------------------------------------
// Row types
// ---------------------------------------------------------------------------

/// A stream row, including soft-deleted rows. Callers that must not see
/// deleted streams check `deleted_at` (the engine does this for them).
#[derive(Debug, Clone)]
pub struct StreamRow {
    pub path: String,
    pub content_type: String,
    pub created_at: String,
    pub ttl_seconds: Option<u64>,
    pub expires_at: Option<String>,
    pub closed: bool,
    pub closed_by: Option<ProducerFence>,
    pub current_read_seq: u64,
    pub current_byte_offset: u64,
    pub deleted_at: Option<String>,
    pub log_file_id: String,
    pub schema_key: Option<String>,
}

impl StreamRow {
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// The stream's current tail offset.
    pub fn offset(&self) -> StreamOffset {
        StreamOffset::new(self.current_read_seq, self.current_byte_offset)
    }
}

/// A message pointer row.
#[derive(Debug, Clone)]
pub struct MessageRow {
    pub offset: StreamOffset,
    pub byte_pos: u64,
    pub byte_len: u64,
    pub created_at: String,
}

/// Producer fence state for one (stream, producer) pair.
#[derive(Debug, Clone)]
pub struct ProducerRow {
    pub epoch: u64,
    pub last_seq: u64,
    pub last_updated: String,
}

/// A persisted schema registration.
#[derive(Debug, Clone)]
pub struct SchemaRow {
    pub schema_key: String,
    pub document: String,
    pub version: u64,
}

/// Fields a (re)created stream takes from the caller.
#[derive(Debug, Clone)]
pub struct StreamConfigRow {
    pub content_type: String,
    pub ttl_seconds: Option<u64>,
    pub expires_at: Option<String>,
    pub closed: bool,
    pub schema_key: Option<String>,
}

// ---------------------------------------------------------------------------
// Index
// ---------------------------------------------------------------------------

/// The stream index database.
pub struct Index {
    conn: Connection,
}

impl Index {
    /// Open (or create) the index at `path`, applying PRAGMAs, running the
    /// integrity check, and creating tables if needed.
    pub fn open(path: &Path) -> StoreResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        let index = Index { conn };
        index.apply_pragmas()?;
        index.run_integrity_check()?;
        index.apply_schema()?;
        Ok(index)
    }

    /// In-memory index for tests.
    pub fn open_in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        let index = Index { conn };
        index.apply_pragmas()?;
        index.apply_schema()?;
        Ok(index)
    }

    fn apply_pragmas(&self) -> StoreResult<()> {
        self.conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=FULL;
             PRAGMA wal_autocheckpoint=1000;
             PRAGMA foreign_keys=ON;",
        )?;
        Ok(())
    }

    fn run_integrity_check(&self) -> StoreResult<()> {
        let result: String = self
            .conn
            .pragma_query_value(None, "integrity_check", |row| row.get(0))?;
        if result != "ok" {
            return Err(StoreError::IntegrityCheckFailed(result));
        }
        Ok(())
    }

    fn apply_schema(&self) -> StoreResult<()> {
        self.conn.execute_batch(SCHEMA_SQL)?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Streams
    // -----------------------------------------------------------------------

    /// Fetch a stream row by path, including soft-deleted rows.
    pub fn get_stream(&self, path: &str) -> StoreResult<Option<StreamRow>> {
        let row = self
            .conn
            .query_row(
                "SELECT path, content_type, created_at, ttl_seconds, expires_at,
                        closed, closed_by_producer_id, closed_by_epoch, closed_by_seq,
                        current_read_seq, current_byte_offset, deleted_at,
                        log_file_id, schema_key
                 FROM streams WHERE path = ?1",
                params![path],
                map_stream,
            )
            .optional()?;
        Ok(row)
    }

    /// Insert a brand-new stream row.
    pub fn insert_stream(
        &self,
        path: &str,
        config: &StreamConfigRow,
        log_file_id: &str,
    ) -> StoreResult<StreamRow> {
        let now = Utc::now().to_rfc3339();
        self.conn.execute(
            "INSERT INTO streams
                 (path, content_type, created_at, ttl_seconds, expires_at,
                  closed, current_read_seq, current_byte_offset, log_file_id, schema_key)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, 0, ?7, ?8)",
            params![
                path,
                config.content_type,
                now,
                config.ttl_seconds.map(|t| t as i64),
                config.expires_at,
                config.closed,
                log_file_id,
                config.schema_key,
            ],
        )?;
        self.get_stream(path)?
            .ok_or_else(|| StoreError::Internal(format!("stream vanished after insert: {path}")))
    }

    /// Resurrect a soft-deleted stream in one transaction: wipe its message
    /// pointers and producer state, clear the deletion marker, bump the read
    /// sequence, zero the byte offset, and assign the new log file id.
    ///
    /// Old offsets always compare below new ones because `read_seq` is the
    /// high-order key of the composite offset.
    pub fn resurrect_stream(
        &mut self,
        path: &str,
        config: &StreamConfigRow,
        new_log_file_id: &str,
    ) -> StoreResult<StreamRow> {
        let tx = self.conn.transaction()?;
        tx.execute("DELETE FROM messages WHERE stream_path = ?1", params![path])?;
        tx.execute("DELETE FROM producers WHERE stream_path = ?1", params![path])?;
        tx.execute(
            "UPDATE streams
             SET deleted_at = NULL,
                 closed = ?2,
                 closed_by_producer_id = NULL,
                 closed_by_epoch = NULL,
                 closed_by_seq = NULL,
                 current_read_seq = current_read_seq + 1,
                 current_byte_offset = 0,
                 log_file_id = ?3,
                 content_type = ?4,
                 ttl_seconds = ?5,
                 expires_at = ?6,
                 schema_key = ?7
             WHERE path = ?1",
            params![
                path,
                config.closed,
                new_log_file_id,
                config.content_type,
                config.ttl_seconds.map(|t| t as i64),
                config.expires_at,
                config.schema_key,
            ],
        )?;
        tx.commit()?;
        self.get_stream(path)?
            .ok_or_else(|| StoreError::Internal(format!("stream vanished after resurrect: {path}")))
    }

    /// List live (not soft-deleted) streams, oldest first.
    pub fn list_live_streams(&self) -> StoreResult<Vec<StreamRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT path, content_type, created_at, ttl_seconds, expires_at,
                    closed, closed_by_producer_id, closed_by_epoch, closed_by_seq,
                    current_read_seq, current_byte_offset, deleted_at,
                    log_file_id, schema_key
             FROM streams WHERE deleted_at IS NULL ORDER BY created_at ASC, path ASC",
        )?;
        let rows = stmt.query_map([], map_stream)?;
        let mut streams = Vec::new();
        for r in rows {
            streams.push(r?);
        }
        Ok(streams)
    }

    /// Soft-delete a live stream. Returns false when the path is unknown or
    /// already deleted. Message pointers and producer state are preserved
    /// until a future reaper runs.
    pub fn soft_delete_stream(&self, path: &str) -> StoreResult<bool> {
        let now = Utc::now().to_rfc3339();
        let changed = self.conn.execute(
            "UPDATE streams SET deleted_at = ?2 WHERE path = ?1 AND deleted_at IS NULL",
            params![path, now],
        )?;
        Ok(changed == 1)
    }

    /// Mark a stream closed, optionally recording the closing producer.
    pub fn set_closed(&self, path: &str, closed_by: Option<&ProducerFence>) -> StoreResult<()> {
        match closed_by {
            Some(fence) => self.conn.execute(
                "UPDATE streams
                 SET closed = 1, closed_by_producer_id = ?2,
                     closed_by_epoch = ?3, closed_by_seq = ?4
                 WHERE path = ?1",
                params![
                    path,
                    fence.producer_id,
                    fence.epoch as i64,
                    fence.seq as i64
                ],
            )?,
            None => self
                .conn
                .execute("UPDATE streams SET closed = 1 WHERE path = ?1", params![path])?,
        };
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Messages
    // -----------------------------------------------------------------------

    /// Record one appended message and advance the stream's byte offset, in
    /// a single transaction. `new_byte_offset` is the post-append stream
    /// cursor (the log file size after the write).
    pub fn append_message(
        &mut self,
        path: &str,
        offset: StreamOffset,
        byte_pos: u64,
        byte_len: u64,
        new_byte_offset: u64,
    ) -> StoreResult<MessageRow> {
        let now = Utc::now().to_rfc3339();
        let tx = self.conn.transaction()?;
        tx.execute(
            "INSERT INTO messages (stream_path, msg_offset, byte_pos, byte_len, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                path,
                offset.to_string(),
                byte_pos as i64,
                byte_len as i64,
                now
            ],
        )?;
        tx.execute(
            "UPDATE streams SET current_byte_offset = ?2 WHERE path = ?1",
            params![path, new_byte_offset as i64],
        )?;
        tx.commit()?;
        Ok(MessageRow {
            offset,
            byte_pos,
            byte_len,
            created_at: now,
        })
    }

    /// Message pointers strictly after `after`, in offset order. `None`
    /// returns everything.
    pub fn messages_after(
        &self,
        path: &str,
        after: Option<StreamOffset>,
    ) -> StoreResult<Vec<MessageRow>> {
        let after_key = after.map(|o| o.to_string()).unwrap_or_default();
        let mut stmt = self.conn.prepare(
            "SELECT msg_offset, byte_pos, byte_len, created_at
             FROM messages
             WHERE stream_path = ?1 AND msg_offset > ?2
             ORDER BY msg_offset ASC",
        )?;
        let rows = stmt.query_map(params![path, after_key], map_message)?;
        let mut messages = Vec::new();
        for r in rows {
            messages.push(r?);
        }
        Ok(messages)
    }

    /// Count message pointers for a stream.
    pub fn message_count(&self, path: &str) -> StoreResult<u64> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM messages WHERE stream_path = ?1",
            params![path],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    // -----------------------------------------------------------------------
    // Producers
    // -----------------------------------------------------------------------

    pub fn get_producer(&self, path: &str, producer_id: &str) -> StoreResult<Option<ProducerRow>> {
        let row = self
            .conn
            .query_row(
                "SELECT epoch, last_seq, last_updated FROM producers
                 WHERE stream_path = ?1 AND producer_id = ?2",
                params![path, producer_id],
                |row| {
                    Ok(ProducerRow {
                        epoch: row.get::<_, i64>(0)? as u64,
                        last_seq: row.get::<_, i64>(1)? as u64,
                        last_updated: row.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    /// Commit producer state after a successful append.
    pub fn upsert_producer(
        &self,
        path: &str,
        producer_id: &str,
        epoch: u64,
        last_seq: u64,
    ) -> StoreResult<()> {
        let now = Utc::now().to_rfc3339();
        self.conn.execute(
            "INSERT INTO producers (stream_path, producer_id, epoch, last_seq, last_updated)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT (stream_path, producer_id)
             DO UPDATE SET epoch = ?3, last_seq = ?4, last_updated = ?5",
            params![path, producer_id, epoch as i64, last_seq as i64, now],
        )?;
        Ok(())
    }

    /// Evict producer rows whose last update is older than `cutoff`
    /// (RFC 3339). Returns the number of rows removed.
    pub fn evict_producers_before(&self, cutoff: &str) -> StoreResult<usize> {
        let removed = self.conn.execute(
            "DELETE FROM producers WHERE last_updated < ?1",
            params![cutoff],
        )?;
        Ok(removed)
    }

    // -----------------------------------------------------------------------
    // Schema registry
    // -----------------------------------------------------------------------

    pub fn upsert_schema(&self, key: &str, document: &str, version: u64) -> StoreResult<()> {
        let now = Utc::now().to_rfc3339();
        self.conn.execute(
            "INSERT INTO schema_registry (schema_key, document, version, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?4)
             ON CONFLICT (schema_key)
             DO UPDATE SET document = ?2, version = ?3, updated_at = ?4",
            params![key, document, version as i64, now],
        )?;
        Ok(())
    }

    pub fn list_schemas(&self) -> StoreResult<Vec<SchemaRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT schema_key, document, version FROM schema_registry ORDER BY schema_key",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(SchemaRow {
                schema_key: row.get(0)?,
                document: row.get(1)?,
                version: row.get::<_, i64>(2)? as u64,
            })
        })?;
        let mut schemas = Vec::new();
        for r in rows {
            schemas.push(r?);
        }
        Ok(schemas)
    }
}

// ---------------------------------------------------------------------------
// Row mappers
// ---------------------------------------------------------------------------

fn map_stream(row: &rusqlite::Row<'_>) -> Result<StreamRow, rusqlite::Error> {
    let closed_by = match (
        row.get::<_, Option<String>>(6)?,
        row.get::<_, Option<i64>>(7)?,
        row.get::<_, Option<i64>>(8)?,
    ) {
        (Some(producer_id), Some(epoch), Some(seq)) => Some(ProducerFence {
            producer_id,
            epoch: epoch as u64,
            seq: seq as u64,
        }),
        _ => None,
    };
    Ok(StreamRow {
        path: row.get(0)?,
        content_type: row.get(1)?,
        created_at: row.get(2)?,
        ttl_seconds: row.get::<_, Option<i64>>(3)?.map(|t| t as u64),
        expires_at: row.get(4)?,
        closed: row.get(5)?,
        closed_by,
        current_read_seq: row.get::<_, i64>(9)? as u64,
        current_byte_offset: row.get::<_, i64>(10)? as u64,
        deleted_at: row.get(11)?,
        log_file_id: row.get(12)?,
        schema_key: row.get(13)?,
    })
}

fn map_message(row: &rusqlite::Row<'_>) -> Result<MessageRow, rusqlite::Error> {
    let offset_text: String = row.get(0)?;
    let offset = offset_text.parse::<StreamOffset>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })?;
    Ok(MessageRow {
        offset,
        byte_pos: row.get::<_, i64>(1)? as u64,
        byte_len: row.get::<_, i64>(2)? as u64,
        created_at: row.get(3)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> StreamConfigRow {
        StreamConfigRow {
            content_type: "application/octet-stream".to_owned(),
            ttl_seconds: None,
            expires_at: None,
            closed: false,
            schema_key: None,
        }
    }

    #[test]
    fn insert_and_fetch_stream() {
        let index = Index::open_in_memory().unwrap();
        let row = index.insert_stream("/a", &config(), "file-1").unwrap();
        assert_eq!(row.path, "/a");
        assert_eq!(row.current_read_seq, 0);
        assert_eq!(row.log_file_id, "file-1");
        assert!(!row.is_deleted());
    }

    #[test]
    fn soft_delete_hides_from_live_listing_but_keeps_row() {
        let index = Index::open_in_memory().unwrap();
        index.insert_stream("/a", &config(), "file-1").unwrap();
        assert!(index.soft_delete_stream("/a").unwrap());
        assert!(!index.soft_delete_stream("/a").unwrap(), "already deleted");

        assert!(index.list_live_streams().unwrap().is_empty());
        let row = index.get_stream("/a").unwrap().unwrap();
        assert!(row.is_deleted());
    }

    #[test]
    fn resurrect_bumps_read_seq_wipes_children_and_changes_file_id() {
        let mut index = Index::open_in_memory().unwrap();
        index.insert_stream("/a", &config(), "file-1").unwrap();
        index
            .append_message("/a", StreamOffset::new(0, 6), 0, 5, 6)
            .unwrap();
        index.upsert_producer("/a", "p1", 0, 3).unwrap();
        index.soft_delete_stream("/a").unwrap();

        let row = index.resurrect_stream("/a", &config(), "file-2").unwrap();
        assert_eq!(row.current_read_seq, 1);
        assert_eq!(row.current_byte_offset, 0);
        assert_eq!(row.log_file_id, "file-2");
        assert!(!row.is_deleted());
        assert_eq!(index.message_count("/a").unwrap(), 0);
        assert!(index.get_producer("/a", "p1").unwrap().is_none());
    }

    #[test]
    fn messages_after_is_strictly_greater_and_ordered() {
        let mut index = Index::open_in_memory().unwrap();
        index.insert_stream("/a", &config(), "file-1").unwrap();
        let o1 = StreamOffset::new(0, 3);
        let o2 = StreamOffset::new(0, 7);
        let o3 = StreamOffset::new(0, 12);
        index.append_message("/a", o1, 0, 2, 3).unwrap();
        index.append_message("/a", o2, 3, 3, 7).unwrap();
        index.append_message("/a", o3, 7, 4, 12).unwrap();

        let all = index.messages_after("/a", None).unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].offset, o1);
        assert_eq!(all[2].offset, o3);

        let after = index.messages_after("/a", Some(o1)).unwrap();
        assert_eq!(after.len(), 2);
        assert_eq!(after[0].offset, o2);

        assert!(index.messages_after("/a", Some(o3)).unwrap().is_empty());
    }

    #[test]
    fn producer_state_round_trip_and_eviction() {
        let index = Index::open_in_memory().unwrap();
        index.insert_stream("/a", &config(), "file-1").unwrap();
        index.upsert_producer("/a", "p1", 2, 9).unwrap();

        let row = index.get_producer("/a", "p1").unwrap().unwrap();
        assert_eq!(row.epoch, 2);
        assert_eq!(row.last_seq, 9);

        // A cutoff in the far future evicts everything.
        let removed = index.evict_producers_before("9999-01-01T00:00:00Z").unwrap();
        assert_eq!(removed, 1);
        assert!(index.get_producer("/a", "p1").unwrap().is_none());
    }

    #[test]
    fn closed_by_round_trips() {
        let index = Index::open_in_memory().unwrap();
        index.insert_stream("/a", &config(), "file-1").unwrap();
        let fence = ProducerFence {
            producer_id: "p1".to_owned(),
            epoch: 1,
            seq: 4,
        };
        index.set_closed("/a", Some(&fence)).unwrap();

        let row = index.get_stream("/a").unwrap().unwrap();
        assert!(row.closed);
        assert_eq!(row.closed_by, Some(fence));
    }

    #[test]
    fn schema_registry_round_trips() {
        let index = Index::open_in_memory().unwrap();
        index.upsert_schema("chat", r#"{"type":"object"}"#, 1).unwrap();
        index.upsert_schema("chat", r#"{"type":"object"}"#, 2).unwrap();

        let schemas = index.list_schemas().unwrap();
        assert_eq!(schemas.len(), 1);
        assert_eq!(schemas[0].schema_key, "chat");
        assert_eq!(schemas[0].version, 2);
    }
}
