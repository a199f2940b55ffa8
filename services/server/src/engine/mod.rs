//! The stream engine: binds append-only log files to index rows.
//!
//! Owns the index database, the open-file cache, the schema registry, and
//! the optional stream router. All methods are synchronous; the durable
//! store above serialises access behind a single async mutex, which is what
//! makes the read-validate-write-commit sequence inside `append` atomic
//! within the process.
//!
//! Append ordering: stream row read → schema validation → log write → one
//! index transaction (message row + stream offset bump). If the process
//! dies between the log write and the transaction, the log contains a byte
//! range no index row references; it is invisible to readers and
//! `message_count` stays consistent with the index.

pub mod router;

use crate::error::{StoreError, StoreResult};
use crate::schema::SchemaRegistry;
use crate::storage::index::{Index, StreamConfigRow, StreamRow};
use crate::storage::log::LogFile;
use chrono::{DateTime, Utc};
use rill_protocol::StreamOffset;
use router::StreamRouter;
use std::collections::HashMap;
use std::path::PathBuf;
use tracing::{debug, info};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// Caller-supplied configuration for stream creation.
#[derive(Debug, Clone)]
pub struct CreateStreamOpts {
    pub content_type: String,
    pub ttl_seconds: Option<u64>,
    pub expires_at: Option<DateTime<Utc>>,
    pub closed: bool,
    pub schema_key: Option<String>,
}

impl Default for CreateStreamOpts {
    fn default() -> Self {
        CreateStreamOpts {
            content_type: "application/octet-stream".to_owned(),
            ttl_seconds: None,
            expires_at: None,
            closed: false,
            schema_key: None,
        }
    }
}

/// Result of `create_stream`, distinguishing a fresh row from an idempotent
/// hit on a live stream.
#[derive(Debug, Clone)]
pub enum CreateResult {
    /// A new stream (or a resurrected incarnation of a soft-deleted one).
    Created(StreamRow),
    /// The path was already live; the existing row is returned unchanged.
    Existing(StreamRow),
}

impl CreateResult {
    pub fn row(&self) -> &StreamRow {
        match self {
            CreateResult::Created(row) | CreateResult::Existing(row) => row,
        }
    }
}

/// Receipt for one accepted append.
#[derive(Debug, Clone)]
pub struct AppendReceipt {
    pub offset: StreamOffset,
    pub byte_pos: u64,
    pub byte_len: u64,
    pub timestamp: String,
}

/// A message read back through the index.
#[derive(Debug, Clone)]
pub struct StoredMessage {
    pub offset: StreamOffset,
    pub bytes: Vec<u8>,
    pub created_at: String,
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

struct OpenLog {
    file_id: String,
    log: LogFile,
}

pub struct StreamEngine {
    index: Index,
    logs_dir: PathBuf,
    files: HashMap<String, OpenLog>,
    schemas: SchemaRegistry,
    router: Option<StreamRouter>,
}

impl StreamEngine {
    /// Open the engine over `<data_dir>/streams.db` and `<data_dir>/logs/`.
    pub fn open(data_dir: &std::path::Path) -> StoreResult<Self> {
        let index = Index::open(&data_dir.join("streams.db"))?;
        Ok(StreamEngine {
            index,
            logs_dir: data_dir.join("logs"),
            files: HashMap::new(),
            schemas: SchemaRegistry::new(),
            router: None,
        })
    }

    // -----------------------------------------------------------------------
    // Schema + router registration
    // -----------------------------------------------------------------------

    /// Register a schema under `key` and persist the document.
    pub fn register_schema(
        &mut self,
        key: &str,
        document: &serde_json::Value,
        version: u64,
    ) -> StoreResult<()> {
        self.schemas.register(key, document)?;
        self.index
            .upsert_schema(key, &document.to_string(), version)?;
        info!(key, version, "schema registered");
        Ok(())
    }

    /// Install a router. Every route's schema is registered as well.
    pub fn register_router(&mut self, router: StreamRouter) -> StoreResult<()> {
        for def in router.routes() {
            self.schemas.register(&def.schema_key, &def.schema)?;
            self.index
                .upsert_schema(&def.schema_key, &def.schema.to_string(), def.version)?;
        }
        self.router = Some(router);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Stream CRUD
    // -----------------------------------------------------------------------

    /// Create a stream, idempotently when the target is live.
    ///
    /// When the target is soft-deleted, the row is resurrected: message
    /// pointers and producer state wiped, `current_read_seq` bumped,
    /// `current_byte_offset` zeroed, and a fresh log file id assigned. The
    /// old log file is never touched again.
    pub fn create_stream(&mut self, path: &str, opts: CreateStreamOpts) -> StoreResult<CreateResult> {
        let schema_key = match opts.schema_key {
            // Explicit key always wins over router patterns.
            Some(key) => Some(key),
            None => self
                .router
                .as_ref()
                .and_then(|r| r.match_path(path))
                .map(|def| def.schema_key.clone()),
        };
        let config = StreamConfigRow {
            content_type: opts.content_type,
            ttl_seconds: opts.ttl_seconds,
            expires_at: opts.expires_at.map(|t| t.to_rfc3339()),
            closed: opts.closed,
            schema_key,
        };

        match self.index.get_stream(path)? {
            None => {
                let log_file_id = Uuid::new_v4().to_string();
                let row = self.index.insert_stream(path, &config, &log_file_id)?;
                info!(path, log_file_id = %row.log_file_id, "stream created");
                Ok(CreateResult::Created(row))
            }
            Some(existing) if existing.is_deleted() => {
                self.files.remove(path);
                let log_file_id = Uuid::new_v4().to_string();
                let row = self.index.resurrect_stream(path, &config, &log_file_id)?;
                info!(
                    path,
                    read_seq = row.current_read_seq,
                    log_file_id = %row.log_file_id,
                    "stream resurrected"
                );
                Ok(CreateResult::Created(row))
            }
            Some(existing) => Ok(CreateResult::Existing(existing)),
        }
    }

    /// Fetch a live stream. Soft-deleted streams are invisible here.
    pub fn get_stream(&self, path: &str) -> StoreResult<Option<StreamRow>> {
        Ok(self.index.get_stream(path)?.filter(|row| !row.is_deleted()))
    }

    pub fn list_streams(&self) -> StoreResult<Vec<StreamRow>> {
        self.index.list_live_streams()
    }

    /// Soft-delete a live stream and drop its cached file handle. Returns
    /// false when the path is unknown or already deleted.
    pub fn delete_stream(&mut self, path: &str) -> StoreResult<bool> {
        let deleted = self.index.soft_delete_stream(path)?;
        if deleted {
            self.files.remove(path);
            info!(path, "stream soft-deleted");
        }
        Ok(deleted)
    }

    /// Mark a stream closed. The durable store owns the producer-credential
    /// bookkeeping; this just flips the row.
    pub fn close_stream(
        &mut self,
        path: &str,
        closed_by: Option<&rill_protocol::ProducerFence>,
    ) -> StoreResult<()> {
        self.index.set_closed(path, closed_by)
    }

    // -----------------------------------------------------------------------
    // Append / read
    // -----------------------------------------------------------------------

    /// Append one record to a stream.
    ///
    /// Schema-bound streams validate before any log mutation: the bytes are
    /// decoded as UTF-8, trailing whitespace and one trailing comma stripped
    /// (the framing produced by the JSON-array append path), the remainder
    /// parsed and validated.
    pub fn append(&mut self, path: &str, bytes: &[u8]) -> StoreResult<AppendReceipt> {
        let stream = self
            .index
            .get_stream(path)?
            .filter(|row| !row.is_deleted())
            .ok_or_else(|| StoreError::StreamNotFound(path.to_owned()))?;

        if let Some(key) = &stream.schema_key {
            if self.schemas.contains(key) {
                let value = parse_framed_json(bytes)?;
                self.schemas.validate(key, &value)?;
            }
        }

        let log = self.open_log(path, &stream.log_file_id)?;
        let (byte_pos, byte_len) = log.append(bytes)?;
        let new_byte_offset = log.size();

        let offset = StreamOffset::new(stream.current_read_seq, new_byte_offset);
        let row = self
            .index
            .append_message(path, offset, byte_pos, byte_len, new_byte_offset)?;
        debug!(path, offset = %offset, byte_len, "record appended");
        Ok(AppendReceipt {
            offset,
            byte_pos,
            byte_len,
            timestamp: row.created_at,
        })
    }

    /// Read messages strictly after `after` (everything when `None`), in
    /// offset order, resolving bytes through positioned reads.
    pub fn read(
        &mut self,
        path: &str,
        after: Option<StreamOffset>,
    ) -> StoreResult<Vec<StoredMessage>> {
        let stream = self
            .index
            .get_stream(path)?
            .filter(|row| !row.is_deleted())
            .ok_or_else(|| StoreError::StreamNotFound(path.to_owned()))?;

        let rows = self.index.messages_after(path, after)?;
        if rows.is_empty() {
            return Ok(Vec::new());
        }
        let log = self.open_log(path, &stream.log_file_id)?;
        let mut messages = Vec::with_capacity(rows.len());
        for row in rows {
            let bytes = log.read_at(row.byte_pos, row.byte_len)?;
            messages.push(StoredMessage {
                offset: row.offset,
                bytes,
                created_at: row.created_at,
            });
        }
        Ok(messages)
    }

    /// The stream's current tail offset.
    pub fn current_offset(&self, path: &str) -> StoreResult<StreamOffset> {
        let stream = self
            .index
            .get_stream(path)?
            .filter(|row| !row.is_deleted())
            .ok_or_else(|| StoreError::StreamNotFound(path.to_owned()))?;
        Ok(stream.offset())
    }

    pub fn message_count(&self, path: &str) -> StoreResult<u64> {
        self.index.message_count(path)
    }

    // -----------------------------------------------------------------------
    // Producer state passthrough (owned by the durable store's fence logic)
    // -----------------------------------------------------------------------

    pub fn get_producer(
        &self,
        path: &str,
        producer_id: &str,
    ) -> StoreResult<Option<crate::storage::index::ProducerRow>> {
        self.index.get_producer(path, producer_id)
    }

    pub fn commit_producer(
        &self,
        path: &str,
        producer_id: &str,
        epoch: u64,
        last_seq: u64,
    ) -> StoreResult<()> {
        self.index.upsert_producer(path, producer_id, epoch, last_seq)
    }

    pub fn evict_producers_before(&self, cutoff: DateTime<Utc>) -> StoreResult<usize> {
        self.index.evict_producers_before(&cutoff.to_rfc3339())
    }

    /// Drop all cached file handles.
    pub fn close(&mut self) {
        self.files.clear();
    }

    // -----------------------------------------------------------------------
    // Private helpers
    // -----------------------------------------------------------------------

    /// Get or open the log file for `path`. A stale cache entry (file id
    /// changed by resurrection) is replaced.
    fn open_log(&mut self, path: &str, file_id: &str) -> StoreResult<&mut LogFile> {
        let stale = self
            .files
            .get(path)
            .is_some_and(|open| open.file_id != file_id);
        if stale {
            self.files.remove(path);
        }
        if !self.files.contains_key(path) {
            let log = LogFile::open(&self.logs_dir.join(format!("{file_id}.jsonl")))?;
            self.files.insert(
                path.to_owned(),
                OpenLog {
                    file_id: file_id.to_owned(),
                    log,
                },
            );
        }
        Ok(&mut self
            .files
            .get_mut(path)
            .ok_or_else(|| StoreError::Internal(format!("log cache miss: {path}")))?
            .log)
    }
}

/// Parse append bytes as the JSON value they frame: trailing whitespace and
/// one trailing comma are stripped before parsing.
fn parse_framed_json(bytes: &[u8]) -> StoreResult<serde_json::Value> {
    let text = std::str::from_utf8(bytes)
        .map_err(|e| StoreError::InvalidJson(format!("payload is not UTF-8: {e}")))?;
    let trimmed = text.trim_end();
    let trimmed = trimmed.strip_suffix(',').unwrap_or(trimmed);
    serde_json::from_str(trimmed).map_err(|e| StoreError::InvalidJson(e.to_string()))
}
