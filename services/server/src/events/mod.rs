//! The event store: sessions and typed events for conversational runs.
//!
//! A peer engine to the stream store, over its own database file
//! (`events.db`) and a different payload discipline: every payload is
//! validated against a per-type schema before the insert, and every insert
//! advances the owning session's monotonic sequence in the same
//! transaction. Per-session `seq` strictness is the fundamental ordering
//! invariant; all readers and replay consumers rely on it.

pub mod realtime;

use crate::audit::AuditLog;
use crate::error::{StoreError, StoreResult};
use crate::schema::SchemaRegistry;
use chrono::{DateTime, Utc};
use rill_protocol::EventType;
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use serde_json::json;
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

const SCHEMA_SQL: &str = include_str!("schema.sql");

/// Reason stamped on synthetic `run_closed` rows written by crash recovery.
pub const RECOVERED_AFTER_CRASH: &str = "recovered_after_crash";

// ---------------------------------------------------------------------------
// Row types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct SessionRow {
    pub id: String,
    pub created_at: String,
    pub updated_at: String,
    pub current_seq: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct EventRow {
    pub id: i64,
    pub session_id: String,
    pub seq: u64,
    pub run_id: Option<String>,
    pub event_type: EventType,
    pub payload: serde_json::Value,
    pub dedupe_key: Option<String>,
    pub created_at: String,
}

/// One event to persist.
#[derive(Debug, Clone)]
pub struct NewEvent {
    pub session_id: String,
    pub event_type: EventType,
    pub payload: serde_json::Value,
    pub run_id: Option<String>,
    pub dedupe_key: Option<String>,
}

/// Filters for `query`.
#[derive(Debug, Clone, Default)]
pub struct EventQuery {
    pub session_id: String,
    pub after_seq: Option<u64>,
    pub types: Option<Vec<EventType>>,
    pub run_id: Option<String>,
    pub limit: Option<u64>,
}

/// One entry of a reconstructed conversation history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    pub seq: u64,
    pub role: String,
    pub text: String,
}

// ---------------------------------------------------------------------------
// EventStore
// ---------------------------------------------------------------------------

pub struct EventStore {
    conn: Connection,
    payload_schemas: SchemaRegistry,
    audit: Option<AuditLog>,
}

impl EventStore {
    /// Open the event store over `<data_dir>/events.db`, with the audit log
    /// under `<data_dir>/audit/`.
    pub fn open(data_dir: &Path) -> StoreResult<Self> {
        std::fs::create_dir_all(data_dir)?;
        let conn = Connection::open(data_dir.join("events.db"))?;
        Self::init(conn, Some(AuditLog::new(data_dir.join("audit"))))
    }

    /// In-memory store for tests (no audit log).
    pub fn open_in_memory() -> StoreResult<Self> {
        Self::init(Connection::open_in_memory()?, None)
    }

    fn init(conn: Connection, audit: Option<AuditLog>) -> StoreResult<Self> {
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=FULL;
             PRAGMA wal_autocheckpoint=1000;
             PRAGMA foreign_keys=ON;",
        )?;
        conn.execute_batch(SCHEMA_SQL)?;
        let mut payload_schemas = SchemaRegistry::new();
        for event_type in EventType::ALL {
            payload_schemas.register(event_type.as_str(), &payload_schema(*event_type))?;
        }
        Ok(EventStore {
            conn,
            payload_schemas,
            audit,
        })
    }

    // -----------------------------------------------------------------------
    // Sessions
    // -----------------------------------------------------------------------

    /// Create a session. An omitted id is generated; an explicit id that
    /// already exists is rejected.
    pub fn create_session(&self, id: Option<&str>) -> StoreResult<SessionRow> {
        let explicit = id.is_some();
        let id = id.map_or_else(|| Uuid::new_v4().to_string(), str::to_owned);
        let now = Utc::now().to_rfc3339();
        let inserted = self.conn.execute(
            "INSERT OR IGNORE INTO sessions (id, created_at, updated_at, current_seq)
             VALUES (?1, ?2, ?2, 0)",
            params![id, now],
        )?;
        if inserted == 0 && explicit {
            return Err(StoreError::SessionExists(id));
        }
        self.get_session(&id)?
            .ok_or_else(|| StoreError::SessionNotFound(id))
    }

    pub fn get_session(&self, id: &str) -> StoreResult<Option<SessionRow>> {
        let row = self
            .conn
            .query_row(
                "SELECT id, created_at, updated_at, current_seq FROM sessions WHERE id = ?1",
                params![id],
                |row| {
                    Ok(SessionRow {
                        id: row.get(0)?,
                        created_at: row.get(1)?,
                        updated_at: row.get(2)?,
                        current_seq: row.get::<_, i64>(3)? as u64,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    /// Delete a session; its events cascade.
    pub fn delete_session(&self, id: &str) -> StoreResult<bool> {
        let removed = self
            .conn
            .execute("DELETE FROM sessions WHERE id = ?1", params![id])?;
        Ok(removed == 1)
    }

    // -----------------------------------------------------------------------
    // Append
    // -----------------------------------------------------------------------

    /// Persist one event in a single transaction: payload validation,
    /// session lookup, dedupe check, seq assignment, session bump, insert.
    ///
    /// A dedupe hit returns the existing row unchanged.
    pub fn append(&mut self, event: NewEvent) -> StoreResult<EventRow> {
        self.payload_schemas
            .validate(event.event_type.as_str(), &event.payload)?;

        let tx = self.conn.transaction()?;

        let current_seq: i64 = tx
            .query_row(
                "SELECT current_seq FROM sessions WHERE id = ?1",
                params![event.session_id],
                |row| row.get(0),
            )
            .optional()?
            .ok_or_else(|| StoreError::SessionNotFound(event.session_id.clone()))?;

        if let Some(dedupe_key) = &event.dedupe_key {
            let existing = tx
                .query_row(
                    "SELECT id, session_id, seq, run_id, event_type, payload, dedupe_key, created_at
                     FROM events WHERE session_id = ?1 AND dedupe_key = ?2",
                    params![event.session_id, dedupe_key],
                    map_event,
                )
                .optional()?;
            if let Some(row) = existing {
                tx.commit()?;
                return Ok(row);
            }
        }

        let seq = current_seq + 1;
        let now = Utc::now().to_rfc3339();
        tx.execute(
            "UPDATE sessions SET current_seq = ?2, updated_at = ?3 WHERE id = ?1",
            params![event.session_id, seq, now],
        )?;
        tx.execute(
            "INSERT INTO events (session_id, seq, run_id, event_type, payload, dedupe_key, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                event.session_id,
                seq,
                event.run_id,
                event.event_type.as_str(),
                event.payload.to_string(),
                event.dedupe_key,
                now
            ],
        )?;
        let id = tx.last_insert_rowid();
        tx.commit()?;

        let row = EventRow {
            id,
            session_id: event.session_id,
            seq: seq as u64,
            run_id: event.run_id,
            event_type: event.event_type,
            payload: event.payload,
            dedupe_key: event.dedupe_key,
            created_at: now,
        };
        if let Some(audit) = &self.audit {
            audit.append(&row);
        }
        Ok(row)
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    /// Query events for a session, sorted by seq ascending.
    pub fn query(&self, query: &EventQuery) -> StoreResult<Vec<EventRow>> {
        let mut sql = String::from(
            "SELECT id, session_id, seq, run_id, event_type, payload, dedupe_key, created_at
             FROM events WHERE session_id = ?1",
        );
        let mut args: Vec<Box<dyn rusqlite::types::ToSql>> =
            vec![Box::new(query.session_id.clone())];

        if let Some(after_seq) = query.after_seq {
            args.push(Box::new(after_seq as i64));
            sql.push_str(&format!(" AND seq > ?{}", args.len()));
        }
        if let Some(run_id) = &query.run_id {
            args.push(Box::new(run_id.clone()));
            sql.push_str(&format!(" AND run_id = ?{}", args.len()));
        }
        if let Some(types) = &query.types {
            if types.is_empty() {
                return Ok(Vec::new());
            }
            let mut placeholders = Vec::with_capacity(types.len());
            for event_type in types {
                args.push(Box::new(event_type.as_str().to_owned()));
                placeholders.push(format!("?{}", args.len()));
            }
            sql.push_str(&format!(" AND event_type IN ({})", placeholders.join(",")));
        }
        sql.push_str(" ORDER BY seq ASC");
        if let Some(limit) = query.limit {
            args.push(Box::new(limit as i64));
            sql.push_str(&format!(" LIMIT ?{}", args.len()));
        }

        let mut stmt = self.conn.prepare(&sql)?;
        let params_ref: Vec<&dyn rusqlite::types::ToSql> =
            args.iter().map(AsRef::as_ref).collect();
        let rows = stmt.query_map(params_ref.as_slice(), map_event)?;
        let mut events = Vec::new();
        for r in rows {
            events.push(r?);
        }
        Ok(events)
    }

    /// Reconstruct the conversation: user messages, final assistant
    /// messages, and tool results in seq order. Rows whose payload does not
    /// carry the expected text are logged and skipped.
    pub fn get_conversation_history(&self, session_id: &str) -> StoreResult<Vec<ChatMessage>> {
        let rows = self.query(&EventQuery {
            session_id: session_id.to_owned(),
            types: Some(vec![
                EventType::UserMessage,
                EventType::AssistantFinal,
                EventType::ToolResult,
            ]),
            ..EventQuery::default()
        })?;
        let mut history = Vec::with_capacity(rows.len());
        for row in rows {
            let (role, text) = match row.event_type {
                EventType::UserMessage => ("user", row.payload.get("text")),
                EventType::AssistantFinal => ("assistant", row.payload.get("text")),
                EventType::ToolResult => ("tool", row.payload.get("content")),
                _ => continue,
            };
            let Some(value) = text else {
                warn!(session_id, seq = row.seq, "skipping history row with malformed payload");
                continue;
            };
            let text = match value {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            history.push(ChatMessage {
                seq: row.seq,
                role: role.to_owned(),
                text,
            });
        }
        Ok(history)
    }

    /// Every `(session, run)` with an `agent_start` older than `max_age`
    /// and no matching `run_closed`.
    pub fn find_stale_runs(&self, max_age: Duration) -> StoreResult<Vec<(String, String)>> {
        let cutoff = (Utc::now()
            - chrono::Duration::from_std(max_age)
                .map_err(|e| StoreError::Internal(format!("bad stale-run age: {e}")))?)
        .to_rfc3339();
        let mut stmt = self.conn.prepare(
            "SELECT DISTINCT e.session_id, e.run_id
             FROM events e
             WHERE e.event_type = 'agent_start'
               AND e.run_id IS NOT NULL
               AND e.created_at < ?1
               AND NOT EXISTS (
                   SELECT 1 FROM events c
                   WHERE c.session_id = e.session_id
                     AND c.run_id = e.run_id
                     AND c.event_type = 'run_closed'
               )
             ORDER BY e.session_id, e.run_id",
        )?;
        let rows = stmt.query_map(params![cutoff], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        let mut stale = Vec::new();
        for r in rows {
            stale.push(r?);
        }
        Ok(stale)
    }

    /// Close every stale run with a synthetic `run_closed`. Returns how
    /// many were recovered.
    pub fn recover_stale_runs(&mut self, max_age: Duration) -> StoreResult<usize> {
        let stale = self.find_stale_runs(max_age)?;
        for (session_id, run_id) in &stale {
            info!(session_id, run_id, "closing stale run");
            self.append(NewEvent {
                session_id: session_id.clone(),
                event_type: EventType::RunClosed,
                payload: json!({ "reason": RECOVERED_AFTER_CRASH }),
                run_id: Some(run_id.clone()),
                dedupe_key: None,
            })?;
        }
        Ok(stale.len())
    }

    /// True when a `run_closed` row exists for `(session, run)`.
    pub fn is_run_closed(&self, session_id: &str, run_id: &str) -> StoreResult<bool> {
        let found: Option<i64> = self
            .conn
            .query_row(
                "SELECT 1 FROM events
                 WHERE session_id = ?1 AND run_id = ?2 AND event_type = 'run_closed'
                 LIMIT 1",
                params![session_id, run_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    // -----------------------------------------------------------------------
    // Bootstrap marker
    // -----------------------------------------------------------------------

    /// Atomically claim the one-time bootstrap marker for `agent_id`.
    /// Returns true for the single caller that wins the claim.
    pub fn claim_bootstrap(&self, agent_id: &str) -> StoreResult<bool> {
        let now = Utc::now().to_rfc3339();
        let inserted = self.conn.execute(
            "INSERT INTO bootstrap_state (agent_id, injected_at) VALUES (?1, ?2)
             ON CONFLICT (agent_id) DO NOTHING",
            params![agent_id, now],
        )?;
        Ok(inserted == 1)
    }
}

fn map_event(row: &rusqlite::Row<'_>) -> Result<EventRow, rusqlite::Error> {
    let type_text: String = row.get(4)?;
    let event_type = type_text.parse::<EventType>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(4, rusqlite::types::Type::Text, Box::new(e))
    })?;
    let payload_text: String = row.get(5)?;
    let payload = serde_json::from_str(&payload_text).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(5, rusqlite::types::Type::Text, Box::new(e))
    })?;
    Ok(EventRow {
        id: row.get(0)?,
        session_id: row.get(1)?,
        seq: row.get::<_, i64>(2)? as u64,
        run_id: row.get(3)?,
        event_type,
        payload,
        dedupe_key: row.get(6)?,
        created_at: row.get(7)?,
    })
}

/// The structural schema each payload type is validated against. Extra
/// properties are always allowed; only the load-bearing fields are pinned.
fn payload_schema(event_type: EventType) -> serde_json::Value {
    match event_type {
        EventType::UserMessage | EventType::AssistantFinal => json!({
            "type": "object",
            "required": ["text"],
            "properties": { "text": { "type": "string" } }
        }),
        EventType::ToolCall => json!({
            "type": "object",
            "required": ["name"],
            "properties": {
                "name": { "type": "string" },
                "arguments": { "type": "object" }
            }
        }),
        EventType::ToolResult => json!({
            "type": "object",
            "required": ["content"]
        }),
        EventType::AgentEnd => json!({
            "type": "object",
            "required": ["messages"],
            "properties": { "messages": { "type": "array" } }
        }),
        EventType::RunClosed => json!({
            "type": "object",
            "required": ["reason"],
            "properties": { "reason": { "type": "string" } }
        }),
        EventType::Error => json!({
            "type": "object",
            "required": ["message"],
            "properties": { "message": { "type": "string" } }
        }),
        EventType::MessageStart | EventType::MessageEnd => json!({
            "type": "object",
            "required": ["message"]
        }),
        EventType::MessageUpdate => json!({
            "type": "object",
            "required": ["delta"]
        }),
        EventType::ToolExecutionStart => json!({
            "type": "object",
            "required": ["tool_call_id", "name"],
            "properties": {
                "tool_call_id": { "type": "string" },
                "name": { "type": "string" }
            }
        }),
        EventType::ToolExecutionUpdate | EventType::ToolExecutionEnd => json!({
            "type": "object",
            "required": ["tool_call_id"],
            "properties": { "tool_call_id": { "type": "string" } }
        }),
        EventType::AssistantStart
        | EventType::AgentStart
        | EventType::TurnStart
        | EventType::TurnEnd => json!({ "type": "object" }),
    }
}
