//! Error taxonomy for the stream store.
//!
//! Low-level I/O, SQLite, and parse errors bubble up through this enum; the
//! HTTP layer maps each variant to a status code in one place
//! (`http::response`). The agent run controller never propagates these to
//! its callers.

use rill_protocol::{ProducerRejection, StreamOffset};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("stream not found: {0}")]
    StreamNotFound(String),

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("stream already exists with different configuration: {0}")]
    AlreadyExists(String),

    #[error("session already exists: {0}")]
    SessionExists(String),

    #[error("content type mismatch: stream is {stream}, request was {request}")]
    ContentTypeMismatch { stream: String, request: String },

    #[error("invalid JSON body: {0}")]
    InvalidJson(String),

    #[error("empty JSON array append")]
    EmptyArray,

    #[error("schema validation failed: {0}")]
    SchemaValidation(String),

    #[error("stream is closed")]
    StreamClosed { current_offset: StreamOffset },

    #[error(transparent)]
    Producer(#[from] ProducerRejection),

    #[error("producer headers must all be present or all absent")]
    PartialProducerHeaders,

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("stream was deleted at {deleted_at}")]
    SoftDeleted { deleted_at: String },

    #[error("duplicate event seq for session {session_id}")]
    DuplicateSeq { session_id: String },

    #[error("unknown event type: {0}")]
    UnknownEventType(String),

    #[error("SQLite: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("integrity check failed: {0}")]
    IntegrityCheckFailed(String),

    #[error("I/O: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid schema document for key {key}: {message}")]
    InvalidSchema { key: String, message: String },

    #[error("{0}")]
    Internal(String),
}

pub type StoreResult<T> = Result<T, StoreError>;
