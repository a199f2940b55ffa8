//! rill-server: a durable append-only stream server.
//!
//! Layers, leaves first: `storage` (JSONL log files + SQLite index),
//! `engine` (stream CRUD, append with schema enforcement, range reads,
//! soft-delete + resurrect), `store` (protocol semantics: JSON framing,
//! producer fencing, expiry, subscriber fan-out), `http` (the wire
//! protocol), `events` + `agent` (the conversational run layer persisting
//! through the same append discipline).

pub mod agent;
pub mod audit;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod http;
pub mod schema;
pub mod state;
pub mod storage;
pub mod store;

pub use config::ServerConfig;
pub use http::build_router;
pub use state::AppState;
