//! Best-effort JSONL audit log.
//!
//! One append-only file per calendar day under `<data_dir>/audit/`. Audit
//! failures never fail the write path; they are logged and dropped.

use crate::events::EventRow;
use chrono::Utc;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use tracing::warn;

pub struct AuditLog {
    dir: PathBuf,
}

impl AuditLog {
    pub fn new(dir: PathBuf) -> Self {
        AuditLog { dir }
    }

    /// Append one event row to today's audit file. Best effort.
    pub fn append(&self, row: &EventRow) {
        if let Err(e) = self.try_append(row) {
            warn!(error = %e, session_id = %row.session_id, seq = row.seq, "audit append failed");
        }
    }

    fn try_append(&self, row: &EventRow) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        let day = Utc::now().format("%Y-%m-%d");
        let path = self.dir.join(format!("{day}.jsonl"));
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        let line = serde_json::to_string(row)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        file.write_all(line.as_bytes())?;
        file.write_all(b"\n")?;
        Ok(())
    }
}
