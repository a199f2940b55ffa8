//! Server configuration: CLI flags with environment fallbacks.

use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Parser)]
#[command(name = "rill-server", about = "Durable append-only stream server")]
pub struct Cli {
    /// Listen address.
    #[arg(long, env = "RILL_BIND", default_value = "0.0.0.0:8080")]
    pub bind: String,

    /// Data directory (index databases, log files, audit log).
    #[arg(long, env = "RILL_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Log filter, e.g. `info` or `rill_server=debug`.
    #[arg(long, env = "RILL_LOG", default_value = "info")]
    pub log: String,

    /// How long a long-poll waits before returning 204.
    #[arg(long, env = "RILL_LONG_POLL_TIMEOUT_SECS", default_value_t = 30)]
    pub long_poll_timeout_secs: u64,

    /// Workspace file injected as a bootstrap tool round by the run
    /// controller, when one is embedded.
    #[arg(long, env = "RILL_BOOTSTRAP_FILE")]
    pub bootstrap_file: Option<PathBuf>,
}

impl Cli {
    pub fn resolved_data_dir(&self) -> PathBuf {
        self.data_dir.clone().unwrap_or_else(|| {
            dirs::data_local_dir()
                .unwrap_or_else(std::env::temp_dir)
                .join("rill")
        })
    }
}

/// Runtime knobs the handlers consult.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub long_poll_timeout: Duration,
    /// Bodies at or above this size are eligible for compression.
    pub compress_threshold: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            long_poll_timeout: Duration::from_secs(30),
            compress_threshold: 1024,
        }
    }
}

impl ServerConfig {
    pub fn from_cli(cli: &Cli) -> Self {
        ServerConfig {
            long_poll_timeout: Duration::from_secs(cli.long_poll_timeout_secs),
            ..ServerConfig::default()
        }
    }
}
