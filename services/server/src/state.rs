//! Shared application state for the protocol server.

use crate::config::ServerConfig;
use crate::http::faults::FaultTable;
use crate::store::DurableStore;
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;
use tokio::sync::watch;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<DurableStore>,
    pub faults: Arc<FaultTable>,
    pub config: Arc<ServerConfig>,
    /// Flipped to true once at shutdown; SSE loops check it each iteration.
    pub shutdown: watch::Receiver<bool>,
    /// Active SSE responses, tracked for graceful shutdown.
    pub sse_active: Arc<AtomicUsize>,
}

impl AppState {
    /// Build the state plus the sender half of the shutdown flag.
    pub fn new(store: Arc<DurableStore>, config: ServerConfig) -> (Self, watch::Sender<bool>) {
        let (shutdown_tx, shutdown) = watch::channel(false);
        (
            AppState {
                store,
                faults: Arc::new(FaultTable::new()),
                config: Arc::new(config),
                shutdown,
                sse_active: Arc::new(AtomicUsize::new(0)),
            },
            shutdown_tx,
        )
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }
}
