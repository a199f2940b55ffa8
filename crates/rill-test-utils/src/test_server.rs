//! Spin up a real stream server on an ephemeral port, backed by a temp
//! data directory that lives as long as the handle.

use rill_server::state::AppState;
use rill_server::store::DurableStore;
use rill_server::ServerConfig;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

pub struct TestServer {
    pub addr: SocketAddr,
    pub store: Arc<DurableStore>,
    pub state: AppState,
    shutdown_tx: watch::Sender<bool>,
    _data_dir: tempfile::TempDir,
}

impl TestServer {
    /// Start with test-friendly defaults (2-second long-poll timeout).
    pub async fn start() -> Self {
        Self::start_with_config(ServerConfig {
            long_poll_timeout: Duration::from_secs(2),
            ..ServerConfig::default()
        })
        .await
    }

    pub async fn start_with_config(config: ServerConfig) -> Self {
        let data_dir = tempfile::tempdir().expect("create temp data dir");
        let store = Arc::new(DurableStore::open(data_dir.path()).expect("open stream store"));
        let (state, shutdown_tx) = AppState::new(store.clone(), config);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind test listener");
        let addr = listener.local_addr().expect("test listener addr");
        let router = rill_server::build_router(state.clone());
        tokio::spawn(async move {
            axum::serve(listener, router).await.expect("test server");
        });

        TestServer {
            addr,
            store,
            state,
            shutdown_tx,
            _data_dir: data_dir,
        }
    }

    pub fn url(&self, path_and_query: &str) -> String {
        format!("http://{}{}", self.addr, path_and_query)
    }

    /// Flip the shutdown flag that SSE loops watch.
    pub fn begin_shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}
