use clap::Parser;
use rill_server::config::{Cli, ServerConfig};
use rill_server::events::realtime::RealtimeStore;
use rill_server::state::AppState;
use rill_server::store::DurableStore;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Producer rows idle for longer than this are evicted.
const PRODUCER_MAX_AGE: Duration = Duration::from_secs(7 * 24 * 60 * 60);
/// Eviction cadence.
const PRODUCER_SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);
/// Runs without a close event older than this are recovered at startup.
const STALE_RUN_AGE: Duration = Duration::from_secs(5 * 60);

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(cli.log.clone()))
        .init();

    let data_dir = cli.resolved_data_dir();
    info!(data_dir = %data_dir.display(), "opening stores");
    let store = Arc::new(DurableStore::open(&data_dir).expect("failed to open stream store"));
    let realtime =
        Arc::new(RealtimeStore::open(&data_dir).expect("failed to open event store"));

    // Crash recovery: close stale runs before serving traffic so replay
    // consumers and the closed-run cache see them as finished.
    match realtime.recover_stale_runs(STALE_RUN_AGE).await {
        Ok(0) => {}
        Ok(recovered) => info!(recovered, "closed stale runs from previous process"),
        Err(e) => warn!(error = %e, "stale-run recovery failed"),
    }

    // Periodic producer-state eviction.
    let sweeper_store = store.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(PRODUCER_SWEEP_INTERVAL);
        loop {
            ticker.tick().await;
            if let Err(e) = sweeper_store.evict_stale_producers(PRODUCER_MAX_AGE).await {
                warn!(error = %e, "producer eviction failed");
            }
        }
    });

    let (state, shutdown_tx) = AppState::new(store.clone(), ServerConfig::from_cli(&cli));
    let router = rill_server::build_router(state);

    let listener = tokio::net::TcpListener::bind(&cli.bind)
        .await
        .expect("failed to bind");
    info!(addr = %cli.bind, "server listening");
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            // SSE loops watch this flag and end their streams; in-flight
            // long-polls time out naturally.
            let _ = shutdown_tx.send(true);
        })
        .await
        .expect("server error");

    store.close().await;
    info!("server shut down gracefully");
}

/// Waits for SIGTERM or Ctrl-C (SIGINT) and returns to trigger graceful shutdown.
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => { info!("received Ctrl+C, shutting down"); },
        _ = terminate => { info!("received SIGTERM, shutting down"); },
    }
}
