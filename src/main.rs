use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use tokio::sync::{oneshot, Mutex};

use substrate_indexer::control_plane;
use substrate_indexer::logging;
use substrate_indexer::session::SessionManager;
use substrate_indexer::settings::{CommandLineOptions, Settings};
use substrate_indexer::store::rocks::RocksStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init();

    let settings = Settings::load(CommandLineOptions::parse())?;

    if settings.store.password.is_none() {
        tracing::warn!("store.password is not set; RocksStore does not yet apply encryption at rest");
    }

    let store = Arc::new(RocksStore::open(&settings.store.path)?);
    let registry = Arc::new(Mutex::new(HashMap::new()));
    let on_error = control_plane::error_sink(registry.clone());
    let session_manager = Arc::new(SessionManager::new(store, on_error));

    let addr: SocketAddr =
        format!("{}:{}", settings.control_plane.host, settings.control_plane.port).parse()?;

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let serve_manager = session_manager.clone();
    let serve_handle = tokio::spawn(async move {
        control_plane::serve(addr, serve_manager, registry, shutdown_rx).await
    });

    wait_for_termination_signal().await;
    tracing::info!("shutdown signal received");

    let _ = shutdown_tx.send(());
    session_manager.shutdown().await;
    let _ = serve_handle.await;

    Ok(())
}

#[cfg(unix)]
async fn wait_for_termination_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigint = signal(SignalKind::interrupt()).expect("failed to register SIGINT handler");
    let mut sigterm = signal(SignalKind::terminate()).expect("failed to register SIGTERM handler");
    let mut sigquit = signal(SignalKind::quit()).expect("failed to register SIGQUIT handler");

    tokio::select! {
        _ = sigint.recv() => {},
        _ = sigterm.recv() => {},
        _ = sigquit.recv() => {},
    }
}

#[cfg(not(unix))]
async fn wait_for_termination_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
