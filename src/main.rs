//! Spreadwatch entrypoint: wire the store, the sink, and the manager, then
//! run until SIGINT/SIGTERM.
//!
//! Behavior lives in `bot:config`; the process surface is environment only:
//! `REDIS_URL` (required), `DATABASE_PATH` (optional), `RUST_LOG`.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use spreadwatch::detector::DetectorSettings;
use spreadwatch::manager::DynamicManager;
use spreadwatch::sink::OpportunitySink;
use spreadwatch::symbols::SymbolRegistry;
use spreadwatch::StoreClient;

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("starting spreadwatch");

    let redis_url = std::env::var("REDIS_URL").context("REDIS_URL must be set")?;
    let db_path =
        std::env::var("DATABASE_PATH").unwrap_or_else(|_| "./spreadwatch.db".to_string());

    // Startup failures here are the only fatal ones; everything after this
    // surfaces as events and log lines.
    let store = StoreClient::connect(&redis_url)
        .await
        .context("config store unreachable")?;
    let sink = Arc::new(OpportunitySink::new(&db_path)?);
    let registry = SymbolRegistry::shared();

    let manager = DynamicManager::new(registry, store, sink, DetectorSettings::default());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let manager_task = tokio::spawn(manager.run(shutdown_rx));

    wait_for_signal().await;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);

    match manager_task.await {
        Ok(Ok(())) => info!("manager exited cleanly"),
        Ok(Err(e)) => {
            error!(error = %e, "manager exited with error");
            return Err(e);
        }
        Err(e) => warn!(error = %e, "manager task aborted"),
    }
    Ok(())
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            warn!(error = %e, "SIGTERM handler unavailable, SIGINT only");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
