mod api;
mod assets;
mod cli;
mod config;
mod dispatch;
mod error;
mod modes;
mod probe;
mod reconcile;
mod selector;
mod store;
mod store_manager;

use std::sync::Arc;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use anyhow::{Context, Result};
use crate::cli::{Cli, Command};
use crate::config::Config;
use crate::probe::nmap::NmapScanner;
use crate::probe::ping::PingProber;
use crate::store::db::InventoryDb;
use crate::store_manager::StoreHandle;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("asset_inventoryd=info"))
        )
        .init();

    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => {
            let config = Config::load(path)
                .with_context(|| format!("Failed to load config from {}", path.display()))?;
            tracing::info!("Loaded config from {}", path.display());
            config
        }
        None => Config::default(),
    };

    // Open SQLite database
    let db = InventoryDb::open(&config.store.db_path)
        .with_context(|| format!("Failed to open database {}", config.store.db_path.display()))?;
    tracing::info!("Opened database at {:?}", config.store.db_path);

    let store = StoreHandle::spawn(db);

    // Ctrl-C stops continuous procedures between iterations and abandons bulk ones
    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Shutdown signal received");
            signal_cancel.cancel();
        }
    });

    let result = run(cli.command, &config, &store, &cancel).await;

    if let Err(e) = store.shutdown().await {
        tracing::error!("Failed to shutdown store: {}", e);
    }

    tracing::info!("Shutdown complete");
    result
}

async fn run(
    command: Command,
    config: &Config,
    store: &StoreHandle,
    cancel: &CancellationToken,
) -> Result<()> {
    match command {
        Command::SweepLiveness { assets } => {
            let path = assets.unwrap_or_else(|| config.assets.file.clone());
            let entries = assets::load_asset_list(&path)?;
            let addresses = assets::expand(&entries, config.assets.max_network_hosts)?;
            tracing::info!("{} addresses from {}", addresses.len(), path.display());

            let prober = PingProber::new(&config.liveness).await?;
            tokio::select! {
                report = modes::sweep_liveness(store, &prober, addresses, config.liveness.sweep_concurrency) => {
                    report.context("Liveness sweep aborted")?;
                }
                _ = cancel.cancelled() => tracing::warn!("Liveness sweep abandoned"),
            }
        }
        Command::RefreshLiveness => {
            let prober = Arc::new(PingProber::new(&config.liveness).await?);
            modes::refresh_liveness(store.clone(), prober, &config.liveness, cancel)
                .await
                .context("Liveness refresh aborted")?;
        }
        Command::SweepOs => {
            let scanner = NmapScanner::new(&config.fingerprint).await?;
            tokio::select! {
                report = modes::sweep_os(store, &scanner, config.fingerprint.os_concurrency) => {
                    report.context("OS sweep aborted")?;
                }
                _ = cancel.cancelled() => tracing::warn!("OS sweep abandoned"),
            }
        }
        Command::RefreshServices => {
            let scanner = Arc::new(NmapScanner::new(&config.fingerprint).await?);
            modes::refresh_services(store.clone(), scanner, &config.fingerprint, cancel)
                .await
                .context("Service refresh aborted")?;
        }
        Command::Annotate(args) => {
            let target = args.target();
            let outcome = modes::annotate(store, target, args.annotation()).await?;
            tracing::info!("Annotation of {:?}: {:?}", target, outcome);
        }
        Command::Serve => serve(config, store, cancel).await?,
    }

    Ok(())
}

async fn serve(config: &Config, store: &StoreHandle, cancel: &CancellationToken) -> Result<()> {
    let app = api::routes::router(api::routes::AppState {
        store: store.clone(),
    });

    // Bind HTTP server
    let listener = tokio::net::TcpListener::bind(&config.api.listen)
        .await
        .with_context(|| format!("Failed to bind to {}", config.api.listen))?;

    tracing::info!("API listening on {}", config.api.listen);

    let server_cancel = cancel.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { server_cancel.cancelled().await })
        .await
        .context("Server error")?;

    Ok(())
}
