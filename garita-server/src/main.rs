//! Garita Server
//!
//! Visitor access lifecycle engine: event ledger, expiration sweeps and
//! facial-recognition panel sync.

mod api;
mod config;
mod server;
mod shutdown;
mod state;

use clap::Parser;
use config::{ConfigLoader, get_database_url};
use garita_core::config::LifecycleStore;
use garita_core::events::{panel_sync_channel, state_changed_channel};
use garita_core::framework::DatabaseProcessor;
use garita_core::panel::isapi::IsapiClient;
use garita_core::processors::{
    ClockDriftRecalibrator, DocumentExpiry, ExpirationScheduler, ExpirationSweep, PanelSync,
    PanelSyncDispatcher,
};
use garita_sdk::credentials::CredentialCipher;
use server::{build_router, run_server};
use shutdown::{shutdown_signal, spawn_config_reload_handler, wait_for_shutdown};
use sqlx::postgres::PgPoolOptions;
use state::AppState;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use time::UtcOffset;
use tokio::sync::watch;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Garita - visitor access lifecycle engine
#[derive(Parser, Debug)]
#[command(name = "garita-server")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to the configuration file
    #[arg(short, long, default_value = "./garita.toml")]
    config: PathBuf,

    /// Override the listen address (e.g., 0.0.0.0:3000)
    #[arg(short, long)]
    listen: Option<SocketAddr>,

    /// Run database migrations on startup
    #[arg(long, default_value = "false")]
    migrate: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let args = Args::parse();

    tracing::info!("Starting garita-server v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let config_loader = Arc::new(ConfigLoader::new(&args.config, args.listen));
    let loaded_config = config_loader.load().map_err(|e| {
        tracing::error!("Failed to load configuration: {}", e);
        e
    })?;

    let listen_addr = loaded_config.server.listen;
    tracing::info!("Configuration loaded from {:?}", args.config);

    let database_url = get_database_url().map_err(|e| {
        tracing::error!("DATABASE_URL environment variable not set");
        e
    })?;

    tracing::info!("Connecting to database...");
    let db_pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&database_url)
        .await
        .map_err(|e| {
            tracing::error!("Failed to connect to database: {}", e);
            e
        })?;
    tracing::info!("Database connection established");

    if args.migrate {
        tracing::info!("Running database migrations...");
        sqlx::migrate!("../migrations")
            .run(&db_pool)
            .await
            .map_err(|e| {
                tracing::error!("Failed to run migrations: {}", e);
                e
            })?;
        tracing::info!("Migrations completed successfully");
    }

    let cipher = CredentialCipher::from_secret(&loaded_config.credential_key)?;
    let panel_client = IsapiClient::new(loaded_config.panels.request_timeout)?;
    let processor = DatabaseProcessor::new(db_pool.clone());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (sync_tx, sync_rx) = panel_sync_channel();
    let (notify_tx, _) = state_changed_channel();

    let utc_offset = loaded_config
        .lifecycle
        .as_ref()
        .map_or(UtcOffset::UTC, |l| l.utc_offset);
    let lifecycle = loaded_config.lifecycle.map(LifecycleStore::new);

    let mut jobs = Vec::new();
    match &lifecycle {
        Some(store) => {
            let sync = PanelSync::new(processor.clone(), panel_client, cipher);
            jobs.push(tokio::spawn(
                PanelSyncDispatcher::new(sync, store.clone(), sync_rx, shutdown_rx.clone()).run(),
            ));
            let sweep = ExpirationSweep::new(processor.clone(), sync_tx.clone(), notify_tx.clone());
            jobs.push(tokio::spawn(
                ExpirationScheduler::new(sweep, store.clone(), shutdown_rx.clone()).run(),
            ));
        }
        None => {
            tracing::error!(
                "No [lifecycle] section configured; the expiration scheduler and the panel sync dispatcher are not started"
            );
        }
    }
    jobs.push(tokio::spawn(
        ClockDriftRecalibrator::new(processor.clone(), utc_offset, shutdown_rx.clone()).run(),
    ));
    jobs.push(tokio::spawn(
        DocumentExpiry::new(processor.clone(), utc_offset, shutdown_rx.clone()).run(),
    ));

    let state = AppState::new(
        processor,
        lifecycle,
        loaded_config.ingest_secret,
        sync_tx,
        notify_tx,
        shutdown_rx.clone(),
    );

    // Spawn config reload handler (listens for SIGHUP)
    let reload_notify = spawn_config_reload_handler(state.clone(), config_loader);

    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = shutdown_tx.send(true);
    });

    let router = build_router(state);

    tracing::info!("Starting HTTP server on {}", listen_addr);
    let result = run_server(router, listen_addr, wait_for_shutdown(shutdown_rx)).await;

    reload_notify.notify_one();

    for job in jobs {
        if let Err(e) = job.await {
            tracing::error!(error = %e, "Background job terminated abnormally");
        }
    }

    tracing::info!("Closing database connections...");
    db_pool.close().await;
    tracing::info!("Server shutdown complete");

    result.map_err(Into::into)
}

/// Initialize the tracing subscriber with environment-based filtering.
///
/// `GARITA_LOG_FORMAT=json` switches to JSON lines.
fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,sqlx=warn"));
    let json = std::env::var("GARITA_LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}
