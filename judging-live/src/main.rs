//! judging-live - Main entry point
//!
//! Serves live leaderboards over HTTP/SSE for the events in the score store.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use judging_common::config::{default_config_path, resolve_root_folder, ROOT_FOLDER_ENV};
use judging_live::api::{self, AppContext};
use judging_live::{Config, JudgingEngine, ScoreStore, SqliteScoreStore};

/// Command-line arguments for judging-live
#[derive(Parser, Debug)]
#[command(name = "judging-live")]
#[command(about = "Live leaderboard service for judging events")]
#[command(version)]
struct Args {
    /// Configuration file (TOML)
    #[arg(short, long, env = "JUDGING_CONFIG")]
    config: Option<PathBuf>,

    /// Port to listen on (overrides server.bind_addr)
    #[arg(short, long, env = "JUDGING_LIVE_PORT")]
    port: Option<u16>,

    /// Root folder holding the database
    #[arg(short, long)]
    root_folder: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config_path = args.config.clone().or_else(default_config_path);
    let (config, config_origin) =
        Config::load(config_path.as_deref()).context("Failed to load configuration")?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!("judging_live={level},judging_common={level},tower_http=info", level = config.logging.level)
                    .into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!(
        "Starting judging-live v{} [{}] built {} ({})",
        env!("CARGO_PKG_VERSION"),
        env!("GIT_HASH"),
        env!("BUILD_TIMESTAMP"),
        env!("BUILD_PROFILE")
    );
    config_origin.log();

    let root_folder =
        resolve_root_folder(args.root_folder.as_deref(), ROOT_FOLDER_ENV, config_path.as_deref());
    info!("Root folder: {}", root_folder.display());

    let db_path = config.database_path(&root_folder);
    let store = Arc::new(
        SqliteScoreStore::open(&db_path, config.store.change_buffer)
            .await
            .context("Failed to open score store")?,
    );
    let store: Arc<dyn ScoreStore> = store;

    let engine = JudgingEngine::new(store.clone(), config.engine.clone(), config.feed.clone());
    let reaper = engine.spawn_reaper();
    info!("Judging engine initialized");

    let mut bind_addr: SocketAddr = config
        .server
        .bind_addr
        .parse()
        .with_context(|| format!("Invalid server.bind_addr {}", config.server.bind_addr))?;
    if let Some(port) = args.port {
        bind_addr.set_port(port);
    }

    api::run(bind_addr, AppContext { engine, store }, shutdown_signal())
        .await
        .context("HTTP server failed")?;

    reaper.abort();
    info!("Server shutdown complete");
    Ok(())
}

/// Resolves on Ctrl+C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Ctrl+C handler unavailable: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("SIGTERM handler unavailable: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, shutting down"),
        _ = terminate => info!("Received terminate signal, shutting down"),
    }
}
