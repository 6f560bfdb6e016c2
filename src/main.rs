//! wal2tap - stream PostgreSQL tables to the tap protocol
//!
//! Loads a config and catalog, restores bookmark state, then replicates
//! every selected stream to stdout as line-delimited JSON messages.
//! Diagnostics go to stderr.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt};
use wal2tap::catalog::{Catalog, InformationSchemaRefresher};
use wal2tap::config::TapConfig;
use wal2tap::messages::StdoutEmitter;
use wal2tap::state::State;
use wal2tap::sync::do_sync;

#[derive(Parser, Debug)]
#[command(
    name = "wal2tap",
    about = "PostgreSQL change-data-capture to the tap message protocol",
    version = "0.1.0"
)]
struct Args {
    /// Connection and engine settings (JSON)
    #[arg(long)]
    config: PathBuf,

    /// Stream catalog with schemas and replication metadata (JSON)
    #[arg(long)]
    catalog: PathBuf,

    /// Bookmark state from a prior run; also re-read while streaming to learn
    /// what the downstream has committed
    #[arg(long)]
    state: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let args = Args::parse();

    let config = TapConfig::from_file(&args.config)
        .with_context(|| format!("loading config {}", args.config.display()))?;
    let catalog = Catalog::from_file(&args.catalog)
        .with_context(|| format!("loading catalog {}", args.catalog.display()))?;
    let state = match &args.state {
        Some(path) if path.exists() => State::from_file(path)
            .with_context(|| format!("loading state {}", path.display()))?,
        _ => State::default(),
    };

    info!(
        "Starting sync of {} stream(s) against {}:{}/{}",
        catalog.streams.len(),
        config.host,
        config.port,
        config.dbname
    );

    // SIGINT flips a flag the replication loop checks at iteration boundaries
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown signal received, finishing at the next iteration boundary");
            shutdown_signal.store(true, Ordering::SeqCst);
        }
    });

    // libpq is synchronous, so the whole engine runs in a blocking task
    let state_path = args.state.clone();
    let result = tokio::task::spawn_blocking(move || {
        let refresher = InformationSchemaRefresher::new(config.clone());
        let mut emitter = StdoutEmitter;
        do_sync(
            &config,
            &catalog,
            state,
            state_path.as_deref(),
            &mut emitter,
            &refresher,
            &shutdown,
        )
    })
    .await?;

    match result {
        Ok(_) => {
            info!("Sync completed successfully");
            Ok(())
        }
        Err(e) => {
            error!("Sync failed: {}", e);
            Err(e.into())
        }
    }
}
