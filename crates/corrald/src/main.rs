//! corrald — the Corral daemon.
//!
//! Single binary that assembles the Corral subsystems:
//! - State store (redb)
//! - Allocator, lifecycle manager and placement service
//! - Runtime gateway
//! - REST API
//!
//! # Usage
//!
//! ```text
//! corrald serve --port 8500 --data-dir /var/lib/corral --config /etc/corral.toml
//! corrald config --config /etc/corral.toml
//! ```

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use corral_core::CorralConfig;
use corral_scheduler::{DryRunGateway, PlacementService};
use tracing::{info, warn};

const DEFAULT_LOG_FILTER: &str = "info,corrald=debug,corral_state=debug,corral_placement=debug,\
                                  corral_scheduler=debug,corral_api=debug";

#[derive(Parser)]
#[command(name = "corrald", about = "Corral container placement daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Serve the placement API.
    Serve {
        /// Port to listen on.
        #[arg(long, default_value = "8500")]
        port: u16,

        /// Data directory for persistent state.
        #[arg(long, default_value = "/var/lib/corral")]
        data_dir: PathBuf,

        /// Path to corral.toml. Built-in defaults are used when omitted.
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Print the effective configuration as TOML.
    Config {
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(DEFAULT_LOG_FILTER)),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Serve {
            port,
            data_dir,
            config,
        } => {
            let config = load_config(config.as_deref())?;
            serve(port, data_dir, config).await
        }
        Command::Config { config } => {
            let config = load_config(config.as_deref())?;
            print!("{}", config.to_toml_string()?);
            Ok(())
        }
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<CorralConfig> {
    match path {
        Some(path) => {
            let config = CorralConfig::from_file(path)?;
            info!(path = ?path, "configuration loaded");
            Ok(config)
        }
        None => Ok(CorralConfig::default()),
    }
}

async fn serve(port: u16, data_dir: PathBuf, config: CorralConfig) -> anyhow::Result<()> {
    info!("Corral daemon starting");

    std::fs::create_dir_all(&data_dir)?;
    let db_path = data_dir.join("corral.redb");

    // ── Initialize subsystems ──────────────────────────────────

    let store = corral_state::StateStore::open(&db_path)?;
    info!(path = ?db_path, "state store opened");

    // No daemon client ships in this repository; the dry-run gateway logs
    // every runtime call and mints container ids.
    let gateway = Arc::new(DryRunGateway::new());
    warn!("using dry-run runtime gateway, no containers will be started");

    info!(
        registry = %config.registry,
        ports = ?(config.port_start..config.port_start.saturating_add(config.port_range)),
        public_host_limit = config.public_host_limit,
        "placement service initialized"
    );
    let placement = PlacementService::new(store, config, gateway);

    // Nothing can be mid-placement before the listener is up, so any
    // reservation left in the store belongs to a placement that died with
    // the previous process.
    let (stale, freed) = placement.allocator().release_stale_reservations()?;
    info!(stale, freed, "reservations recovered");

    // ── Start API server ───────────────────────────────────────

    let router = corral_api::build_router(placement);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    info!(%addr, "API server starting");

    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "failed to listen for shutdown signal");
            }
            info!("shutdown signal received");
        })
        .await?;

    info!("Corral daemon stopped");
    Ok(())
}
