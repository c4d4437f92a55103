//! Akubra Daemon - Replicating S3 Reverse Proxy
//!
//! Fronts multiple S3-compatible object stores and keeps them eventually
//! consistent by duplicating every request to all configured backends in
//! real time.
//!
//! # Usage
//!
//! ```bash
//! # Start with ./akubra.yaml
//! akubra
//!
//! # Explicit configuration file
//! akubra --conf /etc/akubra/akubra.yaml
//!
//! # Verbose logging
//! RUST_LOG=debug akubra -c akubra.yaml
//! ```
//!
//! # Signals
//!
//! - `SIGTERM` / `SIGINT`: graceful shutdown
//!
//! Exits non-zero on configuration errors and bind failures.

mod server;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

/// Akubra - synchronous replicating S3 reverse proxy
#[derive(Parser, Debug)]
#[command(name = "akubra")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(
        short = 'c',
        long = "conf",
        env = "AKUBRA_CONF",
        value_name = "PATH",
        default_value = "akubra.yaml"
    )]
    conf: PathBuf,
}

fn init_logging() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging();

    info!("Akubra starting");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let config = akubra_core::load_config_from_path(&args.conf)
        .with_context(|| format!("cannot load configuration from {}", args.conf.display()))?;
    info!(
        listen = %config.listen,
        clusters = config.clusters.len(),
        "configuration loaded"
    );

    server::run(config).await?;
    info!("Akubra stopped cleanly");
    Ok(())
}
