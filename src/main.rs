// src/main.rs
//! Granary Remote Build Cache - Server Entry Point

use anyhow::Result;
use clap::Parser;
use granary::{run_server, GranaryConfig};
use std::net::IpAddr;
use std::path::PathBuf;

// =============================================================================
// CLI Definitions
// =============================================================================

#[derive(Parser)]
#[command(name = "granary")]
#[command(author = "ConaryLabs")]
#[command(version)]
#[command(about = "Remote build cache with content-addressed storage and LRU eviction", long_about = None)]
struct Cli {
    /// Path to a TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Address to listen on
    #[arg(long)]
    host: Option<IpAddr>,

    /// Port the HTTP server listens on
    #[arg(short, long)]
    port: Option<u16>,

    /// Directory where cache contents are stored
    #[arg(short, long)]
    dir: Option<PathBuf>,

    /// Maximum cache size in GiB
    #[arg(short, long)]
    max_size: Option<i64>,

    /// Base URL of an upstream cache for read-through/write-through
    #[arg(long)]
    upstream_url: Option<String>,
}

// =============================================================================
// Main Entry Point
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let file_config = match &cli.config {
        Some(path) => GranaryConfig::load(path)?,
        None => GranaryConfig::default(),
    };
    let server_config = file_config.into_server_config(
        cli.host,
        cli.port,
        cli.dir,
        cli.max_size,
        cli.upstream_url,
    )?;

    run_server(server_config).await
}
