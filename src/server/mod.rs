// src/server/mod.rs
//! Granary cache server
//!
//! This module provides the HTTP front-end over the disk cache engine:
//! - Blob GET/PUT/HEAD on `/{cas|ac|raw}/{digest}`
//! - Validated action-result reads (stale results answer 404)
//! - Optional read-through/write-through against an upstream cache
//! - A JSON status page with size and hit/miss counters

mod config;
mod handlers;
pub mod metrics;
mod routes;

pub use config::GranaryConfig;
pub use metrics::{CacheMetrics, MetricsSnapshot};
pub use routes::create_router;

use crate::cache::{DiskCache, HttpCacheProxy};
use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: SocketAddr,
    /// Cache root directory
    pub dir: PathBuf,
    /// Maximum cache size in bytes
    pub max_size_bytes: i64,
    /// Upstream cache URL (None = no proxy)
    pub upstream_url: Option<String>,
    /// Request timeout for upstream calls
    pub upstream_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8080".parse().expect("valid default bind address"),
            dir: PathBuf::from("/var/cache/granary"),
            max_size_bytes: 10 * 1024 * 1024 * 1024,
            upstream_url: None,
            upstream_timeout: Duration::from_secs(30),
        }
    }
}

/// Shared server state
pub struct ServerState {
    pub config: ServerConfig,
    pub cache: Arc<DiskCache>,
    pub metrics: Arc<CacheMetrics>,
}

impl ServerState {
    /// Open the disk cache (and upstream proxy, if configured) described
    /// by `config`. Must be called inside a tokio runtime.
    pub fn new(config: ServerConfig) -> Result<Self> {
        let proxy = match &config.upstream_url {
            Some(url) => Some(Arc::new(
                HttpCacheProxy::new(url, config.upstream_timeout)
                    .context("failed to build upstream proxy client")?,
            ) as Arc<dyn crate::cache::CacheProxy>),
            None => None,
        };

        let cache = DiskCache::new(&config.dir, config.max_size_bytes, proxy)
            .with_context(|| format!("failed to open cache at {}", config.dir.display()))?;

        Ok(Self {
            config,
            cache,
            metrics: Arc::new(CacheMetrics::new()),
        })
    }
}

/// Start the cache server and serve until the process exits
pub async fn run_server(config: ServerConfig) -> Result<()> {
    tracing::info!("starting granary on {}", config.bind_addr);
    tracing::info!("cache root: {}", config.dir.display());
    tracing::info!("cache budget: {} bytes", config.max_size_bytes);
    if let Some(ref upstream) = config.upstream_url {
        tracing::info!("upstream proxy: {}", upstream);
    }

    let bind_addr = config.bind_addr;
    let state = Arc::new(ServerState::new(config)?);
    let app = create_router(state);

    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    tracing::info!("granary is ready to serve");
    axum::serve(listener, app).await?;
    Ok(())
}
