// src/server/config.rs
//! Configuration file parsing for the cache server
//!
//! Supports a TOML configuration file with the following sections:
//! - [server] - Bind address
//! - [storage] - Cache root directory and size budget
//! - [upstream] - Optional upstream proxy
//!
//! Command-line flags override file values, which override defaults.

use crate::server::ServerConfig;
use anyhow::{Context, Result};
use serde::Deserialize;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// TOML configuration file structure
#[derive(Debug, Default, Deserialize)]
pub struct GranaryConfig {
    /// Server settings
    #[serde(default)]
    pub server: ServerSection,

    /// Storage settings
    #[serde(default)]
    pub storage: StorageSection,

    /// Upstream proxy settings
    #[serde(default)]
    pub upstream: Option<UpstreamSection>,
}

#[derive(Debug, Deserialize)]
pub struct ServerSection {
    /// Address to listen on
    #[serde(default = "default_host")]
    pub host: IpAddr,
    /// Port to listen on
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct StorageSection {
    /// Cache root directory
    pub dir: Option<PathBuf>,
    /// Maximum cache size in GiB
    pub max_size_gib: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct UpstreamSection {
    /// Base URL of the upstream cache
    pub url: String,
    /// Request timeout in seconds
    #[serde(default = "default_upstream_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_host() -> IpAddr {
    IpAddr::from([0, 0, 0, 0])
}

fn default_port() -> u16 {
    8080
}

fn default_upstream_timeout_secs() -> u64 {
    30
}

impl GranaryConfig {
    /// Load and parse a TOML configuration file
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        toml::from_str(&contents)
            .with_context(|| format!("failed to parse config file {}", path.display()))
    }

    /// Resolve the file into a [`ServerConfig`], applying command-line
    /// overrides on top. `dir` and `max_size_gib` must come from one of
    /// the two sources.
    pub fn into_server_config(
        self,
        host: Option<IpAddr>,
        port: Option<u16>,
        dir: Option<PathBuf>,
        max_size_gib: Option<i64>,
        upstream_url: Option<String>,
    ) -> Result<ServerConfig> {
        let dir = dir
            .or(self.storage.dir)
            .context("no cache directory configured: pass --dir or set [storage] dir")?;
        let max_size_gib = max_size_gib
            .or(self.storage.max_size_gib)
            .context("no cache size configured: pass --max-size or set [storage] max_size_gib")?;
        anyhow::ensure!(max_size_gib > 0, "cache size must be positive");

        let upstream_timeout =
            Duration::from_secs(self.upstream.as_ref().map_or_else(
                default_upstream_timeout_secs,
                |u| u.timeout_secs,
            ));
        let upstream_url = upstream_url.or(self.upstream.map(|u| u.url));

        Ok(ServerConfig {
            bind_addr: SocketAddr::new(
                host.unwrap_or(self.server.host),
                port.unwrap_or(self.server.port),
            ),
            dir,
            max_size_bytes: max_size_gib * 1024 * 1024 * 1024,
            upstream_url,
            upstream_timeout,
        })
    }
}
