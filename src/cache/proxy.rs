// src/cache/proxy.rs
//! Upstream proxy contract and HTTP transport
//!
//! The disk engine talks to an upstream cache through the [`CacheProxy`]
//! trait: read-through on local miss, asynchronous write-through after
//! local commit. Write-through goes over a bounded queue drained by a fixed
//! pool of workers, so client latency never waits on the upstream; a full
//! queue drops the upload with a warning, which is the back-pressure
//! policy.

use crate::cache::disk::DiskCache;
use crate::cache::EntryKind;
use crate::error::{CacheError, Result};
use async_trait::async_trait;
use futures::StreamExt;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::io::AsyncRead;
use tokio::sync::mpsc;
use tokio_util::io::{ReaderStream, StreamReader};
use tracing::{debug, warn};

/// Number of write-through upload workers
pub const NUM_UPLOAD_WORKERS: usize = 100;

/// Capacity of the pending-upload queue
pub const MAX_QUEUED_UPLOADS: usize = 10_000;

/// Streaming body returned by a proxy read
pub type ProxyReader = Box<dyn AsyncRead + Send + Unpin>;

/// A committed blob waiting for write-through
#[derive(Debug, Clone)]
pub struct UploadDescriptor {
    pub kind: EntryKind,
    pub digest: String,
}

/// An upstream blob cache.
///
/// `get` returns `Ok(None)` when the upstream definitely does not have the
/// blob; transport failures and unexpected statuses are errors so the
/// caller can tell "absent" from "broken".
#[async_trait]
pub trait CacheProxy: Send + Sync {
    /// Fetch a blob, returning its body and size on a hit
    async fn get(&self, kind: EntryKind, digest: &str) -> Result<Option<(ProxyReader, i64)>>;

    /// Store a committed blob upstream
    async fn put(&self, kind: EntryKind, digest: &str, size: i64, body: tokio::fs::File)
        -> Result<()>;

    /// Report upstream presence and size (`-1` when unknown)
    async fn contains(&self, kind: EntryKind, digest: &str) -> (bool, i64);
}

/// HTTP implementation of the proxy contract.
///
/// Blobs live at `{base_url}/{kind}/{digest}`, the same layout this server
/// exposes, so instances chain naturally.
pub struct HttpCacheProxy {
    client: reqwest::Client,
    base_url: String,
}

impl HttpCacheProxy {
    /// Build a proxy against `base_url` with the given request timeout
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("granary/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|err| CacheError::proxy(err.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn blob_url(&self, kind: EntryKind, digest: &str) -> String {
        format!("{}/{}/{}", self.base_url, kind.as_str(), digest)
    }
}

#[async_trait]
impl CacheProxy for HttpCacheProxy {
    async fn get(&self, kind: EntryKind, digest: &str) -> Result<Option<(ProxyReader, i64)>> {
        let url = self.blob_url(kind, digest);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|err| CacheError::proxy(err.to_string()))?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(CacheError::proxy(format!("GET {url} returned {status}")));
        }
        let size = response
            .content_length()
            .ok_or_else(|| CacheError::proxy(format!("GET {url} missing Content-Length")))?;

        let stream = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(std::io::Error::other))
            .boxed();
        let reader: ProxyReader = Box::new(StreamReader::new(stream));
        Ok(Some((reader, size as i64)))
    }

    async fn put(
        &self,
        kind: EntryKind,
        digest: &str,
        size: i64,
        body: tokio::fs::File,
    ) -> Result<()> {
        let url = self.blob_url(kind, digest);
        let response = self
            .client
            .put(&url)
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .header(reqwest::header::CONTENT_LENGTH, size)
            .body(reqwest::Body::wrap_stream(ReaderStream::new(body)))
            .send()
            .await
            .map_err(|err| CacheError::proxy(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(CacheError::proxy(format!("PUT {url} returned {status}")));
        }
        debug!("write-through PUT {} ({} bytes)", url, size);
        Ok(())
    }

    async fn contains(&self, kind: EntryKind, digest: &str) -> (bool, i64) {
        let url = self.blob_url(kind, digest);
        match self.client.head(&url).send().await {
            Ok(response) if response.status().is_success() => {
                let size = response.content_length().map_or(-1, |len| len as i64);
                (true, size)
            }
            Ok(_) => (false, -1),
            Err(err) => {
                warn!("HEAD {} failed: {}", url, err);
                (false, -1)
            }
        }
    }
}

/// Spawn the write-through worker pool and hand back the queue's sender.
///
/// Workers hold only a weak reference to the cache; once the cache is
/// dropped the queue closes and the pool winds down.
pub fn spawn_upload_workers(
    cache: &Arc<DiskCache>,
    remote: Arc<dyn CacheProxy>,
) -> mpsc::Sender<UploadDescriptor> {
    let (tx, rx) = mpsc::channel(MAX_QUEUED_UPLOADS);
    let rx = Arc::new(tokio::sync::Mutex::new(rx));
    for _ in 0..NUM_UPLOAD_WORKERS {
        tokio::spawn(upload_worker(
            Arc::downgrade(cache),
            remote.clone(),
            rx.clone(),
        ));
    }
    tx
}

/// Drain the queue: re-open each committed blob through the normal read
/// path and stream it upstream. Upload failures are logged and dropped.
async fn upload_worker(
    cache: Weak<DiskCache>,
    remote: Arc<dyn CacheProxy>,
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<UploadDescriptor>>>,
) {
    loop {
        let descriptor = { rx.lock().await.recv().await };
        let Some(descriptor) = descriptor else {
            break;
        };
        let Some(cache) = cache.upgrade() else {
            break;
        };

        match cache.get(descriptor.kind, &descriptor.digest).await {
            Ok(Some((file, size))) => {
                if let Err(err) = remote
                    .put(descriptor.kind, &descriptor.digest, size, file)
                    .await
                {
                    warn!(
                        "write-through of {}/{} failed: {}",
                        descriptor.kind, descriptor.digest, err
                    );
                }
            }
            // Evicted between commit and upload; nothing to send.
            Ok(None) => {}
            Err(err) => {
                warn!(
                    "write-through could not re-open {}/{}: {}",
                    descriptor.kind, descriptor.digest, err
                );
            }
        }
    }
}
