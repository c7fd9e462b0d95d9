// src/cache/disk.rs
//! Filesystem-backed cache engine with LRU eviction
//!
//! The engine coordinates an in-memory size-bounded index with on-disk blob
//! files. A single mutex guards the index; it is never held across an await
//! point. Blob bodies are streamed to a `.tmp` sibling outside the mutex and
//! renamed into place, so readers never observe partial blobs: an index
//! entry starts uncommitted and flips to committed only after the rename.
//!
//! On a local miss with an upstream proxy configured, a zero-sized
//! uncommitted placeholder reserves the key while the fetch runs without
//! the mutex. The placeholder is replaced with the real size on success and
//! removed on any failure.

use crate::cache::lru::{EvictionCallback, SizedLru, SizedValue};
use crate::cache::proxy::{self, CacheProxy, UploadDescriptor};
use crate::cache::{
    blob_path, cache_key, is_valid_digest, temp_path, EntryKind, DIGEST_HEX_LEN,
};
use crate::error::{CacheError, Result};
use sha2::{Digest as _, Sha256};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::time::SystemTime;
use tokio::fs::{self, File};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

const COPY_BUF_SIZE: usize = 64 * 1024;

/// Index record for one blob
#[derive(Debug, Clone, Copy)]
pub struct LruEntry {
    /// Declared size for uploads, actual size once committed. A zero-sized
    /// uncommitted entry is the placeholder for an in-flight proxy fetch.
    pub size: i64,
    /// True once the final file exists on disk
    pub committed: bool,
}

impl SizedValue for LruEntry {
    fn size(&self) -> i64 {
        self.size
    }
}

/// Filesystem-based cache with an optional upstream proxy.
///
/// Safe for concurrent use; every operation may be called from any task.
pub struct DiskCache {
    root: PathBuf,
    index: Mutex<SizedLru<LruEntry>>,
    proxy: Option<Arc<dyn CacheProxy>>,
    upload_tx: OnceLock<mpsc::Sender<UploadDescriptor>>,
}

impl DiskCache {
    /// Open (or create) a cache rooted at `root` holding at most
    /// `max_size_bytes` bytes.
    ///
    /// Creates the shard directory structure, migrates any legacy flat
    /// layout, and rebuilds the LRU index from the files already on disk in
    /// access-time order. When `proxy` is given, a pool of write-through
    /// upload workers is spawned; in that case the caller must be running
    /// inside a tokio runtime.
    pub fn new(
        root: impl Into<PathBuf>,
        max_size_bytes: i64,
        proxy: Option<Arc<dyn CacheProxy>>,
    ) -> Result<Arc<Self>> {
        let root = root.into();
        create_shard_dirs(&root)?;
        migrate_flat_layout(&root)?;

        let evict_root = root.clone();
        let on_evict: EvictionCallback<LruEntry> =
            Box::new(move |key, entry| remove_evicted(&evict_root, key, entry));

        let cache = Arc::new(Self {
            root,
            index: Mutex::new(SizedLru::new(max_size_bytes, Some(on_evict))),
            proxy,
            upload_tx: OnceLock::new(),
        });
        cache.restore_index()?;

        if let Some(remote) = cache.proxy.clone() {
            let tx = proxy::spawn_upload_workers(&cache, remote);
            let _ = cache.upload_tx.set(tx);
        }
        Ok(cache)
    }

    /// Store `expected_size` bytes from `reader` under `(kind, digest)`.
    ///
    /// For CAS entries the stream is hashed while copying and the result
    /// must equal `digest`. If an upload of the same key is already in
    /// flight, the reader is drained and the call succeeds without writing;
    /// the first upload wins. Overwriting a committed entry is allowed.
    pub async fn put<R>(
        &self,
        kind: EntryKind,
        digest: &str,
        expected_size: i64,
        mut reader: R,
    ) -> Result<()>
    where
        R: AsyncRead + Unpin,
    {
        if !is_valid_digest(digest) {
            return Err(CacheError::InvalidDigest {
                digest: digest.to_string(),
                expected: DIGEST_HEX_LEN,
            });
        }
        let key = cache_key(kind, digest);

        let in_flight = {
            let mut index = self.lock_index();
            index.get(&key).is_some_and(|existing| !existing.committed)
        };
        if in_flight {
            // Another upload of this key is in flight; it wins, and we
            // discard this stream after releasing the lock.
            tokio::io::copy(&mut reader, &mut tokio::io::sink()).await?;
            return Ok(());
        }
        let (added, max_size) = {
            let mut index = self.lock_index();
            let added = index.add(
                &key,
                LruEntry {
                    size: expected_size,
                    committed: false,
                },
            );
            let max_size = index.max_size();
            (added, max_size)
        };
        if !added {
            return Err(CacheError::TooBig {
                size: expected_size,
                max_size,
            });
        }

        let final_path = blob_path(&self.root, kind, digest);
        let verify = (kind == EntryKind::Cas).then_some(digest);
        match self
            .write_and_rename(&final_path, expected_size, verify, &mut reader)
            .await
        {
            Ok(()) => {
                {
                    let mut index = self.lock_index();
                    // The entry can have been evicted while we were copying;
                    // in that case there is nothing left to commit.
                    if let Some(entry) = index.peek_mut(&key) {
                        entry.committed = true;
                    }
                }
                self.offer_upload(kind, digest);
                Ok(())
            }
            Err(err) => {
                self.lock_index().remove(&key);
                let _ = fs::remove_file(temp_path(&final_path)).await;
                Err(err)
            }
        }
    }

    /// Open the blob stored under `(kind, digest)`.
    ///
    /// Returns the file and its size, or `None` if the blob is absent (an
    /// uncommitted in-flight upload reads as absent). On a miss with a proxy
    /// configured, the blob is fetched from upstream, committed locally, and
    /// served from disk.
    pub async fn get(&self, kind: EntryKind, digest: &str) -> Result<Option<(File, i64)>> {
        if !is_valid_digest(digest) {
            return Err(CacheError::InvalidDigest {
                digest: digest.to_string(),
                expected: DIGEST_HEX_LEN,
            });
        }
        let key = cache_key(kind, digest);
        let (available, try_proxy) = self.available_or_try_proxy(&key);
        let final_path = blob_path(&self.root, kind, digest);

        if available {
            let meta = fs::metadata(&final_path).await?;
            let file = File::open(&final_path).await?;
            return Ok(Some((file, meta.len() as i64)));
        }
        if !try_proxy {
            return Ok(None);
        }
        let Some(remote) = &self.proxy else {
            return Ok(None);
        };

        // We hold a placeholder for this key; every exit below must either
        // replace it with the committed entry or remove it.
        debug!("read-through fetch of {} from upstream", key);
        let (mut reader, found_size) = match remote.get(kind, digest).await {
            Ok(Some(found)) => found,
            Ok(None) => {
                self.lock_index().remove(&key);
                return Ok(None);
            }
            Err(err) => {
                self.lock_index().remove(&key);
                return Err(err);
            }
        };

        match self
            .write_and_rename(&final_path, found_size, None, &mut reader)
            .await
        {
            Ok(()) => {
                // Replace the placeholder through add so current_size picks
                // up the real size; this insertion may evict to make room.
                let added = self.lock_index().add(
                    &key,
                    LruEntry {
                        size: found_size,
                        committed: true,
                    },
                );
                if !added {
                    let _ = fs::remove_file(&final_path).await;
                    return Err(CacheError::TooBig {
                        size: found_size,
                        max_size: self.max_size(),
                    });
                }
                let file = File::open(&final_path).await?;
                Ok(Some((file, found_size)))
            }
            Err(err) => {
                self.lock_index().remove(&key);
                let _ = fs::remove_file(temp_path(&final_path)).await;
                Err(err)
            }
        }
    }

    /// Report whether `(kind, digest)` is present and its size.
    ///
    /// Only committed entries count as present; an in-flight upload reports
    /// `(false, -1)`. A key with no entry at all is delegated to the proxy
    /// when one is configured. `-1` means the size is unknown.
    pub async fn contains(&self, kind: EntryKind, digest: &str) -> (bool, i64) {
        if !is_valid_digest(digest) {
            return (false, -1);
        }

        enum Local {
            Committed(i64),
            Uncommitted,
            Absent,
        }
        let local = {
            let mut index = self.lock_index();
            match index.get(&cache_key(kind, digest)) {
                Some(entry) if entry.committed => Local::Committed(entry.size),
                Some(_) => Local::Uncommitted,
                None => Local::Absent,
            }
        };
        match local {
            Local::Committed(size) => (true, size),
            Local::Uncommitted => (false, -1),
            Local::Absent => match &self.proxy {
                Some(remote) => remote.contains(kind, digest).await,
                None => (false, -1),
            },
        }
    }

    /// Maximum cache size in bytes
    pub fn max_size(&self) -> i64 {
        self.lock_index().max_size()
    }

    /// Current size in bytes and number of indexed items
    pub fn stats(&self) -> (i64, usize) {
        let index = self.lock_index();
        (index.current_size(), index.len())
    }

    /// Cache root directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn lock_index(&self) -> MutexGuard<'_, SizedLru<LruEntry>> {
        self.index.lock().expect("cache index lock poisoned")
    }

    /// Single locked step of `get`: report whether the key is committed
    /// locally, and otherwise reserve a placeholder if a proxy fetch is
    /// worth attempting. When `try_proxy` comes back true the caller owns
    /// the placeholder and must replace or remove it.
    fn available_or_try_proxy(&self, key: &str) -> (bool, bool) {
        let mut index = self.lock_index();
        if let Some(entry) = index.get(key) {
            // An uncommitted entry means an upload is in flight; that is a
            // miss, and not one the proxy may fill.
            return (entry.committed, false);
        }
        if self.proxy.is_none() {
            return (false, false);
        }
        let reserved = index.add(
            key,
            LruEntry {
                size: 0,
                committed: false,
            },
        );
        (false, reserved)
    }

    /// Stream `reader` to `{final_path}.tmp`, then fsync and rename into
    /// place. With `verify_digest` set, the copy is hashed and must match.
    /// The byte count must equal `expected_size`. On error the temp file is
    /// left for the caller to unlink.
    async fn write_and_rename(
        &self,
        final_path: &Path,
        expected_size: i64,
        verify_digest: Option<&str>,
        reader: &mut (impl AsyncRead + Unpin),
    ) -> Result<()> {
        let tmp = temp_path(final_path);
        let mut file = File::create(&tmp).await?;
        let mut hasher = verify_digest.map(|_| Sha256::new());
        let mut copied: i64 = 0;
        let mut buf = vec![0u8; COPY_BUF_SIZE];
        loop {
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            if let Some(h) = &mut hasher {
                h.update(&buf[..n]);
            }
            file.write_all(&buf[..n]).await?;
            copied += n as i64;
        }
        file.sync_all().await?;
        drop(file);

        if copied != expected_size {
            return Err(CacheError::SizeMismatch {
                expected: expected_size,
                actual: copied,
            });
        }
        if let (Some(expected), Some(hasher)) = (verify_digest, hasher) {
            let actual = format!("{:x}", hasher.finalize());
            if actual != expected {
                return Err(CacheError::HashMismatch {
                    expected: expected.to_string(),
                    actual,
                });
            }
        }
        fs::rename(&tmp, final_path).await?;
        Ok(())
    }

    /// Hand a committed blob to the write-through queue. Best-effort: a
    /// full queue drops the upload and the local result stands.
    fn offer_upload(&self, kind: EntryKind, digest: &str) {
        let Some(tx) = self.upload_tx.get() else {
            return;
        };
        let descriptor = UploadDescriptor {
            kind,
            digest: digest.to_string(),
        };
        if tx.try_send(descriptor).is_err() {
            warn!("write-through queue full, dropping upload of {}/{}", kind, digest);
        }
    }

    /// Rebuild the index from the files under the root, coldest first, so
    /// eviction order survives restarts.
    fn restore_index(&self) -> Result<()> {
        info!("loading existing files in {}", self.root.display());

        let mut files: Vec<(String, i64, SystemTime)> = Vec::new();
        for entry in WalkDir::new(&self.root) {
            let entry = entry.map_err(std::io::Error::other)?;
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "tmp") {
                // Leftover of an upload interrupted by a crash.
                warn!("removing stale temp file {}", path.display());
                std::fs::remove_file(path)?;
                continue;
            }
            let Ok(rel) = path.strip_prefix(&self.root) else {
                continue;
            };
            let Some(rel) = rel.to_str() else {
                continue;
            };
            let meta = entry.metadata().map_err(std::io::Error::other)?;
            // noatime mounts report a useless access time; fall back to
            // the modification time so the sort stays deterministic.
            let atime = meta
                .accessed()
                .or_else(|_| meta.modified())
                .unwrap_or(SystemTime::UNIX_EPOCH);
            files.push((rel.to_string(), meta.len() as i64, atime));
        }

        files.sort_by_key(|&(_, _, atime)| atime);

        let mut index = self.lock_index();
        for (key, size, _) in files {
            let added = index.add(
                &key,
                LruEntry {
                    size,
                    committed: true,
                },
            );
            if !added {
                // A single file bigger than the whole budget.
                warn!("removing over-budget cache file {}", key);
                std::fs::remove_file(self.root.join(&key))?;
            }
        }
        info!(
            current_size = index.current_size(),
            num_items = index.len(),
            "finished loading disk cache"
        );
        Ok(())
    }
}

/// Pre-create the 256 two-hex-character shard directories for each kind
fn create_shard_dirs(root: &Path) -> std::io::Result<()> {
    const HEX: &[u8] = b"0123456789abcdef";
    for kind in EntryKind::all() {
        let kind_dir = root.join(kind.as_str());
        for a in HEX {
            for b in HEX {
                let shard = kind_dir.join(format!("{}{}", *a as char, *b as char));
                std::fs::create_dir_all(&shard)?;
            }
        }
    }
    Ok(())
}

/// Move files from the legacy flat layout `{root}/{kind}/{digest}` into
/// their two-character shard. Any failure aborts startup; a mixed layout
/// would serve misses for blobs that are actually present.
fn migrate_flat_layout(root: &Path) -> Result<()> {
    for kind in EntryKind::all() {
        let dir = root.join(kind.as_str());
        debug!("migrating legacy entries (if any) in {}", dir.display());
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if name.len() < 2 || !name.is_ascii() {
                continue;
            }
            let target = dir.join(&name[..2]).join(name);
            std::fs::rename(entry.path(), &target)?;
        }
    }
    Ok(())
}

/// Eviction callback: delete the evicted entry's file(s). Runs with the
/// index lock held, so it must stay cheap and must not re-enter the index.
fn remove_evicted(root: &Path, key: &str, entry: &LruEntry) {
    let final_path = root.join(key);

    if entry.committed {
        if let Err(err) = std::fs::remove_file(&final_path) {
            warn!(
                "failed to remove evicted cache file {}: {}",
                final_path.display(),
                err
            );
        }
        return;
    }

    // The evicted entry has an upload in flight. The rename from the temp
    // sibling happens outside the lock, so remove the temp file first and
    // then the final path; at least one of the two should exist.
    let tmp = temp_path(&final_path);
    let tmp_err = std::fs::remove_file(&tmp).err();
    let final_err = std::fs::remove_file(&final_path).err();
    if let (Some(tmp_err), Some(final_err)) = (tmp_err, final_err) {
        if tmp_err.kind() == ErrorKind::NotFound && final_err.kind() == ErrorKind::NotFound {
            // Uploads start at the most-recently-used end; reaching the
            // eviction candidate while still copying means the budget is
            // small relative to the in-flight upload volume.
            warn!(
                "evicted in-flight entry {} had no file to remove; \
                 the cache may be undersized",
                key
            );
        } else {
            warn!(
                "failed to remove evicted in-flight entry {}: {} / {}",
                key, tmp_err, final_err
            );
        }
    }
}
