// src/cache/mod.rs
//! Content-addressed blob cache
//!
//! This module implements the storage engine behind the cache server:
//! - Three keyspaces: CAS (content-verified), AC (action results), RAW
//! - A size-bounded LRU index with deterministic eviction
//! - Atomic uploads via temp-file + rename
//! - Optional read-through/write-through against an upstream proxy
//!
//! Blobs live at `{root}/{kind}/{xy}/{digest}` where `xy` is the first two
//! hex characters of the digest. The two-character fan-out keeps any one
//! directory small and bounds the shard count per kind at 65,536.

mod action;
mod disk;
mod lru;
pub mod proto;
mod proxy;

pub use disk::{DiskCache, LruEntry};
pub use lru::{EvictionCallback, SizedLru, SizedValue};
pub use proxy::{
    CacheProxy, HttpCacheProxy, ProxyReader, UploadDescriptor, MAX_QUEUED_UPLOADS,
    NUM_UPLOAD_WORKERS,
};

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Length of a SHA-256 digest in lowercase hex
pub const DIGEST_HEX_LEN: usize = 64;

/// The keyspace a blob belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryKind {
    /// Content-Addressable Store: keys are the SHA-256 of the bytes,
    /// verified on upload
    Cas,
    /// Action Cache: keys are opaque action digests, payloads are
    /// serialized ActionResult messages
    Ac,
    /// Raw keyspace for auxiliary blobs (reserved)
    Raw,
}

impl EntryKind {
    /// Path component used for this kind on disk and on the wire
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cas => "cas",
            Self::Ac => "ac",
            Self::Raw => "raw",
        }
    }

    /// All kinds, in directory-creation order
    pub fn all() -> [EntryKind; 3] {
        [Self::Cas, Self::Ac, Self::Raw]
    }
}

impl fmt::Display for EntryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntryKind {
    type Err = ();

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "cas" => Ok(Self::Cas),
            "ac" => Ok(Self::Ac),
            "raw" => Ok(Self::Raw),
            _ => Err(()),
        }
    }
}

/// Validate digest format: 64 lowercase hex characters.
///
/// Full digest semantics are the front-end's responsibility; this check
/// exists to catch malformed keys before they touch the filesystem.
pub fn is_valid_digest(digest: &str) -> bool {
    digest.len() == DIGEST_HEX_LEN
        && digest
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

/// Index key for a blob: `{kind}/{xy}/{digest}`
pub fn cache_key(kind: EntryKind, digest: &str) -> String {
    format!("{}/{}/{}", kind.as_str(), &digest[..2], digest)
}

/// Absolute path of a blob's final file under `root`
pub fn blob_path(root: &Path, kind: EntryKind, digest: &str) -> PathBuf {
    root.join(kind.as_str()).join(&digest[..2]).join(digest)
}

/// Sibling temp path used while an upload is in flight
pub fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_digest() {
        let d = "a".repeat(64);
        assert!(is_valid_digest(&d));
        assert!(is_valid_digest(
            "0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcdef"
        ));
    }

    #[test]
    fn test_invalid_digest() {
        assert!(!is_valid_digest(""));
        assert!(!is_valid_digest("abc123"));
        // Uppercase hex is rejected
        assert!(!is_valid_digest(&"A".repeat(64)));
        // Non-hex characters
        assert!(!is_valid_digest(&"g".repeat(64)));
        // Too long
        assert!(!is_valid_digest(&"a".repeat(65)));
    }

    #[test]
    fn test_cache_key_layout() {
        let digest = "deadbeef".to_owned() + &"0".repeat(56);
        assert_eq!(
            cache_key(EntryKind::Cas, &digest),
            format!("cas/de/{digest}")
        );
        assert_eq!(cache_key(EntryKind::Ac, &digest), format!("ac/de/{digest}"));
    }

    #[test]
    fn test_blob_and_temp_path() {
        let digest = "ab".to_owned() + &"1".repeat(62);
        let path = blob_path(Path::new("/cache"), EntryKind::Raw, &digest);
        assert_eq!(path, PathBuf::from(format!("/cache/raw/ab/{digest}")));
        assert_eq!(
            temp_path(&path),
            PathBuf::from(format!("/cache/raw/ab/{digest}.tmp"))
        );
    }

    #[test]
    fn test_kind_round_trip() {
        for kind in EntryKind::all() {
            assert_eq!(kind.as_str().parse::<EntryKind>(), Ok(kind));
        }
        assert!("chunks".parse::<EntryKind>().is_err());
    }
}
