// src/lib.rs

//! Granary Remote Build Cache
//!
//! A content-addressed blob cache for build tools, backed by the local
//! filesystem with a strict byte budget and LRU eviction.
//!
//! # Architecture
//!
//! - Three keyspaces: CAS (SHA-256 verified), AC (action results), RAW
//! - Size-bounded LRU index; eviction deletes blob files deterministically
//! - Atomic uploads: stream to `.tmp`, fsync, rename - readers never see
//!   partial blobs
//! - Optional upstream proxy: read-through on miss, asynchronous
//!   write-through after commit
//! - HTTP front-end mapping `GET`/`PUT`/`HEAD` onto the engine

pub mod cache;
mod error;
pub mod server;

pub use cache::{
    blob_path, cache_key, is_valid_digest, temp_path, CacheProxy, DiskCache, EntryKind,
    HttpCacheProxy, LruEntry, ProxyReader, SizedLru, SizedValue,
};
pub use error::{CacheError, Result};
pub use server::{run_server, GranaryConfig, ServerConfig};
