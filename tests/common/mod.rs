// tests/common/mod.rs
//! Shared helpers for the integration suite

use sha2::{Digest, Sha256};

/// SHA-256 of `data` in lowercase hex
pub fn sha256_hex(data: &[u8]) -> String {
    format!("{:x}", Sha256::digest(data))
}

/// A syntactically valid digest that is not the hash of anything used in
/// the tests
pub fn opaque_digest(fill: char) -> String {
    std::iter::repeat_n(fill, 64).collect()
}
