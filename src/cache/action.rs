// src/cache/action.rs
//! Action-result validation
//!
//! An action cache hit is only usable if every CAS blob it references is
//! still present; eviction can orphan an ActionResult without touching it.
//! The validator walks the result's referents and reports a stale entry as
//! a plain miss, so clients fall back to re-execution instead of failing
//! on a dangling digest.

use crate::cache::disk::DiskCache;
use crate::cache::proto::{ActionResult, Directory, Tree};
use crate::cache::EntryKind;
use crate::error::{CacheError, Result};
use prost::Message;
use tokio::io::AsyncReadExt;

impl DiskCache {
    /// Look up `digest` in the action cache and return the decoded
    /// `ActionResult` with its raw bytes, but only if every referenced CAS
    /// blob is present locally.
    ///
    /// A missing referent (or a missing AC entry) returns `Ok(None)`; the
    /// stale entry is left in place for normal eviction. Decode and I/O
    /// failures are errors.
    pub async fn get_validated_action_result(
        &self,
        digest: &str,
    ) -> Result<Option<(ActionResult, Vec<u8>)>> {
        let Some((mut reader, size)) = self.get(EntryKind::Ac, digest).await? else {
            return Ok(None);
        };
        if size <= 0 {
            return Ok(None);
        }

        let mut payload = Vec::with_capacity(size as usize);
        reader.read_to_end(&mut payload).await?;
        let result = ActionResult::decode(payload.as_slice())?;

        for file in &result.output_files {
            if let Some(file_digest) = &file.digest
                && file.contents.is_empty()
                && file_digest.size_bytes > 0
                && !self.cas_contains(&file_digest.hash).await
            {
                return Ok(None);
            }
        }

        for dir in &result.output_directories {
            let Some(tree_digest) = &dir.tree_digest else {
                continue;
            };
            let Some((mut tree_reader, tree_size)) =
                self.get(EntryKind::Cas, &tree_digest.hash).await?
            else {
                return Ok(None);
            };
            if tree_size != tree_digest.size_bytes {
                return Err(CacheError::SizeMismatch {
                    expected: tree_digest.size_bytes,
                    actual: tree_size,
                });
            }

            let mut tree_bytes = Vec::with_capacity(tree_size as usize);
            tree_reader.read_to_end(&mut tree_bytes).await?;
            let tree = Tree::decode(tree_bytes.as_slice())?;

            if let Some(root) = &tree.root
                && !self.directory_files_present(root).await
            {
                return Ok(None);
            }
            for child in &tree.children {
                if !self.directory_files_present(child).await {
                    return Ok(None);
                }
            }
        }

        if let Some(stdout) = &result.stdout_digest
            && stdout.size_bytes > 0
            && !self.cas_contains(&stdout.hash).await
        {
            return Ok(None);
        }
        if let Some(stderr) = &result.stderr_digest
            && stderr.size_bytes > 0
            && !self.cas_contains(&stderr.hash).await
        {
            return Ok(None);
        }

        Ok(Some((result, payload)))
    }

    /// Check CAS presence for every file digest in one directory level
    async fn directory_files_present(&self, dir: &Directory) -> bool {
        for file in &dir.files {
            if let Some(file_digest) = &file.digest
                && !self.cas_contains(&file_digest.hash).await
            {
                return false;
            }
        }
        true
    }

    async fn cas_contains(&self, digest: &str) -> bool {
        let (found, _) = self.contains(EntryKind::Cas, digest).await;
        found
    }
}
