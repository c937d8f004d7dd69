//! # Shared Files
//!
//! The set of local files a peer serves, plus checksum computation. The
//! set holds filesystem paths; lookup is by bare file name, first match
//! wins. Checksums are SHA-256 over the file bytes, hex-encoded, computed
//! per request so the value always matches what is actually on disk at
//! transfer time.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use sha2::{Digest, Sha256};
use tokio::io::AsyncReadExt;

use crate::error::{Result, ShoalError};
use crate::resilience::retry::{retry, RetryPolicy};

/// Read buffer for checksum and transfer streaming.
pub const FILE_CHUNK_BYTES: usize = 64 * 1024;

/// The thread-safe shared-file set.
#[derive(Default)]
pub struct SharedFiles {
    paths: RwLock<BTreeSet<PathBuf>>,
}

impl SharedFiles {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a path to the shared set. The file must exist and be a
    /// regular file; the stored path is canonicalized so later lookups
    /// and size checks cannot be confused by `..` segments.
    pub fn add(&self, path: impl AsRef<Path>) -> Result<PathBuf> {
        let path = path.as_ref();
        let canonical = path.canonicalize().map_err(|e| {
            ShoalError::NotFound(format!("cannot share '{}': {e}", path.display()))
        })?;
        if !canonical.is_file() {
            return Err(ShoalError::InvalidArgument(format!(
                "'{}' is not a regular file",
                canonical.display()
            )));
        }
        self.paths.write().insert(canonical.clone());
        Ok(canonical)
    }

    pub fn remove(&self, path: impl AsRef<Path>) -> bool {
        self.paths.write().remove(path.as_ref())
    }

    /// First shared path whose file name equals `name`.
    pub fn lookup(&self, name: &str) -> Option<PathBuf> {
        self.paths
            .read()
            .iter()
            .find(|p| p.file_name().map(|f| f == name).unwrap_or(false))
            .cloned()
    }

    pub fn count(&self) -> usize {
        self.paths.read().len()
    }

    pub fn list(&self) -> Vec<PathBuf> {
        self.paths.read().iter().cloned().collect()
    }
}

/// SHA-256 of a file's contents, hex-encoded.
///
/// Streams in chunks so a multi-gigabyte file does not need a
/// multi-gigabyte buffer. Transient I/O failures (the file lives on a
/// network mount more often than anyone admits) are retried briefly
/// before the error surfaces.
pub async fn checksum(path: &Path) -> Result<String> {
    let policy = RetryPolicy {
        max_attempts: 3,
        initial_backoff: std::time::Duration::from_millis(50),
        max_backoff: std::time::Duration::from_millis(500),
        ..RetryPolicy::default()
    };

    retry(&policy, |_| async move {
        let mut file = tokio::fs::File::open(path).await?;
        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; FILE_CHUNK_BYTES];
        loop {
            let n = file.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        Ok(hex::encode(hasher.finalize()))
    })
    .await
}

/// SHA-256 of an in-memory buffer, hex-encoded. The client side verifies
/// downloads with this.
pub fn checksum_bytes(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn temp_file(dir: &tempfile::TempDir, name: &str, content: &[u8]) -> PathBuf {
        let path = dir.path().join(name);
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(content).unwrap();
        path
    }

    #[test]
    fn add_lookup_remove() {
        let dir = tempfile::tempdir().unwrap();
        let path = temp_file(&dir, "x.txt", b"hello");

        let files = SharedFiles::new();
        let stored = files.add(&path).unwrap();
        assert_eq!(files.count(), 1);

        let found = files.lookup("x.txt").unwrap();
        assert_eq!(found, stored);
        assert!(files.lookup("y.txt").is_none());

        assert!(files.remove(&stored));
        assert_eq!(files.count(), 0);
    }

    #[test]
    fn add_rejects_missing_and_non_files() {
        let dir = tempfile::tempdir().unwrap();
        let files = SharedFiles::new();

        assert!(matches!(
            files.add(dir.path().join("ghost.txt")),
            Err(ShoalError::NotFound(_))
        ));
        assert!(matches!(
            files.add(dir.path()),
            Err(ShoalError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn checksum_matches_known_vector() {
        let dir = tempfile::tempdir().unwrap();
        let path = temp_file(&dir, "hello.txt", b"hello");

        let sum = checksum(&path).await.unwrap();
        // SHA-256("hello")
        assert_eq!(
            sum,
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
        assert_eq!(checksum_bytes(b"hello"), sum);
    }

    #[tokio::test]
    async fn checksum_of_missing_file_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let err = checksum(&dir.path().join("ghost.bin")).await.unwrap_err();
        assert!(matches!(err, ShoalError::NotFound(_)));
    }

    #[tokio::test]
    async fn checksum_streams_large_files() {
        let dir = tempfile::tempdir().unwrap();
        let content = vec![0xabu8; FILE_CHUNK_BYTES * 3 + 17];
        let path = temp_file(&dir, "big.bin", &content);

        let sum = checksum(&path).await.unwrap();
        assert_eq!(sum, checksum_bytes(&content));
    }
}
