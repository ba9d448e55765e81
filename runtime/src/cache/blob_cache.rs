//! Content-addressed cache for image blobs.
//!
//! Blobs are stored by digest under `root/blobs/sha256/<hex>`, with a
//! metadata sidecar next to each blob. Every write lands in `root/tmp` first
//! and is renamed into place after its digest has been checked, so
//! concurrent builds pulling the same blob never observe partial files.

use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use sbuild_core::error::{BuildError, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;

/// Metadata for a cached blob.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlobMeta {
    /// Blob digest (e.g., "sha256:abc123...")
    pub digest: String,
    pub size_bytes: u64,
    /// When this blob was cached (Unix timestamp)
    pub cached_at: i64,
    /// Last time this blob was handed out (Unix timestamp)
    pub last_accessed: i64,
}

/// Content-addressed blob cache shared across builds.
#[derive(Debug)]
pub struct BlobCache {
    root: PathBuf,
}

impl BlobCache {
    /// Open (creating if needed) a cache rooted at `root`.
    pub fn new(root: &Path) -> Result<Self> {
        for dir in [root.join("blobs").join("sha256"), root.join("tmp")] {
            fs::create_dir_all(&dir).map_err(|e| {
                BuildError::Other(format!(
                    "Failed to create cache directory {}: {}",
                    dir.display(),
                    e
                ))
            })?;
        }
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path a blob with `digest` lives at, whether or not it is cached.
    pub fn blob_path(&self, digest: &str) -> Result<PathBuf> {
        let hex = sha256_hex(digest)?;
        Ok(self.root.join("blobs").join("sha256").join(hex))
    }

    fn meta_path(&self, digest: &str) -> Result<PathBuf> {
        let hex = sha256_hex(digest)?;
        Ok(self
            .root
            .join("blobs")
            .join("sha256")
            .join(format!("{}.meta.json", hex)))
    }

    /// Path of a cached blob, or `None` on a miss.
    pub fn get(&self, digest: &str) -> Result<Option<PathBuf>> {
        let path = self.blob_path(digest)?;
        if !path.is_file() {
            return Ok(None);
        }

        let meta_path = self.meta_path(digest)?;
        if let Ok(content) = fs::read_to_string(&meta_path) {
            if let Ok(mut meta) = serde_json::from_str::<BlobMeta>(&content) {
                meta.last_accessed = chrono::Utc::now().timestamp();
                let _ = self.write_meta(&meta);
            }
        }

        tracing::debug!(digest = %digest, "Blob cache hit");
        Ok(Some(path))
    }

    /// A scratch file on the cache filesystem, for streaming a download.
    pub fn staging_file(&self) -> Result<NamedTempFile> {
        NamedTempFile::new_in(self.root.join("tmp")).map_err(|e| {
            BuildError::Other(format!(
                "Failed to create staging file in {}: {}",
                self.root.display(),
                e
            ))
        })
    }

    /// Verify a staged download against `digest` and move it into the
    /// cache. A concurrent writer that got there first wins.
    pub fn commit(&self, digest: &str, staged: NamedTempFile) -> Result<PathBuf> {
        let actual = sha256_file(staged.path())?;
        if actual != digest {
            return Err(BuildError::Other(format!(
                "Digest mismatch for blob {}: got {}",
                digest, actual
            )));
        }
        let size_bytes = staged
            .as_file()
            .metadata()
            .map(|m| m.len())
            .unwrap_or(0);

        let dest = self.blob_path(digest)?;
        staged.persist(&dest).map_err(|e| {
            BuildError::Other(format!(
                "Failed to store blob {} in cache: {}",
                digest, e.error
            ))
        })?;

        let now = chrono::Utc::now().timestamp();
        self.write_meta(&BlobMeta {
            digest: digest.to_string(),
            size_bytes,
            cached_at: now,
            last_accessed: now,
        })?;

        tracing::debug!(digest = %digest, size_bytes, "Cached blob");
        Ok(dest)
    }

    /// Copy an existing file into the cache under `digest`.
    pub fn insert_file(&self, digest: &str, src: &Path) -> Result<PathBuf> {
        let mut staged = self.staging_file()?;
        let mut input = fs::File::open(src).map_err(|e| {
            BuildError::Other(format!("Failed to open {}: {}", src.display(), e))
        })?;
        io::copy(&mut input, staged.as_file_mut())?;
        staged.as_file_mut().flush()?;
        self.commit(digest, staged)
    }

    /// Materialize a cached blob at `dest`, by hard link when possible.
    pub fn copy_to(&self, digest: &str, dest: &Path) -> Result<()> {
        let src = self.blob_path(digest)?;
        if dest.exists() {
            fs::remove_file(dest)?;
        }
        if fs::hard_link(&src, dest).is_ok() {
            return Ok(());
        }
        fs::copy(&src, dest).map_err(|e| {
            BuildError::Other(format!(
                "Failed to copy cached blob {} to {}: {}",
                digest,
                dest.display(),
                e
            ))
        })?;
        Ok(())
    }

    /// All cached blob entries.
    pub fn list_entries(&self) -> Result<Vec<BlobMeta>> {
        let dir = self.root.join("blobs").join("sha256");
        let read_dir = fs::read_dir(&dir).map_err(|e| {
            BuildError::Other(format!(
                "Failed to read cache directory {}: {}",
                dir.display(),
                e
            ))
        })?;

        let mut entries = Vec::new();
        for entry in read_dir.flatten() {
            let path = entry.path();
            let is_meta = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.ends_with(".meta.json"));
            if !is_meta {
                continue;
            }
            if let Ok(content) = fs::read_to_string(&path) {
                if let Ok(meta) = serde_json::from_str::<BlobMeta>(&content) {
                    entries.push(meta);
                }
            }
        }
        Ok(entries)
    }

    /// Total size of all cached blobs in bytes.
    pub fn total_size(&self) -> Result<u64> {
        Ok(self.list_entries()?.iter().map(|e| e.size_bytes).sum())
    }

    fn write_meta(&self, meta: &BlobMeta) -> Result<()> {
        let path = self.meta_path(&meta.digest)?;
        let mut tmp = self.staging_file()?;
        tmp.write_all(serde_json::to_string_pretty(meta)?.as_bytes())?;
        tmp.persist(&path).map_err(|e| {
            BuildError::Other(format!(
                "Failed to write blob metadata {}: {}",
                path.display(),
                e.error
            ))
        })?;
        Ok(())
    }
}

/// Hex part of a `sha256:<hex>` digest, validated.
pub fn sha256_hex(digest: &str) -> Result<&str> {
    let hex = digest.strip_prefix("sha256:").ok_or_else(|| {
        BuildError::Other(format!("Unsupported digest algorithm in '{}'", digest))
    })?;
    if hex.len() != 64 || !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(BuildError::Other(format!("Malformed digest '{}'", digest)));
    }
    Ok(hex)
}

/// `sha256:<hex>` digest of a file's content.
pub fn sha256_file(path: &Path) -> Result<String> {
    let mut file = fs::File::open(path).map_err(|e| {
        BuildError::Other(format!("Failed to open {}: {}", path.display(), e))
    })?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("sha256:{}", hex::encode(hasher.finalize())))
}

/// `sha256:<hex>` digest of a byte slice.
pub fn sha256_bytes(data: &[u8]) -> String {
    format!("sha256:{}", hex::encode(Sha256::digest(data)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_miss_then_hit() {
        let tmp = TempDir::new().unwrap();
        let cache = BlobCache::new(tmp.path()).unwrap();
        let digest = sha256_bytes(b"layer-bytes");

        assert!(cache.get(&digest).unwrap().is_none());

        let mut staged = cache.staging_file().unwrap();
        staged.write_all(b"layer-bytes").unwrap();
        let path = cache.commit(&digest, staged).unwrap();

        assert_eq!(cache.get(&digest).unwrap(), Some(path.clone()));
        assert_eq!(fs::read(path).unwrap(), b"layer-bytes");
        assert_eq!(cache.total_size().unwrap(), 11);
    }

    #[test]
    fn test_commit_rejects_digest_mismatch() {
        let tmp = TempDir::new().unwrap();
        let cache = BlobCache::new(tmp.path()).unwrap();
        let digest = sha256_bytes(b"expected");

        let mut staged = cache.staging_file().unwrap();
        staged.write_all(b"tampered").unwrap();
        let err = cache.commit(&digest, staged).unwrap_err();
        assert!(err.to_string().contains("Digest mismatch"));
        assert!(cache.get(&digest).unwrap().is_none());
    }

    #[test]
    fn test_insert_and_copy_to() {
        let tmp = TempDir::new().unwrap();
        let cache = BlobCache::new(&tmp.path().join("cache")).unwrap();
        let src = tmp.path().join("blob");
        fs::write(&src, b"config").unwrap();
        let digest = sha256_bytes(b"config");

        cache.insert_file(&digest, &src).unwrap();
        let dest = tmp.path().join("out");
        cache.copy_to(&digest, &dest).unwrap();
        cache.copy_to(&digest, &dest).unwrap();
        assert_eq!(fs::read(dest).unwrap(), b"config");
    }

    #[test]
    fn test_malformed_digest() {
        assert!(sha256_hex("md5:abc").is_err());
        assert!(sha256_hex("sha256:xyz").is_err());
        assert!(sha256_hex(&sha256_bytes(b"")).is_ok());
    }

    #[test]
    fn test_sha256_file_matches_bytes() {
        let tmp = TempDir::new().unwrap();
        let p = tmp.path().join("f");
        fs::write(&p, b"hello").unwrap();
        assert_eq!(sha256_file(&p).unwrap(), sha256_bytes(b"hello"));
    }
}
