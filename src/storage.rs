//! # Content-Addressed Blob Storage
//!
//! Stores content blobs by their cryptographic digest. This is the backend
//! underneath the namespaced [`crate::metadata::ContentStore`]: one blob on
//! disk may be referenced from several namespaces, and only the metadata
//! collector decides when a blob is unreferenced.
//!
//! ## Storage Model
//!
//! ```text
//! <root>/blobs/
//! └── sha256/
//!     ├── ab/
//!     │   └── abcd1234...  (blob content)
//!     └── cd/
//!         └── cdef5678...  (blob content)
//! ```
//!
//! The first two hex characters form a "shard" directory.
//!
//! ## Keyed Locks
//!
//! Writers and the collector coordinate on a digest through a
//! [`KeyedLocker`] handed to the store at construction. Each store instance
//! owns its lock table, so two stores in one process never contend with each
//! other.
//!
//! ## Atomic Writes
//!
//! Blobs are written to a uniquely named temp file and renamed into place.

use crate::constants::BLOB_STORE_DIR;
use crate::error::{Error, Result};
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use tracing::{debug, info, warn};

// =============================================================================
// Keyed Locks
// =============================================================================

/// Held lock on one key; released on drop.
pub struct KeyGuard {
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl KeyGuard {
    /// Creates a guard that runs `release` when dropped.
    pub fn new(release: impl FnOnce() + Send + 'static) -> Self {
        Self {
            release: Some(Box::new(release)),
        }
    }
}

impl Drop for KeyGuard {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl std::fmt::Debug for KeyGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyGuard").finish_non_exhaustive()
    }
}

/// Instance-scoped mutual exclusion on string keys.
#[async_trait]
pub trait KeyedLocker: Send + Sync {
    /// Waits until `key` is free and locks it.
    async fn lock(&self, key: &str) -> Result<KeyGuard>;

    /// Locks `key` if free, otherwise fails with `Unavailable`.
    fn try_lock(&self, key: &str) -> Result<KeyGuard>;
}

#[derive(Debug, Default)]
struct LockTable {
    held: Mutex<HashSet<String>>,
    released: Notify,
}

/// In-process [`KeyedLocker`].
#[derive(Debug, Clone, Default)]
pub struct LocalLocker {
    table: Arc<LockTable>,
}

impl LocalLocker {
    /// Creates an empty lock table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn acquire(&self, key: &str) -> Result<Option<KeyGuard>> {
        let mut held = self
            .table
            .held
            .lock()
            .map_err(|_| Error::Internal("lock poisoned".to_string()))?;
        if !held.insert(key.to_string()) {
            return Ok(None);
        }
        let table = Arc::clone(&self.table);
        let key = key.to_string();
        Ok(Some(KeyGuard::new(move || {
            if let Ok(mut held) = table.held.lock() {
                held.remove(&key);
            }
            table.released.notify_waiters();
        })))
    }
}

#[async_trait]
impl KeyedLocker for LocalLocker {
    async fn lock(&self, key: &str) -> Result<KeyGuard> {
        loop {
            let released = self.table.released.notified();
            tokio::pin!(released);
            // Register before checking so a release between the check and the
            // await is not missed.
            released.as_mut().enable();
            if let Some(guard) = self.acquire(key)? {
                return Ok(guard);
            }
            released.await;
        }
    }

    fn try_lock(&self, key: &str) -> Result<KeyGuard> {
        self.acquire(key)?
            .ok_or_else(|| Error::Unavailable(format!("ref {key} is locked")))
    }
}

// =============================================================================
// Blob Store
// =============================================================================

/// Size and location of a stored blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobInfo {
    pub digest: String,
    pub size: u64,
}

/// Content-addressed blob store.
///
/// Provides deduplicated storage with:
/// - SHA-256 content verification on write
/// - Atomic write operations (crash-safe)
/// - Path traversal protection in digest handling
pub struct BlobStore {
    /// Base directory for blob storage.
    base_dir: PathBuf,
    /// Locks shared by writers and the collector.
    locker: Arc<dyn KeyedLocker>,
}

impl std::fmt::Debug for BlobStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlobStore")
            .field("base_dir", &self.base_dir)
            .finish_non_exhaustive()
    }
}

impl BlobStore {
    /// Creates a blob store under the default root.
    pub fn new() -> Result<Self> {
        Self::with_path(Self::default_path())
    }

    /// Creates a blob store at the specified path with its own lock table.
    pub fn with_path(base_dir: PathBuf) -> Result<Self> {
        Self::with_locker(base_dir, Arc::new(LocalLocker::new()))
    }

    /// Creates a blob store using the given locker.
    pub fn with_locker(base_dir: PathBuf, locker: Arc<dyn KeyedLocker>) -> Result<Self> {
        fs::create_dir_all(&base_dir).map_err(|e| Error::StorageInitFailed {
            path: base_dir.clone(),
            reason: e.to_string(),
        })?;

        info!("Blob store initialized at: {}", base_dir.display());

        Ok(Self { base_dir, locker })
    }

    fn default_path() -> PathBuf {
        if let Some(home) = dirs::home_dir() {
            home.join(".magikd").join(BLOB_STORE_DIR)
        } else {
            PathBuf::from(".magikd").join(BLOB_STORE_DIR)
        }
    }

    /// Returns the base directory.
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Returns the locker guarding digests.
    pub fn locker(&self) -> &Arc<dyn KeyedLocker> {
        &self.locker
    }

    /// Checks if a blob exists.
    pub fn has_blob(&self, digest: &str) -> bool {
        self.blob_path(digest).exists()
    }

    /// Returns size information for a blob.
    pub fn info(&self, digest: &str) -> Result<BlobInfo> {
        let meta = fs::metadata(self.blob_path(digest))
            .map_err(|_| Error::NotFound(format!("blob {digest}")))?;
        Ok(BlobInfo {
            digest: digest.to_string(),
            size: meta.len(),
        })
    }

    /// Reads a blob.
    pub fn get_blob(&self, digest: &str) -> Result<Vec<u8>> {
        fs::read(self.blob_path(digest)).map_err(|_| Error::NotFound(format!("blob {digest}")))
    }

    /// Maps a digest to its path.
    ///
    /// # Security
    ///
    /// The algorithm must be sha256, sha384 or sha512 and the hash must be
    /// hexadecimal; anything else maps to a path that cannot exist.
    pub fn blob_path(&self, digest: &str) -> PathBuf {
        let (algo, hash) = digest.split_once(':').unwrap_or(("sha256", digest));

        let safe_algo = match algo {
            "sha256" | "sha384" | "sha512" => algo,
            _ => {
                warn!("Invalid digest algorithm '{}', defaulting to sha256", algo);
                "sha256"
            }
        };

        let safe_hash: String = hash.chars().filter(|c| c.is_ascii_hexdigit()).collect();

        if safe_hash.len() != hash.len() {
            warn!(
                "Digest hash contained non-hex characters, sanitized: {} -> {}",
                hash, safe_hash
            );
        }

        if safe_hash.is_empty() {
            return self.base_dir.join("invalid").join("empty");
        }

        let prefix = &safe_hash[..2.min(safe_hash.len())];
        self.base_dir.join(safe_algo).join(prefix).join(&safe_hash)
    }

    /// Computes the sha256 digest of `data`.
    pub fn digest_of(data: &[u8]) -> String {
        format!("sha256:{}", hex::encode(Sha256::digest(data)))
    }

    /// Checks that `digest` is a well-formed `sha256:<64 hex>` digest.
    pub fn validate_digest(digest: &str) -> Result<()> {
        let valid = digest.strip_prefix("sha256:").is_some_and(|hash| {
            hash.len() == 64 && hash.chars().all(|c| matches!(c, '0'..='9' | 'a'..='f'))
        });
        if !valid {
            return Err(Error::InvalidArgument(format!("invalid digest {digest:?}")));
        }
        Ok(())
    }

    /// Stores a blob after verifying its content matches the digest.
    ///
    /// Only sha256 digests are accepted. Callers coordinating with the
    /// collector hold the digest's lock around this call.
    pub fn put_blob(&self, digest: &str, data: &[u8]) -> Result<()> {
        let (algo, expected_hash) = digest.split_once(':').unwrap_or(("sha256", digest));

        if algo != "sha256" {
            return Err(Error::InvalidArgument(format!(
                "unsupported digest algorithm '{algo}': only sha256 is supported"
            )));
        }

        let computed_hash = hex::encode(Sha256::digest(data));

        if computed_hash != expected_hash {
            return Err(Error::FailedPrecondition(format!(
                "digest mismatch: expected {expected_hash}, computed {computed_hash}"
            )));
        }

        let path = self.blob_path(digest);

        if path.exists() {
            debug!("Blob {} already exists", digest);
            return Ok(());
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| Error::StorageWriteFailed(e.to_string()))?;
        }

        // Concurrent writers of one blob use distinct temp files; the rename is
        // atomic and the content identical.
        let temp_name = format!("tmp.{}", uuid::Uuid::now_v7());
        let temp_path = path.with_extension(temp_name);
        fs::write(&temp_path, data).map_err(|e| Error::StorageWriteFailed(e.to_string()))?;
        fs::rename(&temp_path, &path).map_err(|e| {
            let _ = fs::remove_file(&temp_path);
            Error::StorageWriteFailed(e.to_string())
        })?;

        debug!("Stored blob {} ({} bytes, verified)", digest, data.len());
        Ok(())
    }

    /// Removes a blob. Removing an absent blob succeeds.
    pub fn remove_blob(&self, digest: &str) -> Result<()> {
        let path = self.blob_path(digest);
        if path.exists() {
            fs::remove_file(&path).map_err(|e| Error::StorageWriteFailed(e.to_string()))?;
        }
        Ok(())
    }

    /// Lists all blob digests.
    pub fn list_blobs(&self) -> Result<Vec<String>> {
        let mut digests = Vec::new();

        let sha256_dir = self.base_dir.join("sha256");
        if sha256_dir.exists() {
            Self::walk_dir(&sha256_dir, &mut |path| {
                if path.is_file()
                    && let Some(hash) = path.file_name().and_then(|n| n.to_str())
                    && !hash.contains('.')
                {
                    digests.push(format!("sha256:{hash}"));
                }
            })?;
        }

        Ok(digests)
    }

    fn walk_dir(dir: &Path, callback: &mut impl FnMut(&Path)) -> Result<()> {
        if !dir.exists() {
            return Ok(());
        }

        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            if path.is_dir() {
                Self::walk_dir(&path, callback)?;
            } else {
                callback(&path);
            }
        }

        Ok(())
    }
}
