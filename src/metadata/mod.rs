//! # Metadata Store
//!
//! Namespaced records for content, snapshots, containers, images and leases,
//! with transactional access in the style of an embedded key/value database.
//!
//! ## Transactions
//!
//! ```text
//!   view(|tx| ..)    ──▶ Arc<Committed> snapshot (never blocks writers)
//!   update(|tx| ..)  ──▶ writer mutex ──▶ private copy ──▶ publish on Ok
//! ```
//!
//! Readers hold an immutable snapshot for the whole closure, so a mark phase
//! run inside [`MetadataDb::view`] sees a graph that cannot change underneath
//! it. Writers are serialised; a closure returning `Err` commits nothing.
//! Every commit bumps a sequence number visible through
//! [`ReadTx::sequence`].
//!
//! ## Persistence
//!
//! When opened with a path, each commit is serialised as JSON and written
//! with a temp file + rename before it is published. A failed write leaves
//! both the file and the in-memory state at the previous commit.
//!
//! ## Mutation Hook
//!
//! After each commit the registered [`MutationHook`] is invoked with
//! `dirty = true` if the transaction deleted anything. The GC scheduler uses
//! this to decide when to run a background pass.

pub mod containers;
pub mod content;
mod gc;
pub mod images;
pub mod leases;
pub mod snapshots;

pub use containers::{Container, ContainerStore};
pub use content::{ContentInfo, ContentStore};
pub use images::{Image, ImageStore};
pub use leases::{DeleteOptions, Lease, LeaseFilter, LeaseManager, LeaseOptions, LeaseResource};
pub use snapshots::{SnapshotInfo, SnapshotStore, Snapshotter};

use snapshots::SnapshotRemoval;

use crate::error::{Error, Result};
use crate::namespaces;
use crate::storage::{BlobStore, LocalLocker};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use tracing::{debug, info};

/// Callback invoked after every committed write; the argument is true when
/// the write deleted records.
pub type MutationHook = Arc<dyn Fn(bool) + Send + Sync>;

/// String labels attached to metadata records.
pub type Labels = HashMap<String, String>;

// =============================================================================
// Stored State
// =============================================================================

/// Records of a single namespace.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub(crate) struct Bucket {
    pub(crate) leases: BTreeMap<String, leases::LeaseRecord>,
    pub(crate) content: BTreeMap<String, ContentInfo>,
    /// snapshotter → key → info
    pub(crate) snapshots: BTreeMap<String, BTreeMap<String, SnapshotInfo>>,
    pub(crate) containers: BTreeMap<String, Container>,
    pub(crate) images: BTreeMap<String, Image>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub(crate) struct DbState {
    pub(crate) namespaces: BTreeMap<String, Bucket>,
    /// Backend snapshots whose records were removed explicitly.
    pub(crate) snapshot_removals: Vec<SnapshotRemoval>,
}

impl DbState {
    /// Returns true if any namespace holds metadata for `digest`.
    pub(crate) fn content_referenced(&self, digest: &str) -> bool {
        self.namespaces
            .values()
            .any(|bucket| bucket.content.contains_key(digest))
    }

    /// Returns true if `namespace` holds a record for snapshot `key`.
    pub(crate) fn snapshot_recorded(&self, namespace: &str, snapshotter: &str, key: &str) -> bool {
        self.namespaces
            .get(namespace)
            .and_then(|b| b.snapshots.get(snapshotter))
            .is_some_and(|s| s.contains_key(key))
    }
}

#[derive(Debug, Default)]
struct Committed {
    state: DbState,
    sequence: u64,
}

// =============================================================================
// Transactions
// =============================================================================

/// Read access to one committed snapshot.
pub struct ReadTx<'a> {
    state: &'a DbState,
    sequence: u64,
}

impl ReadTx<'_> {
    /// Sequence number of the commit this snapshot reflects.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Names of every namespace holding records.
    pub fn namespaces(&self) -> Vec<String> {
        self.state.namespaces.keys().cloned().collect()
    }

    pub(crate) fn bucket(&self, namespace: &str) -> Option<&Bucket> {
        self.state.namespaces.get(namespace)
    }

    pub(crate) fn state(&self) -> &DbState {
        self.state
    }
}

/// Write access to a private copy of the committed state.
pub struct WriteTx {
    state: DbState,
    base_sequence: u64,
    dirty: bool,
}

impl WriteTx {
    /// Sequence number of the commit this transaction started from.
    pub fn base_sequence(&self) -> u64 {
        self.base_sequence
    }

    /// Names of every namespace holding records.
    pub fn namespaces(&self) -> Vec<String> {
        self.state.namespaces.keys().cloned().collect()
    }

    /// Flags the transaction as having deleted records.
    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    /// Returns the namespace's records, creating the namespace if needed.
    pub(crate) fn bucket_mut(&mut self, namespace: &str) -> Result<&mut Bucket> {
        namespaces::validate(namespace)?;
        Ok(self.state.namespaces.entry(namespace.to_string()).or_default())
    }

    /// Returns the namespace's records without creating it.
    pub(crate) fn existing_bucket_mut(&mut self, namespace: &str) -> Option<&mut Bucket> {
        self.state.namespaces.get_mut(namespace)
    }

    pub(crate) fn state(&self) -> &DbState {
        &self.state
    }

    /// Queues a backend snapshot for removal by the next collection pass.
    pub(crate) fn queue_snapshot_removal(&mut self, removal: SnapshotRemoval) {
        self.state.snapshot_removals.push(removal);
    }

    /// Drops a queued removal of `(namespace, snapshotter, key)`.
    pub(crate) fn cancel_snapshot_removal(&mut self, namespace: &str, snapshotter: &str, key: &str) {
        self.state
            .snapshot_removals
            .retain(|r| !r.is_for(namespace, snapshotter, key));
    }

    /// Takes every queued backend snapshot removal.
    pub(crate) fn take_snapshot_removals(&mut self) -> Vec<SnapshotRemoval> {
        std::mem::take(&mut self.state.snapshot_removals)
    }
}

// =============================================================================
// Database
// =============================================================================

/// Transactional metadata database.
///
/// Also owns the backends whose data it indexes (blob store and named
/// snapshotters) so a collection pass can remove unreferenced backend data.
/// Backend snapshot changes for one key are serialised through
/// `snapshot_locks`.
pub struct MetadataDb {
    committed: RwLock<Arc<Committed>>,
    writer: Mutex<()>,
    path: Option<PathBuf>,
    hook: RwLock<Option<MutationHook>>,
    blobs: Arc<BlobStore>,
    snapshotters: HashMap<String, Arc<dyn Snapshotter>>,
    snapshot_locks: LocalLocker,
}

impl std::fmt::Debug for MetadataDb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetadataDb")
            .field("path", &self.path)
            .field("snapshotters", &self.snapshotters.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl MetadataDb {
    /// Creates an in-memory database.
    pub fn new(blobs: Arc<BlobStore>) -> Self {
        Self {
            committed: RwLock::new(Arc::new(Committed::default())),
            writer: Mutex::new(()),
            path: None,
            hook: RwLock::new(None),
            blobs,
            snapshotters: HashMap::new(),
            snapshot_locks: LocalLocker::new(),
        }
    }

    /// Opens a database persisted at `path`, loading it if present.
    pub fn open(path: impl AsRef<Path>, blobs: Arc<BlobStore>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| Error::StorageInitFailed {
                path: parent.to_path_buf(),
                reason: e.to_string(),
            })?;
        }

        let state = if path.exists() {
            let data = fs::read(&path).map_err(|e| Error::StorageInitFailed {
                path: path.clone(),
                reason: e.to_string(),
            })?;
            serde_json::from_slice(&data).map_err(|e| Error::StorageInitFailed {
                path: path.clone(),
                reason: format!("corrupt metadata: {e}"),
            })?
        } else {
            DbState::default()
        };

        info!(
            path = %path.display(),
            namespaces = state.namespaces.len(),
            "metadata store opened"
        );

        let mut db = Self::new(blobs);
        db.committed = RwLock::new(Arc::new(Committed { state, sequence: 0 }));
        db.path = Some(path);
        Ok(db)
    }

    /// Registers a snapshotter backend under `name`.
    #[must_use]
    pub fn with_snapshotter(mut self, name: impl Into<String>, snapshotter: Arc<dyn Snapshotter>) -> Self {
        self.snapshotters.insert(name.into(), snapshotter);
        self
    }

    /// Returns the blob store backing content.
    pub fn blobs(&self) -> &Arc<BlobStore> {
        &self.blobs
    }

    /// Returns the snapshotter registered under `name`.
    pub fn snapshotter(&self, name: &str) -> Result<Arc<dyn Snapshotter>> {
        self.snapshotters
            .get(name)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("snapshotter {name}")))
    }

    /// Per-key locks held while a backend snapshot is prepared or removed.
    pub(crate) fn snapshot_locks(&self) -> &LocalLocker {
        &self.snapshot_locks
    }

    /// Names of the registered snapshotters.
    pub fn snapshotter_names(&self) -> Vec<String> {
        self.snapshotters.keys().cloned().collect()
    }

    /// Installs the callback notified after every commit.
    pub fn set_mutation_hook(&self, hook: MutationHook) -> Result<()> {
        let mut slot = self
            .hook
            .write()
            .map_err(|_| Error::Internal("lock poisoned".to_string()))?;
        *slot = Some(hook);
        Ok(())
    }

    fn current(&self) -> Result<Arc<Committed>> {
        self.committed
            .read()
            .map(|c| Arc::clone(&c))
            .map_err(|_| Error::Internal("lock poisoned".to_string()))
    }

    /// Runs `f` against the latest committed snapshot.
    pub fn view<T>(&self, f: impl FnOnce(&ReadTx<'_>) -> Result<T>) -> Result<T> {
        let committed = self.current()?;
        let tx = ReadTx {
            state: &committed.state,
            sequence: committed.sequence,
        };
        f(&tx)
    }

    /// Runs `f` in a write transaction, committing its changes on `Ok`.
    pub fn update<T>(&self, f: impl FnOnce(&mut WriteTx) -> Result<T>) -> Result<T> {
        let (value, dirty) = self.commit(f)?;
        let hook = self.hook.read().ok().and_then(|h| h.clone());
        if let Some(hook) = hook {
            hook(dirty);
        }
        Ok(value)
    }

    /// Like [`update`](Self::update) but does not notify the mutation hook.
    ///
    /// Used by the collector so its own sweep does not count as a mutation.
    pub(crate) fn update_quiet<T>(&self, f: impl FnOnce(&mut WriteTx) -> Result<T>) -> Result<T> {
        self.commit(f).map(|(value, _)| value)
    }

    fn commit<T>(&self, f: impl FnOnce(&mut WriteTx) -> Result<T>) -> Result<(T, bool)> {
        let _writer = self
            .writer
            .lock()
            .map_err(|_| Error::Internal("lock poisoned".to_string()))?;

        let base = self.current()?;
        let mut tx = WriteTx {
            state: base.state.clone(),
            base_sequence: base.sequence,
            dirty: false,
        };
        let value = f(&mut tx)?;

        if let Some(path) = &self.path {
            persist(path, &tx.state)?;
        }

        let sequence = base.sequence + 1;
        let committed = Arc::new(Committed {
            state: tx.state,
            sequence,
        });
        *self
            .committed
            .write()
            .map_err(|_| Error::Internal("lock poisoned".to_string()))? = committed;

        debug!(sequence, dirty = tx.dirty, "metadata committed");
        Ok((value, tx.dirty))
    }

    /// Names of every namespace holding records.
    pub fn namespaces(&self) -> Result<Vec<String>> {
        self.view(|tx| Ok(tx.namespaces()))
    }
}

/// Writes `state` to `path` atomically.
fn persist(path: &Path, state: &DbState) -> Result<()> {
    let data = serde_json::to_vec(state)?;
    let temp_path = path.with_extension(format!("tmp.{}", uuid::Uuid::now_v7()));
    fs::write(&temp_path, &data).map_err(|e| Error::StorageWriteFailed(e.to_string()))?;
    fs::rename(&temp_path, path).map_err(|e| {
        let _ = fs::remove_file(&temp_path);
        Error::StorageWriteFailed(e.to_string())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    fn db(temp: &TempDir) -> MetadataDb {
        let blobs = Arc::new(BlobStore::with_path(temp.path().join("blobs")).unwrap());
        MetadataDb::new(blobs)
    }

    #[test]
    fn test_failed_update_commits_nothing() {
        let temp = TempDir::new().unwrap();
        let db = db(&temp);

        let result: Result<()> = db.update(|tx| {
            tx.bucket_mut("ns1")?;
            Err(Error::Internal("abort".to_string()))
        });
        assert!(result.is_err());
        assert!(db.namespaces().unwrap().is_empty());
        assert_eq!(db.view(|tx| Ok(tx.sequence())).unwrap(), 0);
    }

    #[test]
    fn test_view_sees_snapshot() {
        let temp = TempDir::new().unwrap();
        let db = db(&temp);

        db.view(|tx| {
            db.update(|w| w.bucket_mut("ns1").map(|_| ()))?;
            assert!(tx.namespaces().is_empty(), "snapshot must not change");
            Ok(())
        })
        .unwrap();
        assert_eq!(db.namespaces().unwrap(), vec!["ns1".to_string()]);
    }

    #[test]
    fn test_hook_reports_dirty() {
        let temp = TempDir::new().unwrap();
        let db = db(&temp);
        let dirty = Arc::new(AtomicUsize::new(0));
        let clean = Arc::new(AtomicUsize::new(0));
        {
            let (dirty, clean) = (Arc::clone(&dirty), Arc::clone(&clean));
            db.set_mutation_hook(Arc::new(move |d| {
                if d {
                    dirty.fetch_add(1, Ordering::SeqCst);
                } else {
                    clean.fetch_add(1, Ordering::SeqCst);
                }
            }))
            .unwrap();
        }

        db.update(|tx| tx.bucket_mut("ns1").map(|_| ())).unwrap();
        db.update(|tx| {
            tx.mark_dirty();
            Ok(())
        })
        .unwrap();
        db.update_quiet(|tx| {
            tx.mark_dirty();
            Ok(())
        })
        .unwrap();

        assert_eq!(clean.load(Ordering::SeqCst), 1);
        assert_eq!(dirty.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_persistence_reload() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("meta.json");
        let blobs = Arc::new(BlobStore::with_path(temp.path().join("blobs")).unwrap());

        {
            let db = MetadataDb::open(&path, Arc::clone(&blobs)).unwrap();
            db.update(|tx| tx.bucket_mut("ns1").map(|_| ())).unwrap();
        }

        let db = MetadataDb::open(&path, blobs).unwrap();
        assert_eq!(db.namespaces().unwrap(), vec!["ns1".to_string()]);
    }

    #[test]
    fn test_invalid_namespace_rejected() {
        let temp = TempDir::new().unwrap();
        let db = db(&temp);
        assert!(db.update(|tx| tx.bucket_mut("bad/ns").map(|_| ())).is_err());
    }
}
