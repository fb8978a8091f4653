//! Namespaced snapshot metadata over named snapshotter backends.
//!
//! Backends are shared by all namespaces, so each namespaced key maps to the
//! backend key `<namespace>/<key>`. Removing a snapshot drops its record and
//! queues the backend snapshot for the next collection pass. Backend prepare
//! and removal of one key hold the same per-key lock.

use super::leases::{LeaseResource, add_resource_tx};
use super::{Labels, MetadataDb};
use crate::error::{Error, Result};
use crate::namespaces;
use crate::storage::KeyedLocker;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

/// A snapshotter backend.
#[async_trait]
pub trait Snapshotter: Send + Sync {
    /// Creates an active snapshot `key` on top of `parent`.
    async fn prepare(&self, key: &str, parent: Option<&str>) -> Result<()>;

    /// Removes snapshot `key`.
    async fn remove(&self, key: &str) -> Result<()>;

    /// Returns true if `key` exists.
    async fn exists(&self, key: &str) -> Result<bool>;
}

/// Metadata of one snapshot within a namespace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotInfo {
    pub key: String,
    pub parent: Option<String>,
    #[serde(default)]
    pub labels: Labels,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Backend key of a namespaced snapshot.
pub(crate) fn backend_key(namespace: &str, key: &str) -> String {
    format!("{namespace}/{key}")
}

/// Lock key guarding backend changes to one snapshot.
pub(crate) fn lock_key(snapshotter: &str, backend_key: &str) -> String {
    format!("{snapshotter}/{backend_key}")
}

/// Backend snapshot whose record is gone, removed after the sweep commits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct SnapshotRemoval {
    pub(crate) namespace: String,
    pub(crate) snapshotter: String,
    pub(crate) key: String,
    pub(crate) created_at: DateTime<Utc>,
}

impl SnapshotRemoval {
    pub(crate) fn new(namespace: &str, snapshotter: &str, key: &str, created_at: DateTime<Utc>) -> Self {
        Self {
            namespace: namespace.to_string(),
            snapshotter: snapshotter.to_string(),
            key: key.to_string(),
            created_at,
        }
    }

    pub(crate) fn backend_key(&self) -> String {
        backend_key(&self.namespace, &self.key)
    }

    pub(crate) fn is_for(&self, namespace: &str, snapshotter: &str, key: &str) -> bool {
        self.namespace == namespace && self.snapshotter == snapshotter && self.key == key
    }
}

/// Snapshot store scoped by namespace.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    db: Arc<MetadataDb>,
}

impl SnapshotStore {
    pub fn new(db: Arc<MetadataDb>) -> Self {
        Self { db }
    }

    /// Prepares a snapshot and records it, optionally pinning it with `lease`
    /// in the same transaction.
    ///
    /// `parent` must already exist in the namespace.
    pub async fn prepare(
        &self,
        namespace: &str,
        lease: Option<&str>,
        snapshotter: &str,
        key: &str,
        parent: Option<&str>,
        labels: Labels,
    ) -> Result<SnapshotInfo> {
        namespaces::validate(namespace)?;
        if key.is_empty() {
            return Err(Error::InvalidArgument("snapshot key cannot be empty".to_string()));
        }
        let backend = self.db.snapshotter(snapshotter)?;
        let target = backend_key(namespace, key);
        let _guard = self.db.snapshot_locks().lock(&lock_key(snapshotter, &target)).await?;

        self.db.view(|tx| {
            let snapshots = tx.bucket(namespace).and_then(|b| b.snapshots.get(snapshotter));
            check_prepare(snapshots, snapshotter, key, parent)
        })?;

        // No record exists, so backend data under this key is left over from
        // a removed snapshot the collector has not reached yet.
        if backend.exists(&target).await? {
            debug!(key = %target, "removing stale backend snapshot before prepare");
            backend.remove(&target).await?;
        }

        let backend_parent = parent.map(|p| backend_key(namespace, p));
        backend.prepare(&target, backend_parent.as_deref()).await?;

        let now = Utc::now();
        let committed = self.db.update(|tx| {
            if let Some(lease) = lease {
                add_resource_tx(
                    tx,
                    namespace,
                    lease,
                    LeaseResource::Snapshot {
                        snapshotter: snapshotter.to_string(),
                        key: key.to_string(),
                    },
                )?;
            }
            let snapshots = tx
                .bucket_mut(namespace)?
                .snapshots
                .entry(snapshotter.to_string())
                .or_default();
            check_prepare(Some(snapshots), snapshotter, key, parent)?;
            let info = SnapshotInfo {
                key: key.to_string(),
                parent: parent.map(str::to_string),
                labels,
                created_at: now,
                updated_at: now,
            };
            snapshots.insert(key.to_string(), info.clone());
            tx.cancel_snapshot_removal(namespace, snapshotter, key);
            Ok(info)
        });

        match committed {
            Ok(info) => {
                debug!(namespace = %namespace, snapshotter = %snapshotter, key = %key, "snapshot prepared");
                Ok(info)
            }
            Err(e) => {
                if let Err(remove_err) = backend.remove(&target).await {
                    warn!(key = %key, error = %remove_err, "failed to roll back snapshot");
                }
                Err(e)
            }
        }
    }

    /// Returns the record of a snapshot.
    pub fn stat(&self, namespace: &str, snapshotter: &str, key: &str) -> Result<SnapshotInfo> {
        self.db.view(|tx| {
            tx.bucket(namespace)
                .and_then(|b| b.snapshots.get(snapshotter))
                .and_then(|s| s.get(key))
                .cloned()
                .ok_or_else(|| Error::NotFound(format!("snapshot {snapshotter}/{key}")))
        })
    }

    /// Replaces the labels of a snapshot.
    pub fn update(&self, namespace: &str, snapshotter: &str, key: &str, labels: Labels) -> Result<SnapshotInfo> {
        self.db.update(|tx| {
            let info = tx
                .existing_bucket_mut(namespace)
                .and_then(|b| b.snapshots.get_mut(snapshotter))
                .and_then(|s| s.get_mut(key))
                .ok_or_else(|| Error::NotFound(format!("snapshot {snapshotter}/{key}")))?;
            info.labels = labels;
            info.updated_at = Utc::now();
            Ok(info.clone())
        })
    }

    /// Removes the record of a snapshot that has no children.
    ///
    /// The backend snapshot is removed by the next collection pass.
    pub fn remove(&self, namespace: &str, snapshotter: &str, key: &str) -> Result<()> {
        self.db.update(|tx| {
            let snapshots = tx
                .existing_bucket_mut(namespace)
                .and_then(|b| b.snapshots.get_mut(snapshotter))
                .ok_or_else(|| Error::NotFound(format!("snapshot {snapshotter}/{key}")))?;
            if snapshots.values().any(|s| s.parent.as_deref() == Some(key)) {
                return Err(Error::FailedPrecondition(format!(
                    "cannot remove snapshot {snapshotter}/{key} with children"
                )));
            }
            let info = snapshots
                .remove(key)
                .ok_or_else(|| Error::NotFound(format!("snapshot {snapshotter}/{key}")))?;
            tx.queue_snapshot_removal(SnapshotRemoval::new(namespace, snapshotter, key, info.created_at));
            tx.mark_dirty();
            Ok(())
        })?;
        debug!(namespace = %namespace, snapshotter = %snapshotter, key = %key, "snapshot removed");
        Ok(())
    }

    /// Returns every snapshot of `snapshotter` in `namespace` accepted by
    /// `filter`.
    pub fn walk(
        &self,
        namespace: &str,
        snapshotter: &str,
        filter: impl Fn(&SnapshotInfo) -> bool,
    ) -> Result<Vec<SnapshotInfo>> {
        self.db.view(|tx| {
            Ok(tx
                .bucket(namespace)
                .and_then(|b| b.snapshots.get(snapshotter))
                .map(|s| s.values().filter(|i| filter(i)).cloned().collect())
                .unwrap_or_default())
        })
    }
}

fn check_prepare(
    snapshots: Option<&std::collections::BTreeMap<String, SnapshotInfo>>,
    snapshotter: &str,
    key: &str,
    parent: Option<&str>,
) -> Result<()> {
    if snapshots.is_some_and(|s| s.contains_key(key)) {
        return Err(Error::AlreadyExists(format!("snapshot {snapshotter}/{key}")));
    }
    if let Some(parent) = parent
        && !snapshots.is_some_and(|s| s.contains_key(parent))
    {
        return Err(Error::NotFound(format!("parent snapshot {snapshotter}/{parent}")));
    }
    Ok(())
}
