//! Namespaced content metadata over the shared blob store.
//!
//! Blobs are stored once per digest; each namespace that has the content
//! holds its own record with its own labels. Content is only visible in a
//! namespace through its record, and the blob on disk is removed by the
//! collector once no namespace holds a record for it.

use super::leases::{LeaseResource, add_resource_tx};
use super::{Labels, MetadataDb};
use crate::error::{Error, Result};
use crate::namespaces;
use crate::storage::BlobStore;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

/// Metadata of one content blob within a namespace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentInfo {
    pub digest: String,
    pub size: u64,
    #[serde(default)]
    pub labels: Labels,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Content store scoped by namespace.
#[derive(Debug, Clone)]
pub struct ContentStore {
    db: Arc<MetadataDb>,
}

impl ContentStore {
    pub fn new(db: Arc<MetadataDb>) -> Self {
        Self { db }
    }

    /// Writes `data` and records it in `namespace`.
    ///
    /// When `lease` is given, the content is added to the lease in the same
    /// transaction that makes it visible. The digest lock is held from the
    /// blob write until that transaction commits, so the collector cannot
    /// remove the blob in between.
    ///
    /// Writing content the namespace already has merges `labels` into the
    /// existing record.
    pub async fn write(
        &self,
        namespace: &str,
        lease: Option<&str>,
        data: &[u8],
        expected: Option<&str>,
        labels: Labels,
    ) -> Result<ContentInfo> {
        namespaces::validate(namespace)?;
        let digest = BlobStore::digest_of(data);
        if let Some(expected) = expected {
            BlobStore::validate_digest(expected)?;
            if expected != digest {
                return Err(Error::FailedPrecondition(format!(
                    "unexpected commit digest {digest}, expected {expected}"
                )));
            }
        }

        let blobs = self.db.blobs();
        let _guard = blobs.locker().lock(&digest).await?;
        blobs.put_blob(&digest, data)?;

        let now = Utc::now();
        let info = self.db.update(|tx| {
            if let Some(lease) = lease {
                add_resource_tx(
                    tx,
                    namespace,
                    lease,
                    LeaseResource::Content {
                        digest: digest.clone(),
                    },
                )?;
            }
            let bucket = tx.bucket_mut(namespace)?;
            let info = bucket
                .content
                .entry(digest.clone())
                .and_modify(|existing| {
                    if !labels.is_empty() {
                        existing.labels.extend(labels.clone());
                        existing.updated_at = now;
                    }
                })
                .or_insert_with(|| ContentInfo {
                    digest: digest.clone(),
                    size: data.len() as u64,
                    labels: labels.clone(),
                    created_at: now,
                    updated_at: now,
                });
            Ok(info.clone())
        })?;

        debug!(namespace = %namespace, digest = %digest, size = info.size, lease = ?lease, "content committed");
        Ok(info)
    }

    /// Returns the record for `digest`.
    pub fn info(&self, namespace: &str, digest: &str) -> Result<ContentInfo> {
        self.db.view(|tx| {
            tx.bucket(namespace)
                .and_then(|b| b.content.get(digest))
                .cloned()
                .ok_or_else(|| Error::NotFound(format!("content digest {digest}")))
        })
    }

    /// Reads content visible in `namespace`.
    pub fn read(&self, namespace: &str, digest: &str) -> Result<Vec<u8>> {
        self.info(namespace, digest)?;
        self.db.blobs().get_blob(digest)
    }

    /// Replaces the labels of a record.
    pub fn update(&self, namespace: &str, digest: &str, labels: Labels) -> Result<ContentInfo> {
        self.db.update(|tx| {
            let info = tx
                .existing_bucket_mut(namespace)
                .and_then(|b| b.content.get_mut(digest))
                .ok_or_else(|| Error::NotFound(format!("content digest {digest}")))?;
            info.labels = labels;
            info.updated_at = Utc::now();
            Ok(info.clone())
        })
    }

    /// Removes the record. The blob is reclaimed by the next collection
    /// pass once no namespace references it.
    pub fn delete(&self, namespace: &str, digest: &str) -> Result<()> {
        self.db.update(|tx| {
            tx.existing_bucket_mut(namespace)
                .and_then(|b| b.content.remove(digest))
                .ok_or_else(|| Error::NotFound(format!("content digest {digest}")))?;
            tx.mark_dirty();
            Ok(())
        })?;
        debug!(namespace = %namespace, digest = %digest, "content deleted");
        Ok(())
    }

    /// Returns every record in `namespace` accepted by `filter`.
    pub fn walk(&self, namespace: &str, filter: impl Fn(&ContentInfo) -> bool) -> Result<Vec<ContentInfo>> {
        self.db.view(|tx| {
            Ok(tx
                .bucket(namespace)
                .map(|b| b.content.values().filter(|i| filter(i)).cloned().collect())
                .unwrap_or_default())
        })
    }
}
