//! Image records.
//!
//! An image names a target content digest. Images are GC roots until their
//! `gc.expire` label passes, after which they are collected like any other
//! unreferenced record.

use super::leases::parse_expiry;
use super::{Labels, MetadataDb};
use crate::error::{Error, Result};
use crate::gc::GcScheduler;
use crate::storage::BlobStore;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

/// Metadata of an image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Image {
    /// Image reference, e.g. `docker.io/library/alpine:latest`.
    pub name: String,
    /// Digest of the image's root content (index or manifest).
    pub target: String,
    #[serde(default)]
    pub labels: Labels,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Image {
    /// Creates an image record pointing at `target`.
    pub fn new(name: impl Into<String>, target: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            name: name.into(),
            target: target.into(),
            labels: Labels::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Sets a label.
    #[must_use]
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }
}

/// Image store scoped by namespace.
#[derive(Debug, Clone)]
pub struct ImageStore {
    db: Arc<MetadataDb>,
    gc: Option<Arc<GcScheduler>>,
}

impl ImageStore {
    pub fn new(db: Arc<MetadataDb>) -> Self {
        Self { db, gc: None }
    }

    /// Routes synchronous deletes through `gc`.
    #[must_use]
    pub fn with_scheduler(mut self, gc: Arc<GcScheduler>) -> Self {
        self.gc = Some(gc);
        self
    }

    /// Records a new image.
    ///
    /// A `gc.expire` label must be an RFC 3339 timestamp.
    pub fn create(&self, namespace: &str, mut image: Image) -> Result<Image> {
        if image.name.is_empty() {
            return Err(Error::InvalidArgument("image name cannot be empty".to_string()));
        }
        BlobStore::validate_digest(&image.target)?;
        parse_expiry(&image.labels)?;

        let now = Utc::now();
        image.created_at = now;
        image.updated_at = now;

        self.db.update(|tx| {
            let bucket = tx.bucket_mut(namespace)?;
            if bucket.images.contains_key(&image.name) {
                return Err(Error::AlreadyExists(format!("image {}", image.name)));
            }
            bucket.images.insert(image.name.clone(), image.clone());
            Ok(())
        })?;

        info!(namespace = %namespace, image = %image.name, target = %image.target, "image created");
        Ok(image)
    }

    /// Returns an image.
    pub fn get(&self, namespace: &str, name: &str) -> Result<Image> {
        self.db.view(|tx| {
            tx.bucket(namespace)
                .and_then(|b| b.images.get(name))
                .cloned()
                .ok_or_else(|| Error::NotFound(format!("image {name}")))
        })
    }

    /// Lists the images of a namespace.
    pub fn list(&self, namespace: &str) -> Result<Vec<Image>> {
        self.db.view(|tx| {
            Ok(tx
                .bucket(namespace)
                .map(|b| b.images.values().cloned().collect())
                .unwrap_or_default())
        })
    }

    /// Replaces the target and labels of an image.
    pub fn update(&self, namespace: &str, image: Image) -> Result<Image> {
        BlobStore::validate_digest(&image.target)?;
        parse_expiry(&image.labels)?;
        self.db.update(|tx| {
            let existing = tx
                .existing_bucket_mut(namespace)
                .and_then(|b| b.images.get_mut(&image.name))
                .ok_or_else(|| Error::NotFound(format!("image {}", image.name)))?;
            existing.target = image.target;
            existing.labels = image.labels;
            existing.updated_at = Utc::now();
            let updated = existing.clone();
            tx.mark_dirty();
            Ok(updated)
        })
    }

    /// Deletes an image. With `synchronous`, returns only after a collection
    /// pass that began after the delete has completed.
    pub async fn delete(&self, namespace: &str, name: &str, synchronous: bool) -> Result<()> {
        self.db.update(|tx| {
            tx.existing_bucket_mut(namespace)
                .and_then(|b| b.images.remove(name))
                .ok_or_else(|| Error::NotFound(format!("image {name}")))?;
            tx.mark_dirty();
            Ok(())
        })?;
        info!(namespace = %namespace, image = %name, synchronous, "image deleted");

        if synchronous {
            match &self.gc {
                Some(gc) => gc.schedule_and_wait().await?,
                None => self.db.garbage_collect().await?,
            };
        }
        Ok(())
    }
}
