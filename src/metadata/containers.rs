//! Container records.
//!
//! A container is always a GC root. It pins its snapshot (when it has one)
//! and anything named by its reference labels.

use super::{Labels, MetadataDb};
use crate::constants::validate_identifier;
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

/// Metadata of a container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Container {
    pub id: String,
    /// Image the container was created from.
    #[serde(default)]
    pub image: Option<String>,
    /// Runtime name used to start the container's task.
    pub runtime: String,
    #[serde(default)]
    pub snapshotter: Option<String>,
    #[serde(default)]
    pub snapshot_key: Option<String>,
    #[serde(default)]
    pub labels: Labels,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Container {
    /// Creates a container record for `runtime`.
    pub fn new(id: impl Into<String>, runtime: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            image: None,
            runtime: runtime.into(),
            snapshotter: None,
            snapshot_key: None,
            labels: Labels::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Sets the image.
    #[must_use]
    pub fn with_image(mut self, image: impl Into<String>) -> Self {
        self.image = Some(image.into());
        self
    }

    /// Sets the root filesystem snapshot.
    #[must_use]
    pub fn with_snapshot(mut self, snapshotter: impl Into<String>, key: impl Into<String>) -> Self {
        self.snapshotter = Some(snapshotter.into());
        self.snapshot_key = Some(key.into());
        self
    }

    /// Sets a label.
    #[must_use]
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }
}

/// Container store scoped by namespace.
#[derive(Debug, Clone)]
pub struct ContainerStore {
    db: Arc<MetadataDb>,
}

impl ContainerStore {
    pub fn new(db: Arc<MetadataDb>) -> Self {
        Self { db }
    }

    /// Records a new container.
    pub fn create(&self, namespace: &str, mut container: Container) -> Result<Container> {
        validate_identifier(&container.id)
            .map_err(|reason| Error::InvalidArgument(format!("container {:?}: {reason}", container.id)))?;
        if container.snapshotter.is_some() != container.snapshot_key.is_some() {
            return Err(Error::InvalidArgument(
                "snapshotter and snapshot key must be set together".to_string(),
            ));
        }

        let now = Utc::now();
        container.created_at = now;
        container.updated_at = now;

        self.db.update(|tx| {
            let bucket = tx.bucket_mut(namespace)?;
            if bucket.containers.contains_key(&container.id) {
                return Err(Error::AlreadyExists(format!("container {}", container.id)));
            }
            bucket.containers.insert(container.id.clone(), container.clone());
            Ok(())
        })?;

        info!(namespace = %namespace, container = %container.id, "container created");
        Ok(container)
    }

    /// Returns a container.
    pub fn get(&self, namespace: &str, id: &str) -> Result<Container> {
        self.db.view(|tx| {
            tx.bucket(namespace)
                .and_then(|b| b.containers.get(id))
                .cloned()
                .ok_or_else(|| Error::NotFound(format!("container {id}")))
        })
    }

    /// Lists the containers of a namespace.
    pub fn list(&self, namespace: &str) -> Result<Vec<Container>> {
        self.db.view(|tx| {
            Ok(tx
                .bucket(namespace)
                .map(|b| b.containers.values().cloned().collect())
                .unwrap_or_default())
        })
    }

    /// Replaces the mutable fields (image, snapshot, labels) of a container.
    pub fn update(&self, namespace: &str, container: Container) -> Result<Container> {
        self.db.update(|tx| {
            let existing = tx
                .existing_bucket_mut(namespace)
                .and_then(|b| b.containers.get_mut(&container.id))
                .ok_or_else(|| Error::NotFound(format!("container {}", container.id)))?;
            existing.image = container.image;
            existing.snapshotter = container.snapshotter;
            existing.snapshot_key = container.snapshot_key;
            existing.labels = container.labels;
            existing.updated_at = Utc::now();
            let updated = existing.clone();
            tx.mark_dirty();
            Ok(updated)
        })
    }

    /// Deletes a container record.
    pub fn delete(&self, namespace: &str, id: &str) -> Result<()> {
        self.db.update(|tx| {
            tx.existing_bucket_mut(namespace)
                .and_then(|b| b.containers.remove(id))
                .ok_or_else(|| Error::NotFound(format!("container {id}")))?;
            tx.mark_dirty();
            Ok(())
        })?;
        info!(namespace = %namespace, container = %id, "container deleted");
        Ok(())
    }
}
