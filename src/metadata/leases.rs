//! Lease management.
//!
//! A lease pins a set of resources as GC roots for as long as it exists.
//! Resource-creating operations attach their output to a lease inside the
//! same write transaction that makes the resource visible, so a concurrent
//! collection pass can never observe the resource unrooted.

use super::{Labels, MetadataDb, WriteTx};
use crate::constants::{LABEL_GC_EXPIRE, validate_identifier};
use crate::error::{Error, Result};
use crate::gc::GcScheduler;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

// =============================================================================
// Types
// =============================================================================

/// A root-pinning handle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub id: String,
    pub labels: Labels,
    pub created_at: DateTime<Utc>,
}

impl Lease {
    /// Returns the expiry recorded in the `gc.expire` label.
    ///
    /// A label that is present but not RFC 3339 is an error.
    pub fn expires_at(&self) -> Result<Option<DateTime<Utc>>> {
        parse_expiry(&self.labels)
    }
}

/// A resource pinned by a lease.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LeaseResource {
    Content { digest: String },
    Snapshot { snapshotter: String, key: String },
    Image { name: String },
}

impl LeaseResource {
    fn validate(&self) -> Result<()> {
        let empty = match self {
            Self::Content { digest } => digest.is_empty(),
            Self::Snapshot { snapshotter, key } => snapshotter.is_empty() || key.is_empty(),
            Self::Image { name } => name.is_empty(),
        };
        if empty {
            return Err(Error::InvalidArgument(format!("incomplete lease resource {self:?}")));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct LeaseRecord {
    pub(crate) created_at: DateTime<Utc>,
    #[serde(default)]
    pub(crate) labels: Labels,
    #[serde(default)]
    pub(crate) resources: BTreeSet<LeaseResource>,
}

impl LeaseRecord {
    fn to_lease(&self, id: &str) -> Lease {
        Lease {
            id: id.to_string(),
            labels: self.labels.clone(),
            created_at: self.created_at,
        }
    }
}

/// Parses the `gc.expire` label.
pub(crate) fn parse_expiry(labels: &Labels) -> Result<Option<DateTime<Utc>>> {
    let Some(value) = labels.get(LABEL_GC_EXPIRE) else {
        return Ok(None);
    };
    DateTime::parse_from_rfc3339(value)
        .map(|t| Some(t.with_timezone(&Utc)))
        .map_err(|e| Error::InvalidArgument(format!("invalid {LABEL_GC_EXPIRE} label {value:?}: {e}")))
}

// =============================================================================
// Options
// =============================================================================

/// Options for [`LeaseManager::create`].
#[derive(Debug, Clone, Default)]
pub struct LeaseOptions {
    id: Option<String>,
    labels: Labels,
}

impl LeaseOptions {
    /// Creates empty options; an id must be supplied before `create`.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Uses a generated id: creation time in nanoseconds plus a short random
    /// suffix.
    #[must_use]
    pub fn random_id(mut self) -> Self {
        let nanos = Utc::now().timestamp_nanos_opt().unwrap_or_default();
        let suffix = URL_SAFE.encode(rand::random::<[u8; 3]>());
        self.id = Some(format!("{nanos}-{suffix}"));
        self
    }

    /// Uses the given id.
    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Merges `labels` into the lease labels.
    #[must_use]
    pub fn with_labels(mut self, labels: Labels) -> Self {
        self.labels.extend(labels);
        self
    }

    /// Sets a single label.
    #[must_use]
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// Expires the lease `ttl` from now.
    #[must_use]
    pub fn with_expiration(mut self, ttl: Duration) -> Self {
        let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX);
        let expiry = Utc::now().checked_add_signed(ttl).unwrap_or(DateTime::<Utc>::MAX_UTC);
        self.labels.insert(LABEL_GC_EXPIRE.to_string(), expiry.to_rfc3339());
        self
    }
}

/// Options for [`LeaseManager::delete`].
#[derive(Debug, Clone, Copy, Default)]
pub struct DeleteOptions {
    synchronous: bool,
}

impl DeleteOptions {
    /// Waits for a collection pass before returning.
    #[must_use]
    pub fn synchronous() -> Self {
        Self { synchronous: true }
    }
}

/// Selects leases in [`LeaseManager::list`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaseFilter {
    Id(String),
    Label { key: String, value: Option<String> },
}

impl LeaseFilter {
    fn matches(&self, lease: &Lease) -> bool {
        match self {
            Self::Id(id) => lease.id == *id,
            Self::Label { key, value } => match (lease.labels.get(key), value) {
                (Some(_), None) => true,
                (Some(actual), Some(expected)) => actual == expected,
                (None, _) => false,
            },
        }
    }
}

// =============================================================================
// Manager
// =============================================================================

/// Lease operations over the metadata store.
#[derive(Debug, Clone)]
pub struct LeaseManager {
    db: Arc<MetadataDb>,
    gc: Option<Arc<GcScheduler>>,
}

impl LeaseManager {
    /// Creates a lease manager that collects inline on synchronous delete.
    pub fn new(db: Arc<MetadataDb>) -> Self {
        Self { db, gc: None }
    }

    /// Routes synchronous deletes through `gc`.
    #[must_use]
    pub fn with_scheduler(mut self, gc: Arc<GcScheduler>) -> Self {
        self.gc = Some(gc);
        self
    }

    /// Creates a lease.
    pub fn create(&self, namespace: &str, opts: LeaseOptions) -> Result<Lease> {
        let id = opts
            .id
            .ok_or_else(|| Error::InvalidArgument("lease id must be provided".to_string()))?;
        validate_identifier(&id)
            .map_err(|reason| Error::InvalidArgument(format!("lease {id:?}: {reason}")))?;
        parse_expiry(&opts.labels)?;

        let record = LeaseRecord {
            created_at: Utc::now(),
            labels: opts.labels,
            resources: BTreeSet::new(),
        };
        let lease = record.to_lease(&id);

        self.db.update(|tx| {
            let bucket = tx.bucket_mut(namespace)?;
            if bucket.leases.contains_key(&id) {
                return Err(Error::AlreadyExists(format!("lease {id}")));
            }
            bucket.leases.insert(id.clone(), record);
            Ok(())
        })?;

        info!(namespace = %namespace, lease = %id, "lease created");
        Ok(lease)
    }

    /// Returns a lease.
    pub fn get(&self, namespace: &str, id: &str) -> Result<Lease> {
        self.db.view(|tx| {
            tx.bucket(namespace)
                .and_then(|b| b.leases.get(id))
                .map(|r| r.to_lease(id))
                .ok_or_else(|| Error::NotFound(format!("lease {id}")))
        })
    }

    /// Deletes a lease.
    ///
    /// With [`DeleteOptions::synchronous`], returns only after a collection
    /// pass that began after the lease was unlinked has completed.
    pub async fn delete(&self, namespace: &str, id: &str, opts: DeleteOptions) -> Result<()> {
        self.db.update(|tx| {
            tx.existing_bucket_mut(namespace)
                .and_then(|b| b.leases.remove(id))
                .ok_or_else(|| Error::NotFound(format!("lease {id}")))?;
            tx.mark_dirty();
            Ok(())
        })?;

        info!(namespace = %namespace, lease = %id, synchronous = opts.synchronous, "lease deleted");

        if opts.synchronous {
            match &self.gc {
                Some(gc) => gc.schedule_and_wait().await?,
                None => self.db.garbage_collect().await?,
            };
        }
        Ok(())
    }

    /// Lists leases matching any filter, or all leases when none are given.
    pub fn list(&self, namespace: &str, filters: &[LeaseFilter]) -> Result<Vec<Lease>> {
        self.db.view(|tx| {
            let Some(bucket) = tx.bucket(namespace) else {
                return Ok(Vec::new());
            };
            Ok(bucket
                .leases
                .iter()
                .map(|(id, record)| record.to_lease(id))
                .filter(|lease| filters.is_empty() || filters.iter().any(|f| f.matches(lease)))
                .collect())
        })
    }

    /// Pins `resource` with the lease. Adding a held resource is a no-op.
    pub fn add_resource(&self, namespace: &str, lease: &str, resource: LeaseResource) -> Result<()> {
        resource.validate()?;
        self.db.update(|tx| add_resource_tx(tx, namespace, lease, resource))
    }

    /// Unpins `resource`. Removing an absent resource is a no-op.
    pub fn delete_resource(&self, namespace: &str, lease: &str, resource: &LeaseResource) -> Result<()> {
        self.db.update(|tx| {
            let record = tx
                .existing_bucket_mut(namespace)
                .and_then(|b| b.leases.get_mut(lease))
                .ok_or_else(|| Error::NotFound(format!("lease {lease}")))?;
            if record.resources.remove(resource) {
                tx.mark_dirty();
                debug!(namespace = %namespace, lease = %lease, ?resource, "lease resource removed");
            }
            Ok(())
        })
    }

    /// Lists the resources pinned by a lease.
    pub fn list_resources(&self, namespace: &str, lease: &str) -> Result<Vec<LeaseResource>> {
        self.db.view(|tx| {
            tx.bucket(namespace)
                .and_then(|b| b.leases.get(lease))
                .map(|r| r.resources.iter().cloned().collect())
                .ok_or_else(|| Error::NotFound(format!("lease {lease}")))
        })
    }
}

/// Adds `resource` to `lease` inside an open write transaction.
pub(crate) fn add_resource_tx(
    tx: &mut WriteTx,
    namespace: &str,
    lease: &str,
    resource: LeaseResource,
) -> Result<()> {
    let record = tx
        .existing_bucket_mut(namespace)
        .and_then(|b| b.leases.get_mut(lease))
        .ok_or_else(|| Error::NotFound(format!("lease {lease}")))?;
    if record.resources.insert(resource.clone()) {
        debug!(namespace = %namespace, lease = %lease, ?resource, "lease resource added");
    }
    Ok(())
}
