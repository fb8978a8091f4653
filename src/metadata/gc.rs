//! Collector glue: roots, references and sweeping over the metadata state.
//!
//! ## Graph
//!
//! ```text
//!   lease ──▶ content | snapshot | image        (flat lease: children not followed)
//!   image ──▶ target content, label refs
//!   container ──▶ snapshot, label refs
//!   snapshot ──▶ parent snapshot, label refs
//!   content ──▶ label refs
//! ```
//!
//! Roots are unexpired leases and images, all containers, and content or
//! snapshots labelled `gc.root`. Content, snapshots, leases and images are
//! collectable; containers are only ever removed explicitly.

use super::leases::{LeaseResource, parse_expiry};
use super::snapshots::{SnapshotRemoval, lock_key};
use super::{DbState, Labels, MetadataDb, WriteTx};
use crate::constants::{LABEL_GC_FLAT, LABEL_GC_REF_CONTENT, LABEL_GC_REF_SNAPSHOT, LABEL_GC_ROOT};
use crate::error::{Error, Result};
use crate::gc::{self, Collector, GcStats, Node, ResourceType};
use crate::storage::KeyedLocker;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::time::Instant;
use tracing::{debug, info, warn};

fn snapshot_node(namespace: &str, snapshotter: &str, key: &str) -> Node {
    Node::new(ResourceType::SNAPSHOT, namespace, format!("{snapshotter}/{key}"))
}

/// An unparseable expiry never expires.
fn expired(node: &Node, labels: &Labels, now: DateTime<Utc>) -> bool {
    match parse_expiry(labels) {
        Ok(at) => at.is_some_and(|at| at <= now),
        Err(e) => {
            warn!(node = %node, error = %e, "ignoring invalid expiry");
            false
        }
    }
}

/// Returns the nodes named by `gc.ref.*` labels.
fn label_refs(namespace: &str, labels: &Labels) -> Vec<Node> {
    let mut refs = Vec::new();
    for (key, value) in labels {
        if value.is_empty() {
            continue;
        }
        if key == LABEL_GC_REF_CONTENT
            || key
                .strip_prefix(LABEL_GC_REF_CONTENT)
                .is_some_and(|rest| rest.starts_with('.'))
        {
            refs.push(Node::new(ResourceType::CONTENT, namespace, value.clone()));
        } else if let Some(rest) = key.strip_prefix(LABEL_GC_REF_SNAPSHOT) {
            let snapshotter = rest.split('/').next().unwrap_or_default();
            if !snapshotter.is_empty() {
                refs.push(snapshot_node(namespace, snapshotter, value));
            }
        }
    }
    refs
}

/// Collects the root set.
pub(crate) fn scan_roots(state: &DbState, now: DateTime<Utc>) -> Vec<Node> {
    let mut roots = Vec::new();
    for (ns, bucket) in &state.namespaces {
        for (id, lease) in &bucket.leases {
            let node = Node::new(ResourceType::LEASE, ns.as_str(), id.as_str());
            if !expired(&node, &lease.labels, now) {
                roots.push(node);
            }
        }
        for (name, image) in &bucket.images {
            let node = Node::new(ResourceType::IMAGE, ns.as_str(), name.as_str());
            if !expired(&node, &image.labels, now) {
                roots.push(node);
            }
        }
        for id in bucket.containers.keys() {
            roots.push(Node::new(ResourceType::CONTAINER, ns.as_str(), id.as_str()));
        }
        for (digest, info) in &bucket.content {
            if info.labels.contains_key(LABEL_GC_ROOT) {
                roots.push(Node::new(ResourceType::CONTENT, ns.as_str(), digest.as_str()));
            }
        }
        for (snapshotter, snapshots) in &bucket.snapshots {
            for (key, info) in snapshots {
                if info.labels.contains_key(LABEL_GC_ROOT) {
                    roots.push(snapshot_node(ns, snapshotter, key));
                }
            }
        }
    }
    roots
}

/// Resolves the outbound references of `node`.
pub(crate) fn references(state: &DbState, node: &Node) -> Result<Vec<Node>> {
    if node.kind.has_tag(ResourceType::FLAT) {
        return Ok(Vec::new());
    }
    let ns = node.namespace.as_str();
    let Some(bucket) = state.namespaces.get(ns) else {
        return Ok(Vec::new());
    };

    let refs = match node.kind {
        ResourceType::LEASE => {
            let Some(lease) = bucket.leases.get(&node.key) else {
                return Ok(Vec::new());
            };
            let flat = lease.labels.contains_key(LABEL_GC_FLAT);
            lease
                .resources
                .iter()
                .map(|resource| {
                    let target = match resource {
                        LeaseResource::Content { digest } => {
                            Node::new(ResourceType::CONTENT, ns, digest.as_str())
                        }
                        LeaseResource::Snapshot { snapshotter, key } => snapshot_node(ns, snapshotter, key),
                        LeaseResource::Image { name } => Node::new(ResourceType::IMAGE, ns, name.as_str()),
                    };
                    if flat {
                        Node {
                            kind: target.kind.tagged(ResourceType::FLAT),
                            ..target
                        }
                    } else {
                        target
                    }
                })
                .collect()
        }
        ResourceType::CONTENT => bucket
            .content
            .get(&node.key)
            .map(|info| label_refs(ns, &info.labels))
            .unwrap_or_default(),
        ResourceType::SNAPSHOT => {
            let (snapshotter, key) = node
                .key
                .split_once('/')
                .ok_or_else(|| Error::Internal(format!("malformed snapshot node {node}")))?;
            match bucket.snapshots.get(snapshotter).and_then(|s| s.get(key)) {
                Some(info) => {
                    let mut refs = label_refs(ns, &info.labels);
                    if let Some(parent) = &info.parent {
                        refs.push(snapshot_node(ns, snapshotter, parent));
                    }
                    refs
                }
                None => Vec::new(),
            }
        }
        ResourceType::IMAGE => match bucket.images.get(&node.key) {
            Some(image) => {
                let mut refs = label_refs(ns, &image.labels);
                refs.push(Node::new(ResourceType::CONTENT, ns, image.target.as_str()));
                refs
            }
            None => Vec::new(),
        },
        ResourceType::CONTAINER => match bucket.containers.get(&node.key) {
            Some(container) => {
                let mut refs = label_refs(ns, &container.labels);
                if let (Some(snapshotter), Some(key)) = (&container.snapshotter, &container.snapshot_key) {
                    refs.push(snapshot_node(ns, snapshotter, key));
                }
                refs
            }
            None => Vec::new(),
        },
        _ => Vec::new(),
    };
    Ok(refs)
}

/// Lists every collectable node.
pub(crate) fn scan_all(state: &DbState) -> Vec<Node> {
    let mut nodes = Vec::new();
    for (ns, bucket) in &state.namespaces {
        nodes.extend(
            bucket
                .content
                .keys()
                .map(|d| Node::new(ResourceType::CONTENT, ns.as_str(), d.as_str())),
        );
        for (snapshotter, snapshots) in &bucket.snapshots {
            nodes.extend(snapshots.keys().map(|k| snapshot_node(ns, snapshotter, k)));
        }
        nodes.extend(
            bucket
                .leases
                .keys()
                .map(|id| Node::new(ResourceType::LEASE, ns.as_str(), id.as_str())),
        );
        nodes.extend(
            bucket
                .images
                .keys()
                .map(|n| Node::new(ResourceType::IMAGE, ns.as_str(), n.as_str())),
        );
    }
    nodes
}

/// Computes the reachable set of `state`.
pub(crate) fn mark(state: &DbState, now: DateTime<Utc>) -> Result<HashSet<Node>> {
    let roots = scan_roots(state, now);
    gc::tricolor(roots, &|node: &Node| references(state, node))
}

/// Removes one record from the transaction's state.
fn remove(tx: &mut WriteTx, node: &Node, stats: &mut GcStats, snapshots: &mut Vec<SnapshotRemoval>) -> Result<()> {
    let ns = node.namespace.as_str();
    let Some(bucket) = tx.existing_bucket_mut(ns) else {
        return Ok(());
    };
    match node.kind {
        ResourceType::CONTENT => {
            if bucket.content.remove(&node.key).is_some() {
                stats.content += 1;
            }
        }
        ResourceType::SNAPSHOT => {
            let (snapshotter, key) = node
                .key
                .split_once('/')
                .ok_or_else(|| Error::Internal(format!("malformed snapshot node {node}")))?;
            if let Some(info) = bucket.snapshots.get_mut(snapshotter).and_then(|s| s.remove(key)) {
                stats.snapshots += 1;
                snapshots.push(SnapshotRemoval::new(ns, snapshotter, key, info.created_at));
            }
        }
        ResourceType::LEASE => {
            if bucket.leases.remove(&node.key).is_some() {
                stats.leases += 1;
            }
        }
        ResourceType::IMAGE => {
            if bucket.images.remove(&node.key).is_some() {
                stats.images += 1;
            }
        }
        _ => {}
    }
    debug!(node = %node, "removed unreachable record");
    Ok(())
}

impl MetadataDb {
    /// Runs one mark-and-sweep pass.
    ///
    /// 1. Mark inside a read snapshot.
    /// 2. Sweep records in one write transaction. If another write committed
    ///    after the snapshot, the mark is recomputed inside the write
    ///    transaction so nothing rooted in the meantime is removed.
    /// 3. After commit, remove unreferenced blobs from the blob store, and
    ///    swept or explicitly removed snapshots from their backends.
    ///
    /// Any failure to resolve the graph aborts the pass with nothing removed.
    pub async fn garbage_collect(&self) -> Result<GcStats> {
        let started = Instant::now();
        let now = Utc::now();

        let (marked, sequence) = self.view(|tx| Ok((mark(tx.state(), now)?, tx.sequence())))?;

        let (mut stats, mut snapshots) = self.update_quiet(|tx| {
            let reachable = if tx.base_sequence() == sequence {
                marked
            } else {
                debug!(
                    marked_at = sequence,
                    current = tx.base_sequence(),
                    "metadata changed during mark, re-marking"
                );
                mark(tx.state(), now)?
            };

            let mut stats = GcStats::default();
            let mut snapshots = tx.take_snapshot_removals();
            let all = scan_all(tx.state());
            gc::sweep(&reachable, all, |node| remove(tx, node, &mut stats, &mut snapshots))?;
            if stats.removed() > 0 {
                tx.mark_dirty();
            }
            Ok((stats, snapshots))
        })?;

        let blobs_removed = self.remove_orphan_blobs()?;

        // Children were created after their parents; remove them first.
        snapshots.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        for removal in snapshots {
            if let Err(e) = self.remove_backend_snapshot(&removal).await {
                warn!(
                    snapshotter = %removal.snapshotter,
                    key = %removal.backend_key(),
                    error = %e,
                    "failed to remove snapshot"
                );
            }
        }

        stats.elapsed = started.elapsed();
        info!(
            leases = stats.leases,
            content = stats.content,
            snapshots = stats.snapshots,
            images = stats.images,
            blobs = blobs_removed,
            elapsed = ?stats.elapsed,
            "metadata garbage collection complete"
        );
        Ok(stats)
    }

    /// Removes a backend snapshot unless its key was prepared again since
    /// the record was dropped.
    async fn remove_backend_snapshot(&self, removal: &SnapshotRemoval) -> Result<()> {
        let backend = self.snapshotter(&removal.snapshotter)?;
        let target = removal.backend_key();
        let _guard = self
            .snapshot_locks()
            .lock(&lock_key(&removal.snapshotter, &target))
            .await?;
        let recorded = self.view(|tx| {
            Ok(tx
                .state()
                .snapshot_recorded(&removal.namespace, &removal.snapshotter, &removal.key))
        })?;
        if recorded {
            debug!(snapshotter = %removal.snapshotter, key = %target, "snapshot prepared again, keeping it");
            return Ok(());
        }
        backend.remove(&target).await?;
        debug!(snapshotter = %removal.snapshotter, key = %target, "removed snapshot");
        Ok(())
    }

    /// Removes blobs no namespace holds a record for.
    ///
    /// A blob whose digest lock is held is skipped; its writer is about to
    /// commit a record for it.
    fn remove_orphan_blobs(&self) -> Result<usize> {
        let blobs = self.blobs();
        let mut removed = 0;
        for digest in blobs.list_blobs()? {
            let _guard = match blobs.locker().try_lock(&digest) {
                Ok(guard) => guard,
                Err(_) => {
                    debug!(digest = %digest, "blob locked, skipping");
                    continue;
                }
            };
            if self.view(|tx| Ok(tx.state().content_referenced(&digest)))? {
                continue;
            }
            match blobs.remove_blob(&digest) {
                Ok(()) => {
                    debug!(digest = %digest, "removed blob");
                    removed += 1;
                }
                Err(e) => warn!(digest = %digest, error = %e, "failed to remove blob"),
            }
        }
        Ok(removed)
    }
}

#[async_trait]
impl Collector for MetadataDb {
    async fn garbage_collect(&self) -> Result<GcStats> {
        MetadataDb::garbage_collect(self).await
    }
}
