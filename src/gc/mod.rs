//! # Tri-Color Garbage Collection
//!
//! The collector is a pure reachability computation over [`Node`]s: given a
//! set of roots and a way to enumerate each node's outbound references, it
//! returns everything reachable. It performs no I/O and owns no threads; the
//! metadata store runs it inside a read snapshot so the graph cannot change
//! underneath it.
//!
//! ```text
//!   roots ──▶ gray stack ──pop──▶ references(node) ──push unseen──▶ gray stack
//!                                   │
//!                                   └──▶ reachable (tag bits stripped)
//! ```
//!
//! Anything not in the reachable set is safe to sweep, provided every
//! resource-creating operation roots its resource (usually through a lease)
//! before the resource becomes visible to other transactions.

pub mod scheduler;

pub use scheduler::{Collector, GcConfig, GcScheduler, GcStats};

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

// =============================================================================
// Resource Model
// =============================================================================

/// Type of a garbage-collectable resource.
///
/// Values `0..=31` identify the resource; the top three bits are reserved for
/// caller tagging and are stripped before a node enters the reachable set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceType(pub u8);

impl ResourceType {
    pub const UNKNOWN: Self = Self(0);
    pub const CONTENT: Self = Self(1);
    pub const SNAPSHOT: Self = Self(2);
    pub const CONTAINER: Self = Self(3);
    pub const TASK: Self = Self(4);
    pub const IMAGE: Self = Self(5);
    pub const LEASE: Self = Self(6);

    /// Mask selecting the untagged resource type.
    pub const MAX: u8 = 0x1f;

    /// Tag marking a node whose references must not be followed.
    pub const FLAT: u8 = 0x20;

    /// Returns the type with tag bits cleared.
    #[must_use]
    pub fn strip(self) -> Self {
        Self(self.0 & Self::MAX)
    }

    /// Returns the type with `tag` set.
    #[must_use]
    pub fn tagged(self, tag: u8) -> Self {
        Self(self.0 | (tag & !Self::MAX))
    }

    /// Returns true if `tag` is set.
    pub fn has_tag(self, tag: u8) -> bool {
        self.0 & tag & !Self::MAX != 0
    }
}

impl std::fmt::Display for ResourceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.strip() {
            Self::CONTENT => write!(f, "content"),
            Self::SNAPSHOT => write!(f, "snapshot"),
            Self::CONTAINER => write!(f, "container"),
            Self::TASK => write!(f, "task"),
            Self::IMAGE => write!(f, "image"),
            Self::LEASE => write!(f, "lease"),
            other => write!(f, "resource({})", other.0),
        }
    }
}

/// A namespaced, typed key identifying one collectable resource.
///
/// Identity is structural, so nodes are usable directly as set members.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Node {
    pub kind: ResourceType,
    pub namespace: String,
    pub key: String,
}

impl Node {
    /// Creates a node.
    pub fn new(kind: ResourceType, namespace: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            kind,
            namespace: namespace.into(),
            key: key.into(),
        }
    }

    /// Returns a copy with tag bits cleared.
    #[must_use]
    pub fn strip(&self) -> Self {
        Self {
            kind: self.kind.strip(),
            namespace: self.namespace.clone(),
            key: self.key.clone(),
        }
    }
}

impl std::fmt::Display for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.kind, self.namespace, self.key)
    }
}

// =============================================================================
// Mark
// =============================================================================

/// Enumerates the outbound references of a node.
pub trait ReferenceResolver {
    /// Returns every node `node` refers to.
    fn references(&self, node: &Node) -> Result<Vec<Node>>;
}

impl<F> ReferenceResolver for F
where
    F: Fn(&Node) -> Result<Vec<Node>>,
{
    fn references(&self, node: &Node) -> Result<Vec<Node>> {
        self(node)
    }
}

/// Computes the set of nodes reachable from `roots`.
///
/// Runs depth-first over an explicit gray stack. Each node is expanded at
/// most once. The result holds tag-stripped nodes, so nodes that differ only
/// in tag bits collapse into one entry.
///
/// A resolver error aborts the mark; no partial result is returned.
///
/// Runs in O(V + E) over the reachable subgraph. The caller must keep the
/// graph stable for the duration of the call.
pub fn tricolor<R>(roots: impl IntoIterator<Item = Node>, resolver: &R) -> Result<HashSet<Node>>
where
    R: ReferenceResolver + ?Sized,
{
    let mut grays: Vec<Node> = roots.into_iter().collect();
    let mut seen: HashSet<Node> = HashSet::new();
    let mut reachable: HashSet<Node> = HashSet::new();

    while let Some(node) = grays.pop() {
        // A node may be pushed twice before it is first popped.
        if !seen.insert(node.clone()) {
            continue;
        }

        for target in resolver.references(&node)? {
            if !seen.contains(&target) {
                grays.push(target);
            }
        }

        reachable.insert(node.strip());
    }

    Ok(reachable)
}

/// Calls `remove` for every node in `all` that is not reachable.
///
/// Returns the number of nodes removed.
pub fn sweep<F>(reachable: &HashSet<Node>, all: impl IntoIterator<Item = Node>, mut remove: F) -> Result<usize>
where
    F: FnMut(&Node) -> Result<()>,
{
    let mut removed = 0;
    for node in all {
        if !reachable.contains(&node.strip()) {
            remove(&node)?;
            removed += 1;
        }
    }
    Ok(removed)
}
