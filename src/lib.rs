//! # magikd
//!
//! **Container Control-Plane Core**
//!
//! This crate holds the parts of a container daemon that decide what lives
//! and what dies: a namespaced metadata store, lease-aware garbage
//! collection of content and snapshots, and supervision of the out-of-process
//! shims that run tasks.
//!
//! # Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                              magikd                                 │
//! ├─────────────────────────────────────────────────────────────────────┤
//! │  ┌─────────────────────────────────────────────────────────────┐    │
//! │  │                        Services                             │    │
//! │  │  content │ snapshots │ leases │ containers │ images │ tasks │    │
//! │  └─────────────────────────────────────────────────────────────┘    │
//! │                │                                      │             │
//! │  ┌─────────────┼──────────────────────┐   ┌───────────┼─────────┐   │
//! │  │          MetadataDb                │   │      ShimManager    │   │
//! │  │  view / update transactions        │   │  NsMap<ShimTask>    │   │
//! │  │  mutation hook ──┐                 │   │  bundles, binaries  │   │
//! │  └──────────────────┼─────────────────┘   └───────────┬─────────┘   │
//! │                     ▼                                 │ JSON-line   │
//! │  ┌─────────────────────────────────────┐              │ RPC         │
//! │  │            GcScheduler              │              ▼             │
//! │  │  tricolor mark ─▶ sweep records     │   ┌─────────────────────┐  │
//! │  │  ─▶ orphan blobs ─▶ snapshots       │   │  shim processes     │  │
//! │  └─────────────────────────────────────┘   │  events ─▶ Exchange │  │
//! │                                            └─────────────────────┘  │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Garbage Collection
//!
//! Resources (content, snapshots, images, leases) survive only while they are
//! reachable from a root: a container, an unexpired image, or an unexpired
//! lease. Labels on records add edges (`magik.io/gc.ref.content`,
//! `magik.io/gc.ref.snapshot.<snapshotter>`). A pass marks inside a read
//! transaction, then sweeps inside a write transaction, re-marking if
//! anything committed in between. A pass that cannot resolve the graph
//! deletes nothing.
//!
//! # Task Lifecycle
//!
//! ```text
//!   create_task ──▶ bundle ──▶ binary start ──▶ load_shim ──▶ create
//!                                                     │
//!        delete_task ◄── running ◄── start ◄──────────┘
//!             │                 │
//!             │                 │ shim dies
//!             ▼                 ▼
//!        TaskDelete     cleanup_after_dead_shim ──▶ TaskExit + TaskDelete
//! ```
//!
//! Whichever path removes a task from the registry publishes its final
//! events; the other path publishes nothing.
//!
//! # Example
//!
//! ```rust,ignore
//! use magikd::{DaemonConfig, DeleteOptions, LeaseOptions, Services};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> magikd::Result<()> {
//!     let config = DaemonConfig::new("/var/lib/magikd", "/run/magikd")
//!         .with_runtime("runc", "/usr/bin/magik-shim-runc");
//!     let services = Services::open(config, Vec::new()).await?;
//!
//!     let lease = services.leases().create(
//!         "default",
//!         LeaseOptions::new().random_id().with_expiration(Duration::from_secs(3600)),
//!     )?;
//!     services
//!         .content()
//!         .write("default", Some(&lease.id), b"layer", None, Default::default())
//!         .await?;
//!     services
//!         .leases()
//!         .delete("default", &lease.id, DeleteOptions::synchronous())
//!         .await?;
//!     Ok(())
//! }
//! ```

pub mod constants;
pub mod error;
pub mod events;
pub mod gc;
pub mod metadata;
pub mod namespaces;
pub mod nsmap;
pub mod services;
pub mod shim;
pub mod storage;

// Re-exports
pub use constants::*;
pub use error::{Error, ErrorCode, ErrorKind, Result};
pub use events::{Envelope, Event, Exchange};
pub use gc::{Collector, GcConfig, GcScheduler, GcStats, Node, ResourceType};
pub use metadata::{
    Container, ContainerStore, ContentInfo, ContentStore, DeleteOptions, Image, ImageStore, Labels,
    Lease, LeaseFilter, LeaseManager, LeaseOptions, LeaseResource, MetadataDb, SnapshotInfo,
    SnapshotStore, Snapshotter,
};
pub use nsmap::NsMap;
pub use services::{Capability, DaemonConfig, Service, Services};
pub use shim::{
    BinaryCall, BootstrapParams, Bundle, CreateTaskOptions, Process, ShimBinary, ShimManager,
    ShimProcess, ShimTask, Signal, cleanup_after_dead_shim, load_shim,
};
pub use storage::{BlobStore, KeyedLocker, LocalLocker};
