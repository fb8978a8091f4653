//! Typed service registry and composition root.
//!
//! Every capability the daemon offers is a variant of [`Capability`] and is
//! resolved exactly once, in [`Services::open`]. Callers then use the typed
//! accessors; nothing is looked up by string or downcast at runtime.
//!
//! ```text
//!   DaemonConfig ──▶ Services::open
//!                      ├── BlobStore        <root>/blobs
//!                      ├── MetadataDb       <root>/meta.json
//!                      │     └── mutation hook ──▶ GcScheduler
//!                      ├── Content / Snapshot / Lease / Container / Image stores
//!                      ├── Exchange
//!                      └── ShimManager      <state>/tasks
//! ```

use crate::constants::{BLOB_STORE_DIR, METADATA_FILE};
use crate::error::Result;
use crate::events::Exchange;
use crate::gc::{Collector, GcConfig, GcScheduler};
use crate::metadata::{
    ContainerStore, ContentStore, ImageStore, LeaseManager, MetadataDb, SnapshotStore, Snapshotter,
};
use crate::shim::{ShimBinary, ShimManager};
use crate::storage::BlobStore;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

// =============================================================================
// Configuration
// =============================================================================

/// Daemon configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Persistent data: blobs and the metadata file.
    pub root: PathBuf,
    /// Ephemeral data: task bundles.
    pub state: PathBuf,
    /// Address shims use to reach the daemon.
    pub address: String,
    pub gc: GcConfig,
    /// Runtime name → shim binary path.
    pub runtimes: HashMap<String, PathBuf>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        let base = dirs::home_dir()
            .map(|home| home.join(".magikd"))
            .unwrap_or_else(|| PathBuf::from(".magikd"));
        Self {
            root: base.join("root"),
            state: dirs::runtime_dir()
                .map(|run| run.join("magikd"))
                .unwrap_or_else(|| base.join("state")),
            address: String::new(),
            gc: GcConfig::default(),
            runtimes: HashMap::new(),
        }
    }
}

impl DaemonConfig {
    /// Configuration rooted at `root` with state under `state`.
    pub fn new(root: impl Into<PathBuf>, state: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            state: state.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_gc(mut self, gc: GcConfig) -> Self {
        self.gc = gc;
        self
    }

    #[must_use]
    pub fn with_runtime(mut self, name: impl Into<String>, binary: impl Into<PathBuf>) -> Self {
        self.runtimes.insert(name.into(), binary.into());
        self
    }

    #[must_use]
    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = address.into();
        self
    }
}

// =============================================================================
// Capabilities
// =============================================================================

/// Capabilities resolved at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    Metadata,
    Content,
    Snapshots,
    Leases,
    Containers,
    Images,
    Tasks,
    Events,
    Gc,
}

impl Capability {
    /// Every capability, in startup order.
    pub const ALL: [Self; 9] = [
        Self::Metadata,
        Self::Content,
        Self::Snapshots,
        Self::Leases,
        Self::Containers,
        Self::Images,
        Self::Tasks,
        Self::Events,
        Self::Gc,
    ];
}

/// A resolved capability.
#[derive(Debug, Clone)]
pub enum Service {
    Metadata(Arc<MetadataDb>),
    Content(ContentStore),
    Snapshots(SnapshotStore),
    Leases(LeaseManager),
    Containers(ContainerStore),
    Images(ImageStore),
    Tasks(Arc<ShimManager>),
    Events(Exchange),
    Gc(Arc<GcScheduler>),
}

impl Service {
    /// The capability this service provides.
    pub fn capability(&self) -> Capability {
        match self {
            Self::Metadata(_) => Capability::Metadata,
            Self::Content(_) => Capability::Content,
            Self::Snapshots(_) => Capability::Snapshots,
            Self::Leases(_) => Capability::Leases,
            Self::Containers(_) => Capability::Containers,
            Self::Images(_) => Capability::Images,
            Self::Tasks(_) => Capability::Tasks,
            Self::Events(_) => Capability::Events,
            Self::Gc(_) => Capability::Gc,
        }
    }
}

// =============================================================================
// Services
// =============================================================================

/// Every daemon service, wired together.
#[derive(Debug, Clone)]
pub struct Services {
    db: Arc<MetadataDb>,
    content: ContentStore,
    snapshots: SnapshotStore,
    leases: LeaseManager,
    containers: ContainerStore,
    images: ImageStore,
    tasks: Arc<ShimManager>,
    events: Exchange,
    gc: Arc<GcScheduler>,
}

impl Services {
    /// Opens every service and reconnects to the shims left running by a
    /// previous daemon.
    ///
    /// Must be called from within a tokio runtime: the GC scheduler is
    /// spawned here.
    pub async fn open(
        config: DaemonConfig,
        snapshotters: Vec<(String, Arc<dyn Snapshotter>)>,
    ) -> Result<Self> {
        let blobs = Arc::new(BlobStore::with_path(config.root.join(BLOB_STORE_DIR))?);
        let db = snapshotters
            .into_iter()
            .fold(MetadataDb::open(config.root.join(METADATA_FILE), blobs)?, |db, (name, backend)| {
                db.with_snapshotter(name, backend)
            });
        let db = Arc::new(db);

        let collector: Arc<dyn Collector> = Arc::clone(&db) as Arc<dyn Collector>;
        let gc = Arc::new(GcScheduler::start(collector, config.gc.clone()));
        db.set_mutation_hook(gc.hook())?;

        let events = Exchange::new();
        let tasks = config.runtimes.iter().fold(
            ShimManager::new(&config.state, events.clone())?,
            |manager, (name, binary)| {
                manager.with_runtime(name.clone(), ShimBinary::new(binary, config.address.clone()))
            },
        );
        let tasks = Arc::new(tasks);
        tasks.load_existing().await?;

        info!(
            root = %config.root.display(),
            state = %config.state.display(),
            runtimes = config.runtimes.len(),
            "services opened"
        );

        Ok(Self {
            content: ContentStore::new(Arc::clone(&db)),
            snapshots: SnapshotStore::new(Arc::clone(&db)),
            leases: LeaseManager::new(Arc::clone(&db)).with_scheduler(Arc::clone(&gc)),
            containers: ContainerStore::new(Arc::clone(&db)),
            images: ImageStore::new(Arc::clone(&db)).with_scheduler(Arc::clone(&gc)),
            db,
            tasks,
            events,
            gc,
        })
    }

    /// Returns the service providing `capability`.
    pub fn get(&self, capability: Capability) -> Service {
        match capability {
            Capability::Metadata => Service::Metadata(Arc::clone(&self.db)),
            Capability::Content => Service::Content(self.content.clone()),
            Capability::Snapshots => Service::Snapshots(self.snapshots.clone()),
            Capability::Leases => Service::Leases(self.leases.clone()),
            Capability::Containers => Service::Containers(self.containers.clone()),
            Capability::Images => Service::Images(self.images.clone()),
            Capability::Tasks => Service::Tasks(Arc::clone(&self.tasks)),
            Capability::Events => Service::Events(self.events.clone()),
            Capability::Gc => Service::Gc(Arc::clone(&self.gc)),
        }
    }

    pub fn metadata(&self) -> &Arc<MetadataDb> {
        &self.db
    }

    pub fn content(&self) -> &ContentStore {
        &self.content
    }

    pub fn snapshots(&self) -> &SnapshotStore {
        &self.snapshots
    }

    pub fn leases(&self) -> &LeaseManager {
        &self.leases
    }

    pub fn containers(&self) -> &ContainerStore {
        &self.containers
    }

    pub fn images(&self) -> &ImageStore {
        &self.images
    }

    pub fn tasks(&self) -> &Arc<ShimManager> {
        &self.tasks
    }

    pub fn events(&self) -> &Exchange {
        &self.events
    }

    pub fn gc(&self) -> &Arc<GcScheduler> {
        &self.gc
    }

    /// Stops the GC scheduler.
    pub async fn shutdown(&self) {
        self.gc.stop().await;
        info!("services shut down");
    }
}
