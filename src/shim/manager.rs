//! Shim manager: spawns, reconnects and deletes task shims.

use super::binary::{BinaryCall, ShimBinary};
use super::bundle::Bundle;
use super::cleanup::cleanup_after_dead_shim;
use super::client::OnClose;
use super::protocol::{CreateTaskRequest, Exit, Mount};
use super::task::{Process, ShimTask};
use super::load_shim;
use crate::constants::{TASK_STATE_DIR, validate_identifier};
use crate::error::{Error, Result};
use crate::events::{Event, Exchange};
use crate::namespaces;
use crate::nsmap::NsMap;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Options for [`ShimManager::create_task`].
#[derive(Debug, Clone, Default)]
pub struct CreateTaskOptions {
    /// Runtime name, resolved to a shim binary.
    pub runtime: String,
    /// Runtime spec written to the bundle's `config.json`.
    pub spec: Option<serde_json::Value>,
    pub rootfs: Vec<Mount>,
    pub terminal: bool,
    pub stdin: Option<String>,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
    /// Runtime specific options passed through to the shim.
    pub options: Option<serde_json::Value>,
}

impl CreateTaskOptions {
    /// Options for `runtime` with no spec and no stdio.
    pub fn new(runtime: impl Into<String>) -> Self {
        Self {
            runtime: runtime.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_spec(mut self, spec: serde_json::Value) -> Self {
        self.spec = Some(spec);
        self
    }

    #[must_use]
    pub fn with_rootfs(mut self, mount: Mount) -> Self {
        self.rootfs.push(mount);
        self
    }

    #[must_use]
    pub fn with_stdio(
        mut self,
        stdin: Option<String>,
        stdout: Option<String>,
        stderr: Option<String>,
    ) -> Self {
        self.stdin = stdin;
        self.stdout = stdout;
        self.stderr = stderr;
        self
    }
}

/// Supervises the shims of every task.
pub struct ShimManager {
    root: PathBuf,
    events: Exchange,
    tasks: Arc<NsMap<Arc<ShimTask>>>,
    runtimes: HashMap<String, Arc<ShimBinary>>,
}

impl std::fmt::Debug for ShimManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShimManager")
            .field("root", &self.root)
            .field("runtimes", &self.runtimes.keys().collect::<Vec<_>>())
            .field("tasks", &self.tasks.len())
            .finish()
    }
}

impl ShimManager {
    /// Creates a manager keeping bundles under `<state>/tasks`.
    pub fn new(state: &Path, events: Exchange) -> Result<Self> {
        let root = state.join(TASK_STATE_DIR);
        std::fs::create_dir_all(&root).map_err(|e| Error::StorageInitFailed {
            path: root.clone(),
            reason: e.to_string(),
        })?;
        Ok(Self {
            root,
            events,
            tasks: Arc::new(NsMap::new()),
            runtimes: HashMap::new(),
        })
    }

    /// Registers the shim binary serving `name`.
    #[must_use]
    pub fn with_runtime(mut self, name: impl Into<String>, binary: ShimBinary) -> Self {
        self.runtimes.insert(name.into(), Arc::new(binary));
        self
    }

    /// Directory holding the task bundles.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn runtime(&self, name: &str) -> Result<Arc<ShimBinary>> {
        self.runtimes
            .get(name)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("runtime {name:?}")))
    }

    /// Builds the callback run when the shim of `bundle` dies unexpectedly.
    fn on_close(&self, bundle: &Bundle, binary: Arc<ShimBinary>) -> OnClose {
        let tasks = Arc::clone(&self.tasks);
        let events = self.events.clone();
        let namespace = bundle.namespace().to_string();
        let id = bundle.id().to_string();
        let path = bundle.path().to_path_buf();
        Box::new(move || {
            tokio::spawn(async move {
                cleanup_after_dead_shim(&namespace, &id, tasks.as_ref(), &events, binary.as_ref(), &path)
                    .await;
            });
        })
    }

    // =========================================================================
    // Task Lifecycle
    // =========================================================================

    /// Starts a shim for a new task and creates the task in it.
    ///
    /// Any failure after the bundle was created undoes every step taken so
    /// far: the connection is closed, the shim binary is asked to delete and
    /// the bundle is removed.
    pub async fn create_task(
        &self,
        namespace: &str,
        id: &str,
        opts: CreateTaskOptions,
    ) -> Result<Arc<ShimTask>> {
        namespaces::validate(namespace)?;
        validate_identifier(id)
            .map_err(|reason| Error::InvalidArgument(format!("task id {id:?}: {reason}")))?;
        if self.tasks.contains(namespace, id) {
            return Err(Error::AlreadyExists(format!("task {namespace}/{id}")));
        }
        let binary = self.runtime(&opts.runtime)?;
        let bundle = Bundle::create(&self.root, namespace, id, &opts.runtime, opts.spec.as_ref())?;

        if let Err(e) = binary.start(&bundle).await {
            self.rollback(&bundle, &binary, None).await;
            return Err(e);
        }

        let on_close = self.on_close(&bundle, Arc::clone(&binary));
        let shim = match load_shim(bundle.clone(), &self.events, on_close).await {
            Ok(shim) => shim,
            Err(e) => {
                self.rollback(&bundle, &binary, None).await;
                return Err(e);
            }
        };
        let task = Arc::new(ShimTask::new(shim));

        let request = CreateTaskRequest {
            rootfs: opts.rootfs,
            terminal: opts.terminal,
            stdin: opts.stdin,
            stdout: opts.stdout,
            stderr: opts.stderr,
            options: opts.options,
            ..CreateTaskRequest::default()
        };
        let registered = match task.create(request).await {
            Ok(_) => self.tasks.add(namespace, id, Arc::clone(&task)),
            Err(e) => Err(e),
        };
        if let Err(e) = registered {
            self.rollback(&bundle, &binary, Some(&task)).await;
            return Err(e);
        }
        self.reconcile_if_lost(&task, binary.as_ref()).await?;

        info!(namespace = %namespace, id = %id, runtime = %opts.runtime, "task registered");
        Ok(task)
    }

    async fn rollback(&self, bundle: &Bundle, binary: &ShimBinary, task: Option<&ShimTask>) {
        if let Some(task) = task {
            task.close().await;
        }
        if let Err(e) = binary.delete(bundle.namespace(), bundle.id(), bundle.path()).await {
            debug!(namespace = %bundle.namespace(), id = %bundle.id(), error = %e, "shim delete during rollback failed");
        }
        if let Err(e) = bundle.delete() {
            warn!(namespace = %bundle.namespace(), id = %bundle.id(), error = %e, "failed to remove bundle during rollback");
        }
    }

    /// Runs dead-shim cleanup for a just-registered task whose connection is
    /// already gone.
    ///
    /// The close callback of a shim lost before registration found no task
    /// to remove, so the cleanup runs here instead.
    async fn reconcile_if_lost(&self, task: &ShimTask, binary: &ShimBinary) -> Result<()> {
        if !task.shim().channel().state().is_terminal() {
            return Ok(());
        }
        let (namespace, id) = (task.namespace(), task.id());
        warn!(namespace = %namespace, id = %id, "shim exited before its task was registered");
        cleanup_after_dead_shim(
            namespace,
            id,
            self.tasks.as_ref(),
            &self.events,
            binary,
            task.bundle().path(),
        )
        .await;
        Err(Error::ConnectionClosed)
    }

    /// Reconnects to the running shim of an existing bundle and registers
    /// its task.
    pub async fn load_task(&self, namespace: &str, id: &str) -> Result<Arc<ShimTask>> {
        let bundle = Bundle::load(&self.root, namespace, id)?;
        let binary = self.runtime(&bundle.runtime()?)?;
        let on_close = self.on_close(&bundle, Arc::clone(&binary));
        let task = Arc::new(ShimTask::new(load_shim(bundle, &self.events, on_close).await?));

        if let Err(e) = self.tasks.add(namespace, id, Arc::clone(&task)) {
            task.close().await;
            return Err(e);
        }
        self.reconcile_if_lost(&task, binary.as_ref()).await?;
        debug!(namespace = %namespace, id = %id, "task reconnected");
        Ok(task)
    }

    /// Reconnects to every shim with a bundle under the state dir.
    ///
    /// Bundles whose shim cannot be reached are cleaned up through the
    /// binary delete path and removed.
    pub async fn load_existing(&self) -> Result<Vec<Arc<ShimTask>>> {
        let mut loaded = Vec::new();
        for (namespace, id) in Bundle::list(&self.root)? {
            if self.tasks.contains(&namespace, &id) {
                continue;
            }
            match self.load_task(&namespace, &id).await {
                Ok(task) => loaded.push(task),
                Err(e) => {
                    warn!(namespace = %namespace, id = %id, error = %e, "cleaning up unreachable shim");
                    self.cleanup_bundle(&namespace, &id).await;
                }
            }
        }
        info!(count = loaded.len(), "reconnected existing shims");
        Ok(loaded)
    }

    async fn cleanup_bundle(&self, namespace: &str, id: &str) {
        let Ok(bundle) = Bundle::load(&self.root, namespace, id) else {
            return;
        };
        match bundle.runtime().and_then(|name| self.runtime(&name)) {
            Ok(binary) => {
                cleanup_after_dead_shim(
                    namespace,
                    id,
                    self.tasks.as_ref(),
                    &self.events,
                    binary.as_ref(),
                    bundle.path(),
                )
                .await;
            }
            Err(e) => {
                debug!(namespace = %namespace, id = %id, error = %e, "no runtime to clean up bundle with");
            }
        }
        if let Err(e) = bundle.delete() {
            warn!(namespace = %namespace, id = %id, error = %e, "failed to remove bundle");
        }
    }

    /// Returns a registered task.
    pub fn get(&self, namespace: &str, id: &str) -> Result<Arc<ShimTask>> {
        self.tasks.get(namespace, id)
    }

    /// Returns every registered task of `namespace`.
    pub fn tasks(&self, namespace: &str) -> Result<Vec<Arc<ShimTask>>> {
        self.tasks.get_all(namespace)
    }

    /// Deletes a task and tears down its shim.
    ///
    /// `TaskDelete` is published only if this call removed the task from the
    /// registry, so a racing dead-shim cleanup cannot double it.
    pub async fn delete_task(&self, namespace: &str, id: &str) -> Result<Exit> {
        let task = self.tasks.get(namespace, id)?;
        let mut removed = false;
        let exit = task
            .delete(false, || removed = self.tasks.delete(namespace, id).is_some())
            .await?;

        if removed {
            self.events.publish(
                namespace,
                Event::TaskDelete {
                    container_id: task.id().to_string(),
                    pid: exit.pid,
                    exit_status: exit.exit_status,
                    exited_at: exit.exited_at,
                },
            );
        }
        Ok(exit)
    }
}
