//! Task service proxies.
//!
//! [`ShimTask`] drives the init process of a task through its shim;
//! [`ShimProcess`] drives one exec process of that task over the same
//! connection. Both implement [`Process`].

use super::Shim;
use super::bundle::Bundle;
use super::client::RpcChannel;
use super::protocol::{
    ConnectInfo, CreateTaskRequest, Exit, ExecProcessRequest, ExitStatus, ProcessInfo, Request,
    ResponseData, Signal, TaskState,
};
use crate::constants::SHUTDOWN_TIMEOUT;
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::time::timeout;
use tracing::{debug, info, warn};

// =============================================================================
// Process Trait
// =============================================================================

/// Operations shared by a task's init process and its exec processes.
#[async_trait]
pub trait Process: Send + Sync {
    /// Task id for the init process, exec id otherwise.
    fn id(&self) -> &str;

    /// Starts the process and returns its pid.
    async fn start(&self) -> Result<u32>;

    /// Sends `signal`; with `all`, to every process of the task.
    async fn kill(&self, signal: Signal, all: bool) -> Result<()>;

    /// Resizes the process terminal.
    async fn resize_pty(&self, width: u32, height: u32) -> Result<()>;

    /// Closes the process stdin.
    async fn close_io(&self) -> Result<()>;

    /// Waits for the process to exit.
    ///
    /// The call runs on its own spawned task, so dropping the returned
    /// future does not abandon the RPC mid-flight.
    async fn wait(&self) -> Result<ExitStatus>;

    /// Current state of the process.
    async fn state(&self) -> Result<TaskState>;
}

fn unexpected(expected: &str, got: Option<ResponseData>) -> Error {
    Error::Internal(format!(
        "unexpected shim response: expected {expected}, got {}",
        got.as_ref().map_or("nothing", ResponseData::name)
    ))
}

/// Calls shared by both proxies, addressed by task id and optional exec id.
#[derive(Debug, Clone)]
struct Target {
    shim: Arc<Shim>,
    exec_id: Option<String>,
}

impl Target {
    fn channel(&self) -> &RpcChannel {
        self.shim.channel()
    }

    fn task_id(&self) -> String {
        self.shim.id().to_string()
    }

    async fn start(&self) -> Result<u32> {
        let request = Request::Start {
            id: self.task_id(),
            exec_id: self.exec_id.clone(),
        };
        match self.channel().call(request).await? {
            Some(ResponseData::Pid { pid }) => Ok(pid),
            other => Err(unexpected("pid", other)),
        }
    }

    async fn kill(&self, signal: Signal, all: bool) -> Result<()> {
        debug!(id = %self.shim.id(), exec_id = ?self.exec_id, signal = %signal, all, "killing process");
        self.channel()
            .call(Request::Kill {
                id: self.task_id(),
                exec_id: self.exec_id.clone(),
                signal: signal.as_i32(),
                all,
            })
            .await?;
        Ok(())
    }

    async fn resize_pty(&self, width: u32, height: u32) -> Result<()> {
        self.channel()
            .call(Request::ResizePty {
                id: self.task_id(),
                exec_id: self.exec_id.clone(),
                width,
                height,
            })
            .await?;
        Ok(())
    }

    async fn close_io(&self) -> Result<()> {
        self.channel()
            .call(Request::CloseIo {
                id: self.task_id(),
                exec_id: self.exec_id.clone(),
                stdin: true,
            })
            .await?;
        Ok(())
    }

    async fn wait(&self) -> Result<ExitStatus> {
        let channel = self.channel().clone();
        let request = Request::Wait {
            id: self.task_id(),
            exec_id: self.exec_id.clone(),
        };
        let (tx, rx) = oneshot::channel();
        tokio::spawn(async move {
            let _ = tx.send(channel.call(request).await);
        });

        let result = rx
            .await
            .map_err(|_| Error::Internal("wait task dropped its result".to_string()))?;
        match result? {
            Some(ResponseData::Exited(status)) => Ok(status),
            other => Err(unexpected("exited", other)),
        }
    }

    async fn state(&self) -> Result<TaskState> {
        let request = Request::State {
            id: self.task_id(),
            exec_id: self.exec_id.clone(),
        };
        match self.channel().call(request).await? {
            Some(ResponseData::State(state)) => Ok(state),
            other => Err(unexpected("state", other)),
        }
    }

    async fn delete(&self) -> Result<Exit> {
        let request = Request::Delete {
            id: self.task_id(),
            exec_id: self.exec_id.clone(),
        };
        match self.channel().call(request).await? {
            Some(ResponseData::Deleted(exit)) => Ok(exit),
            other => Err(unexpected("deleted", other)),
        }
    }
}

// =============================================================================
// ShimTask
// =============================================================================

/// Proxy for the task served by one shim.
#[derive(Debug)]
pub struct ShimTask {
    target: Target,
}

impl ShimTask {
    /// Wraps a loaded shim.
    pub fn new(shim: Shim) -> Self {
        Self {
            target: Target {
                shim: Arc::new(shim),
                exec_id: None,
            },
        }
    }

    pub fn namespace(&self) -> &str {
        self.target.shim.namespace()
    }

    pub fn bundle(&self) -> &Bundle {
        self.target.shim.bundle()
    }

    /// The shim serving this task.
    pub fn shim(&self) -> &Shim {
        &self.target.shim
    }

    fn channel(&self) -> &RpcChannel {
        self.target.channel()
    }

    /// Creates the task. The request's id and bundle are taken from the
    /// shim. Returns the pid of the init process.
    pub async fn create(&self, mut request: CreateTaskRequest) -> Result<u32> {
        request.id = self.target.task_id();
        request.bundle = self.bundle().path().display().to_string();
        match self.channel().call(Request::Create(request)).await? {
            Some(ResponseData::Pid { pid }) => {
                info!(namespace = %self.namespace(), id = %self.id(), pid, "task created");
                Ok(pid)
            }
            other => Err(unexpected("pid", other)),
        }
    }

    pub async fn pause(&self) -> Result<()> {
        self.channel()
            .call(Request::Pause {
                id: self.target.task_id(),
            })
            .await?;
        Ok(())
    }

    pub async fn resume(&self) -> Result<()> {
        self.channel()
            .call(Request::Resume {
                id: self.target.task_id(),
            })
            .await?;
        Ok(())
    }

    /// Adds an exec process. The request's task id is taken from the shim.
    pub async fn exec(&self, mut request: ExecProcessRequest) -> Result<ShimProcess> {
        if request.exec_id.is_empty() {
            return Err(Error::InvalidArgument("exec id cannot be empty".to_string()));
        }
        request.id = self.target.task_id();
        let exec_id = request.exec_id.clone();
        self.channel().call(Request::Exec(request)).await?;
        Ok(ShimProcess {
            target: Target {
                shim: Arc::clone(&self.target.shim),
                exec_id: Some(exec_id),
            },
        })
    }

    /// Returns a proxy for an exec process added earlier.
    pub fn process(&self, exec_id: &str) -> ShimProcess {
        ShimProcess {
            target: Target {
                shim: Arc::clone(&self.target.shim),
                exec_id: Some(exec_id.to_string()),
            },
        }
    }

    pub async fn checkpoint(&self, path: &str, options: Option<serde_json::Value>) -> Result<()> {
        self.channel()
            .call(Request::Checkpoint {
                id: self.target.task_id(),
                path: path.to_string(),
                options,
            })
            .await?;
        Ok(())
    }

    /// Updates the task's resources.
    pub async fn update(
        &self,
        resources: serde_json::Value,
        annotations: HashMap<String, String>,
    ) -> Result<()> {
        self.channel()
            .call(Request::Update {
                id: self.target.task_id(),
                resources,
                annotations,
            })
            .await?;
        Ok(())
    }

    pub async fn stats(&self) -> Result<serde_json::Value> {
        match self
            .channel()
            .call(Request::Stats {
                id: self.target.task_id(),
            })
            .await?
        {
            Some(ResponseData::Stats { stats }) => Ok(stats),
            other => Err(unexpected("stats", other)),
        }
    }

    pub async fn pids(&self) -> Result<Vec<ProcessInfo>> {
        match self
            .channel()
            .call(Request::Pids {
                id: self.target.task_id(),
            })
            .await?
        {
            Some(ResponseData::Pids { processes }) => Ok(processes),
            other => Err(unexpected("pids", other)),
        }
    }

    /// Shim and task pids.
    pub async fn connect(&self) -> Result<ConnectInfo> {
        match self
            .channel()
            .call(Request::Connect {
                id: self.target.task_id(),
            })
            .await?
        {
            Some(ResponseData::Connected(info)) => Ok(info),
            other => Err(unexpected("connected", other)),
        }
    }

    /// Pid of the task's init process.
    pub async fn pid(&self) -> Result<u32> {
        Ok(self.connect().await?.task_pid)
    }

    /// Asks the shim to exit.
    pub async fn shutdown(&self) -> Result<()> {
        self.channel()
            .call(Request::Shutdown {
                id: self.target.task_id(),
                now: false,
            })
            .await?;
        Ok(())
    }

    /// Deletes the task.
    ///
    /// A shim that no longer knows the task counts as deleted. A closed
    /// connection counts as deleted only if a follow-up state lookup reports
    /// the task as not found; otherwise the error is returned and the task
    /// is left registered for dead-shim cleanup.
    ///
    /// Once the delete is settled `remove_task` runs exactly once. Then,
    /// unless `sandboxed`, the shim is asked to shut down (bounded by
    /// [`SHUTDOWN_TIMEOUT`]), the connection is closed and the bundle
    /// removed.
    pub async fn delete<F>(&self, sandboxed: bool, remove_task: F) -> Result<Exit>
    where
        F: FnOnce() + Send,
    {
        let exit = match self.target.delete().await {
            Ok(exit) => Some(exit),
            Err(e) if e.is_not_found() => {
                debug!(namespace = %self.namespace(), id = %self.id(), "task already gone from shim");
                None
            }
            Err(e) if e.is_closed() => match self.target.state().await {
                Err(state_err) if state_err.is_not_found() => None,
                _ => return Err(e),
            },
            Err(e) => return Err(e),
        };

        remove_task();
        self.channel().mark_closing();

        if !sandboxed {
            self.wait_shutdown().await;
        }
        self.shim().close().await;
        if let Err(e) = self.bundle().delete() {
            warn!(namespace = %self.namespace(), id = %self.id(), error = %e, "failed to remove bundle");
        }

        let exit = exit.unwrap_or_else(Exit::unknown);
        info!(
            namespace = %self.namespace(),
            id = %self.id(),
            exit_status = exit.exit_status,
            "task deleted"
        );
        Ok(exit)
    }

    async fn wait_shutdown(&self) {
        match timeout(SHUTDOWN_TIMEOUT, self.shutdown()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) if e.is_closed() => {}
            Ok(Err(e)) => {
                warn!(namespace = %self.namespace(), id = %self.id(), error = %e, "failed to shut down shim");
            }
            Err(_) => {
                warn!(namespace = %self.namespace(), id = %self.id(), "timed out waiting for shim shutdown");
            }
        }
    }

    /// Closes the connection without deleting the task.
    pub async fn close(&self) {
        self.channel().mark_closing();
        self.shim().close().await;
    }
}

#[async_trait]
impl Process for ShimTask {
    fn id(&self) -> &str {
        self.target.shim.id()
    }

    async fn start(&self) -> Result<u32> {
        let pid = self.target.start().await?;
        info!(namespace = %self.namespace(), id = %self.id(), pid, "task started");
        Ok(pid)
    }

    async fn kill(&self, signal: Signal, all: bool) -> Result<()> {
        self.target.kill(signal, all).await
    }

    async fn resize_pty(&self, width: u32, height: u32) -> Result<()> {
        self.target.resize_pty(width, height).await
    }

    async fn close_io(&self) -> Result<()> {
        self.target.close_io().await
    }

    async fn wait(&self) -> Result<ExitStatus> {
        self.target.wait().await
    }

    async fn state(&self) -> Result<TaskState> {
        self.target.state().await
    }
}

// =============================================================================
// ShimProcess
// =============================================================================

/// Proxy for one exec process of a task.
#[derive(Debug, Clone)]
pub struct ShimProcess {
    target: Target,
}

impl ShimProcess {
    /// Id of the task the process belongs to.
    pub fn task_id(&self) -> &str {
        self.target.shim.id()
    }

    /// Deletes the exec process and returns its exit.
    pub async fn delete(&self) -> Result<Exit> {
        self.target.delete().await
    }
}

#[async_trait]
impl Process for ShimProcess {
    fn id(&self) -> &str {
        self.target.exec_id.as_deref().unwrap_or_default()
    }

    async fn start(&self) -> Result<u32> {
        self.target.start().await
    }

    async fn kill(&self, signal: Signal, all: bool) -> Result<()> {
        self.target.kill(signal, all).await
    }

    async fn resize_pty(&self, width: u32, height: u32) -> Result<()> {
        self.target.resize_pty(width, height).await
    }

    async fn close_io(&self) -> Result<()> {
        self.target.close_io().await
    }

    async fn wait(&self) -> Result<ExitStatus> {
        self.target.wait().await
    }

    async fn state(&self) -> Result<TaskState> {
        self.target.state().await
    }
}
