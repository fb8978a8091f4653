//! In-process shim speaking the JSON-line task protocol.
//!
//! Serves one task per id over a Unix socket, pushes lifecycle events the
//! way a real shim does, and can sever every connection to simulate the
//! shim process dying.

use chrono::{DateTime, Utc};
use magikd::error::ErrorCode;
use magikd::shim::protocol::{Frame, Response};
use magikd::shim::{ConnectInfo, Exit, ExitStatus, ProcessInfo, Request, ResponseData, TaskState, TaskStatus};
use magikd::{Envelope, Event};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;

/// Pid reported for every task's init process.
pub const FAKE_PID: u32 = 4242;

/// Exit status of a killed task.
pub const KILLED_STATUS: u32 = 137;

/// Knobs for misbehaving shims.
#[derive(Debug, Clone, Default)]
pub struct Behavior {
    /// Answer `connect` with an error.
    pub fail_connect: bool,
    /// Answer a task `delete` with NotFound.
    pub delete_not_found: bool,
    /// Drop the connection right after answering `create`.
    pub exit_after_create: bool,
}

#[derive(Debug, Clone)]
struct FakeTask {
    bundle: String,
    status: TaskStatus,
    exit: Option<(u32, DateTime<Utc>)>,
}

struct Shared {
    namespace: String,
    behavior: Mutex<Behavior>,
    tasks: Arc<Mutex<HashMap<String, FakeTask>>>,
    calls: Mutex<Vec<&'static str>>,
    connections: AtomicUsize,
    accepted: AtomicUsize,
    sever: broadcast::Sender<()>,
    exits: watch::Sender<u64>,
}

/// A running fake shim.
pub struct FakeShim {
    socket: PathBuf,
    shared: Arc<Shared>,
    accept: JoinHandle<()>,
}

impl FakeShim {
    /// Listens on `<dir>/<name>.sock`, tagging pushed events with `namespace`.
    pub fn start(dir: &Path, name: &str, namespace: &str) -> Self {
        let socket = dir.join(format!("{name}.sock"));
        let listener = UnixListener::bind(&socket).unwrap();
        let (sever, _) = broadcast::channel(4);
        let (exits, _) = watch::channel(0);
        let shared = Arc::new(Shared {
            namespace: namespace.to_string(),
            behavior: Mutex::new(Behavior::default()),
            tasks: Arc::new(Mutex::new(HashMap::new())),
            calls: Mutex::new(Vec::new()),
            connections: AtomicUsize::new(0),
            accepted: AtomicUsize::new(0),
            sever,
            exits,
        });

        let accepting = Arc::clone(&shared);
        let accept = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                accepting.connections.fetch_add(1, Ordering::SeqCst);
                accepting.accepted.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(serve(stream, Arc::clone(&accepting)));
            }
        });

        Self { socket, shared, accept }
    }

    pub fn socket(&self) -> &Path {
        &self.socket
    }

    /// Bootstrap params advertising this shim.
    pub fn bootstrap(&self, protocol: &str) -> String {
        format!(
            r#"{{"Version":2,"Address":"unix://{}","Protocol":"{protocol}"}}"#,
            self.socket.display()
        )
    }

    pub fn set_behavior(&self, behavior: Behavior) {
        *self.shared.behavior.lock().unwrap() = behavior;
    }

    /// Registers a task as if it had been created earlier.
    pub fn insert_task(&self, id: &str) {
        self.shared.tasks.lock().unwrap().insert(
            id.to_string(),
            FakeTask {
                bundle: String::new(),
                status: TaskStatus::Created,
                exit: None,
            },
        );
    }

    pub fn has_task(&self, id: &str) -> bool {
        self.shared.tasks.lock().unwrap().contains_key(id)
    }

    /// Methods called so far, in order.
    pub fn calls(&self) -> Vec<&'static str> {
        self.shared.calls.lock().unwrap().clone()
    }

    /// Number of open connections.
    pub fn connections(&self) -> usize {
        self.shared.connections.load(Ordering::SeqCst)
    }

    /// Number of connections accepted so far.
    pub fn accepted(&self) -> usize {
        self.shared.accepted.load(Ordering::SeqCst)
    }

    /// Drops every open connection without answering pending calls.
    pub fn sever(&self) {
        let _ = self.shared.sever.send(());
    }
}

impl Drop for FakeShim {
    fn drop(&mut self) {
        self.accept.abort();
        self.sever();
        let _ = std::fs::remove_file(&self.socket);
    }
}

type Outbox = mpsc::UnboundedSender<String>;

async fn serve(stream: UnixStream, shared: Arc<Shared>) {
    let (reader, mut writer) = stream.into_split();
    let (out, mut outgoing) = mpsc::unbounded_channel::<String>();
    let mut sever = shared.sever.subscribe();

    let writer_task = tokio::spawn(async move {
        while let Some(line) = outgoing.recv().await {
            if writer.write_all(line.as_bytes()).await.is_err() {
                break;
            }
        }
    });
    let abort = writer_task.abort_handle();

    let mut lines = BufReader::new(reader).lines();
    let mut severed = false;
    loop {
        let line = tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => line,
                _ => break,
            },
            _ = sever.recv() => {
                severed = true;
                break;
            }
        };
        let Ok(Frame::Request { id, request }) = Frame::from_json(&line) else {
            continue;
        };
        let exits = match request {
            Request::Shutdown { .. } => true,
            Request::Create(_) => shared.behavior.lock().unwrap().exit_after_create,
            _ => false,
        };
        shared.handle(id, request, &out);
        if exits {
            break;
        }
    }

    drop(out);
    if severed {
        abort.abort();
    } else if tokio::time::timeout(std::time::Duration::from_millis(200), writer_task)
        .await
        .is_err()
    {
        abort.abort();
    }
    shared.connections.fetch_sub(1, Ordering::SeqCst);
}

fn send(out: &Outbox, frame: Frame) {
    let _ = out.send(frame.to_json_line().unwrap());
}

fn not_found(id: &str) -> Response {
    Response::error(ErrorCode::NotFound, format!("task {id} not found"))
}

impl Shared {
    fn publish(&self, out: &Outbox, event: Event) {
        send(
            out,
            Frame::Event(Envelope {
                timestamp: Utc::now(),
                namespace: self.namespace.clone(),
                event,
            }),
        );
    }

    fn state_of(&self, id: &str, exec_id: Option<String>) -> Option<TaskState> {
        let tasks = self.tasks.lock().unwrap();
        let task = tasks.get(id)?;
        Some(TaskState {
            id: id.to_string(),
            exec_id,
            bundle: task.bundle.clone(),
            pid: FAKE_PID,
            status: task.status,
            terminal: false,
            exit_status: task.exit.map(|(status, _)| status),
            exited_at: task.exit.map(|(_, at)| at),
        })
    }

    fn handle(&self, id: u64, request: Request, out: &Outbox) {
        self.calls.lock().unwrap().push(request.method());
        let behavior = self.behavior.lock().unwrap().clone();

        let result = match request {
            Request::Connect { .. } => {
                if behavior.fail_connect {
                    Response::error(ErrorCode::Unavailable, "shim not ready")
                } else {
                    Response::ok_with_data(ResponseData::Connected(ConnectInfo {
                        shim_pid: std::process::id(),
                        task_pid: FAKE_PID,
                        version: "fake".to_string(),
                    }))
                }
            }
            Request::Create(create) => {
                let mut tasks = self.tasks.lock().unwrap();
                if tasks.contains_key(&create.id) {
                    Response::error(ErrorCode::AlreadyExists, format!("task {}", create.id))
                } else {
                    tasks.insert(
                        create.id.clone(),
                        FakeTask {
                            bundle: create.bundle.clone(),
                            status: TaskStatus::Created,
                            exit: None,
                        },
                    );
                    drop(tasks);
                    self.publish(
                        out,
                        Event::TaskCreate {
                            container_id: create.id,
                            bundle: create.bundle,
                            pid: FAKE_PID,
                        },
                    );
                    Response::ok_with_data(ResponseData::Pid { pid: FAKE_PID })
                }
            }
            Request::Start { id: task, exec_id } => {
                let started = self.tasks.lock().unwrap().get_mut(&task).map(|t| {
                    if exec_id.is_none() {
                        t.status = TaskStatus::Running;
                    }
                });
                match (started, exec_id) {
                    (None, _) => not_found(&task),
                    (Some(()), None) => {
                        self.publish(
                            out,
                            Event::TaskStart {
                                container_id: task,
                                pid: FAKE_PID,
                            },
                        );
                        Response::ok_with_data(ResponseData::Pid { pid: FAKE_PID })
                    }
                    (Some(()), Some(exec_id)) => {
                        self.publish(
                            out,
                            Event::TaskExecStarted {
                                container_id: task,
                                exec_id,
                                pid: FAKE_PID + 1,
                            },
                        );
                        Response::ok_with_data(ResponseData::Pid { pid: FAKE_PID + 1 })
                    }
                }
            }
            Request::Kill { id: task, .. } => {
                let exited_at = Utc::now();
                let killed = self.tasks.lock().unwrap().get_mut(&task).map(|t| {
                    t.status = TaskStatus::Stopped;
                    t.exit = Some((KILLED_STATUS, exited_at));
                });
                match killed {
                    None => not_found(&task),
                    Some(()) => {
                        self.exits.send_modify(|n| *n += 1);
                        self.publish(
                            out,
                            Event::TaskExit {
                                container_id: task.clone(),
                                id: task,
                                pid: FAKE_PID,
                                exit_status: KILLED_STATUS,
                                exited_at,
                            },
                        );
                        Response::ok()
                    }
                }
            }
            Request::Wait { id: task, .. } => {
                if !self.tasks.lock().unwrap().contains_key(&task) {
                    not_found(&task)
                } else {
                    let mut exits = self.exits.subscribe();
                    let tasks = Arc::clone(&self.tasks);
                    let out = out.clone();
                    tokio::spawn(async move {
                        loop {
                            let exit = tasks.lock().unwrap().get(&task).and_then(|t| t.exit);
                            if let Some((exit_status, exited_at)) = exit {
                                let result = Response::ok_with_data(ResponseData::Exited(ExitStatus {
                                    exit_status,
                                    exited_at,
                                }));
                                send(&out, Frame::Response { id, result });
                                return;
                            }
                            if exits.changed().await.is_err() {
                                return;
                            }
                        }
                    });
                    return;
                }
            }
            Request::State { id: task, exec_id } => match self.state_of(&task, exec_id) {
                Some(state) => Response::ok_with_data(ResponseData::State(state)),
                None => not_found(&task),
            },
            Request::Delete { id: task, exec_id: Some(_) } => {
                if self.tasks.lock().unwrap().contains_key(&task) {
                    Response::ok_with_data(ResponseData::Deleted(Exit {
                        pid: FAKE_PID + 1,
                        exit_status: 0,
                        exited_at: Utc::now(),
                    }))
                } else {
                    not_found(&task)
                }
            }
            Request::Delete { id: task, exec_id: None } => {
                if behavior.delete_not_found {
                    not_found(&task)
                } else {
                    match self.tasks.lock().unwrap().remove(&task) {
                        Some(removed) => {
                            let (exit_status, exited_at) = removed.exit.unwrap_or((0, Utc::now()));
                            Response::ok_with_data(ResponseData::Deleted(Exit {
                                pid: FAKE_PID,
                                exit_status,
                                exited_at,
                            }))
                        }
                        None => not_found(&task),
                    }
                }
            }
            Request::Pids { id: task } => {
                if self.tasks.lock().unwrap().contains_key(&task) {
                    Response::ok_with_data(ResponseData::Pids {
                        processes: vec![ProcessInfo {
                            pid: FAKE_PID,
                            exec_id: None,
                        }],
                    })
                } else {
                    not_found(&task)
                }
            }
            Request::Stats { .. } => Response::ok_with_data(ResponseData::Stats {
                stats: serde_json::json!({ "cpu_usage_ns": 1000 }),
            }),
            Request::Pause { id: task } => {
                self.set_status(&task, TaskStatus::Paused);
                self.publish(out, Event::TaskPaused { container_id: task });
                Response::ok()
            }
            Request::Resume { id: task } => {
                self.set_status(&task, TaskStatus::Running);
                self.publish(out, Event::TaskResumed { container_id: task });
                Response::ok()
            }
            Request::Exec(exec) => {
                self.publish(
                    out,
                    Event::TaskExecAdded {
                        container_id: exec.id,
                        exec_id: exec.exec_id,
                    },
                );
                Response::ok()
            }
            Request::Checkpoint { .. } => Response::error(ErrorCode::NotImplemented, "checkpoint"),
            Request::ResizePty { .. }
            | Request::CloseIo { .. }
            | Request::Update { .. }
            | Request::Shutdown { .. } => Response::ok(),
        };
        send(out, Frame::Response { id, result });
    }

    fn set_status(&self, id: &str, status: TaskStatus) {
        if let Some(task) = self.tasks.lock().unwrap().get_mut(id) {
            task.status = status;
        }
    }
}
