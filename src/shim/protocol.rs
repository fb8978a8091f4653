//! Wire protocol between the daemon and a shim.
//!
//! # Protocol Format
//!
//! - **Transport**: Unix socket or TCP, as advertised by the shim's
//!   bootstrap parameters
//! - **Encoding**: JSON
//! - **Framing**: Newline-delimited (each frame ends with `\n`)
//!
//! Unlike a plain request/response exchange, one connection carries many
//! calls at once. Every request frame carries an id and the shim answers
//! with a response frame echoing it, in any order. The shim may also push
//! unsolicited event frames at any time.
//!
//! ```text
//! Daemon                                     Shim
//!   |                                         |
//!   |  {"kind":"request","id":1,...}\n        |
//!   |---------------------------------------->|
//!   |  {"kind":"request","id":2,...}\n        |
//!   |---------------------------------------->|
//!   |                                         |
//!   |  {"kind":"event","namespace":...}\n     |
//!   |<----------------------------------------|
//!   |  {"kind":"response","id":2,...}\n       |
//!   |<----------------------------------------|
//!   |  {"kind":"response","id":1,...}\n       |
//!   |<----------------------------------------|
//! ```
//!
//! # Task Service
//!
//! | Method | Description |
//! |--------|-------------|
//! | `create` | Create the task from its bundle |
//! | `start` | Start the task or one of its exec processes |
//! | `pause` / `resume` | Freeze and thaw the task |
//! | `kill` | Signal the task or an exec process |
//! | `exec` | Add an exec process |
//! | `resize_pty` / `close_io` | Terminal and stdio control |
//! | `wait` | Block until a process exits |
//! | `checkpoint` / `update` | Checkpoint or update resources |
//! | `stats` / `pids` / `state` | Introspection |
//! | `connect` | Shim and task pids, shim version |
//! | `delete` | Delete the task or an exec process |
//! | `shutdown` | Ask the shim to exit |

use crate::error::ErrorCode;
use crate::events::Envelope;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// =============================================================================
// Frames
// =============================================================================

/// One line on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Frame {
    /// A call from the daemon.
    Request { id: u64, request: Request },
    /// The answer to the call with the same id.
    Response { id: u64, result: Response },
    /// An unsolicited task event pushed by the shim.
    Event(Envelope),
}

// =============================================================================
// Request Types
// =============================================================================

/// Task service request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum Request {
    Create(CreateTaskRequest),
    Start {
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        exec_id: Option<String>,
    },
    Pause {
        id: String,
    },
    Resume {
        id: String,
    },
    Kill {
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        exec_id: Option<String>,
        signal: i32,
        /// Signal every process of the task.
        all: bool,
    },
    Exec(ExecProcessRequest),
    ResizePty {
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        exec_id: Option<String>,
        width: u32,
        height: u32,
    },
    CloseIo {
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        exec_id: Option<String>,
        stdin: bool,
    },
    Wait {
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        exec_id: Option<String>,
    },
    Checkpoint {
        id: String,
        path: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        options: Option<serde_json::Value>,
    },
    Update {
        id: String,
        resources: serde_json::Value,
        #[serde(default)]
        annotations: std::collections::HashMap<String, String>,
    },
    Stats {
        id: String,
    },
    Pids {
        id: String,
    },
    State {
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        exec_id: Option<String>,
    },
    Connect {
        id: String,
    },
    Delete {
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        exec_id: Option<String>,
    },
    Shutdown {
        id: String,
        now: bool,
    },
}

impl Request {
    /// Returns the method name, for logging.
    pub fn method(&self) -> &'static str {
        match self {
            Self::Create(_) => "create",
            Self::Start { .. } => "start",
            Self::Pause { .. } => "pause",
            Self::Resume { .. } => "resume",
            Self::Kill { .. } => "kill",
            Self::Exec(_) => "exec",
            Self::ResizePty { .. } => "resize_pty",
            Self::CloseIo { .. } => "close_io",
            Self::Wait { .. } => "wait",
            Self::Checkpoint { .. } => "checkpoint",
            Self::Update { .. } => "update",
            Self::Stats { .. } => "stats",
            Self::Pids { .. } => "pids",
            Self::State { .. } => "state",
            Self::Connect { .. } => "connect",
            Self::Delete { .. } => "delete",
            Self::Shutdown { .. } => "shutdown",
        }
    }
}

/// A root filesystem mount handed to the shim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mount {
    #[serde(rename = "type")]
    pub kind: String,
    pub source: String,
    #[serde(default)]
    pub target: String,
    #[serde(default)]
    pub options: Vec<String>,
}

/// Create a task from a bundle.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CreateTaskRequest {
    pub id: String,
    pub bundle: String,
    #[serde(default)]
    pub rootfs: Vec<Mount>,
    #[serde(default)]
    pub terminal: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdin: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdout: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,
    /// Checkpoint to restore from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint: Option<String>,
    /// Runtime specific options.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<serde_json::Value>,
}

/// Add an exec process to a task.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecProcessRequest {
    pub id: String,
    pub exec_id: String,
    #[serde(default)]
    pub terminal: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdin: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdout: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,
    /// OCI process spec of the exec.
    pub spec: serde_json::Value,
}

// =============================================================================
// Response Types
// =============================================================================

/// Result of one call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Response {
    /// Success response.
    Ok(OkPayload),
    /// Error response.
    Error(ErrorPayload),
}

impl Response {
    /// Creates a success response with no data.
    #[must_use]
    pub fn ok() -> Self {
        Self::Ok(OkPayload { data: None })
    }

    /// Creates a success response with data.
    #[must_use]
    pub fn ok_with_data(data: ResponseData) -> Self {
        Self::Ok(OkPayload { data: Some(data) })
    }

    /// Creates an error response.
    #[must_use]
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Error(ErrorPayload {
            code,
            message: message.into(),
        })
    }

    /// Returns true if this is a success response.
    #[must_use]
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok(_))
    }
}

/// Success payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OkPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<ResponseData>,
}

/// Error payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: ErrorCode,
    pub message: String,
}

/// Response data variants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResponseData {
    /// Pid of a created or started process.
    Pid { pid: u32 },
    /// Exit of a waited process.
    Exited(ExitStatus),
    /// Result of a delete.
    Deleted(Exit),
    /// State of a process.
    State(TaskState),
    /// Processes of a task.
    Pids { processes: Vec<ProcessInfo> },
    /// Opaque runtime statistics.
    Stats { stats: serde_json::Value },
    /// Result of a connect.
    Connected(ConnectInfo),
}

impl ResponseData {
    /// Returns the variant name, for error messages.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Pid { .. } => "pid",
            Self::Exited(_) => "exited",
            Self::Deleted(_) => "deleted",
            Self::State(_) => "state",
            Self::Pids { .. } => "pids",
            Self::Stats { .. } => "stats",
            Self::Connected(_) => "connected",
        }
    }
}

/// Exit status and time of a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitStatus {
    pub exit_status: u32,
    pub exited_at: DateTime<Utc>,
}

/// Result of deleting a process, also printed by the shim binary's
/// `delete` action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Exit {
    pub pid: u32,
    pub exit_status: u32,
    pub exited_at: DateTime<Utc>,
}

impl Exit {
    /// The exit reported when the real one can no longer be learned.
    pub fn unknown() -> Self {
        Self {
            pid: 0,
            exit_status: crate::constants::FALLBACK_EXIT_STATUS,
            exited_at: Utc::now(),
        }
    }
}

/// Status of a task or process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    #[default]
    Unknown,
    Created,
    Running,
    Stopped,
    Paused,
    Pausing,
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unknown => write!(f, "unknown"),
            Self::Created => write!(f, "created"),
            Self::Running => write!(f, "running"),
            Self::Stopped => write!(f, "stopped"),
            Self::Paused => write!(f, "paused"),
            Self::Pausing => write!(f, "pausing"),
        }
    }
}

/// State of a task or exec process as reported by the shim.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TaskState {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exec_id: Option<String>,
    #[serde(default)]
    pub bundle: String,
    #[serde(default)]
    pub pid: u32,
    pub status: TaskStatus,
    #[serde(default)]
    pub terminal: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_status: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exited_at: Option<DateTime<Utc>>,
}

/// One process of a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessInfo {
    pub pid: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exec_id: Option<String>,
}

/// Identity of a shim and its task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectInfo {
    pub shim_pid: u32,
    pub task_pid: u32,
    #[serde(default)]
    pub version: String,
}

// =============================================================================
// Signals
// =============================================================================

/// Signal to send to a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// SIGTERM (graceful shutdown).
    Term,
    /// SIGKILL (force kill).
    Kill,
    /// SIGHUP (hangup).
    Hup,
    /// SIGINT (interrupt).
    Int,
    /// SIGUSR1.
    Usr1,
    /// SIGUSR2.
    Usr2,
}

impl Signal {
    /// Returns the signal number.
    #[cfg(unix)]
    pub fn as_i32(&self) -> i32 {
        match self {
            Self::Term => libc::SIGTERM,
            Self::Kill => libc::SIGKILL,
            Self::Hup => libc::SIGHUP,
            Self::Int => libc::SIGINT,
            Self::Usr1 => libc::SIGUSR1,
            Self::Usr2 => libc::SIGUSR2,
        }
    }

    #[cfg(not(unix))]
    pub fn as_i32(&self) -> i32 {
        match self {
            Self::Term => 15,
            Self::Kill => 9,
            Self::Hup => 1,
            Self::Int => 2,
            Self::Usr1 => 10,
            Self::Usr2 => 12,
        }
    }

    /// Parses from signal name (e.g., "SIGTERM", "TERM", "15").
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.to_uppercase();
        let s = s.strip_prefix("SIG").unwrap_or(&s);
        match s {
            "TERM" | "15" => Some(Self::Term),
            "KILL" | "9" => Some(Self::Kill),
            "HUP" | "1" => Some(Self::Hup),
            "INT" | "2" => Some(Self::Int),
            "USR1" | "10" => Some(Self::Usr1),
            "USR2" | "12" => Some(Self::Usr2),
            _ => None,
        }
    }
}

impl std::fmt::Display for Signal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Term => write!(f, "SIGTERM"),
            Self::Kill => write!(f, "SIGKILL"),
            Self::Hup => write!(f, "SIGHUP"),
            Self::Int => write!(f, "SIGINT"),
            Self::Usr1 => write!(f, "SIGUSR1"),
            Self::Usr2 => write!(f, "SIGUSR2"),
        }
    }
}

// =============================================================================
// Wire Format Helpers
// =============================================================================

impl Frame {
    /// Serializes the frame to a JSON line (with newline).
    ///
    /// # Errors
    ///
    /// Returns error if JSON serialization fails.
    pub fn to_json_line(&self) -> Result<String, serde_json::Error> {
        let mut json = serde_json::to_string(self)?;
        json.push('\n');
        Ok(json)
    }

    /// Deserializes a frame from JSON.
    ///
    /// # Errors
    ///
    /// Returns error if JSON deserialization fails.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s.trim())
    }
}
