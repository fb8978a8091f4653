//! Task lifecycle events and the exchange that fans them out.
//!
//! The shim layer publishes to an [`Exchange`]; anything interested in task
//! lifecycle subscribes. A clean task exit and a crashed shim produce the
//! same pair of events (`TaskExit` followed by `TaskDelete`), so subscribers
//! never need to tell the two apart.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

/// Capacity of the broadcast ring; slow subscribers observe `Lagged`.
pub const EVENT_BUFFER: usize = 1024;

/// A task lifecycle event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "topic")]
pub enum Event {
    #[serde(rename = "/tasks/create")]
    TaskCreate {
        container_id: String,
        bundle: String,
        pid: u32,
    },
    #[serde(rename = "/tasks/start")]
    TaskStart { container_id: String, pid: u32 },
    #[serde(rename = "/tasks/exit")]
    TaskExit {
        container_id: String,
        id: String,
        pid: u32,
        exit_status: u32,
        exited_at: DateTime<Utc>,
    },
    #[serde(rename = "/tasks/delete")]
    TaskDelete {
        container_id: String,
        pid: u32,
        exit_status: u32,
        exited_at: DateTime<Utc>,
    },
    #[serde(rename = "/tasks/oom")]
    TaskOom { container_id: String },
    #[serde(rename = "/tasks/paused")]
    TaskPaused { container_id: String },
    #[serde(rename = "/tasks/resumed")]
    TaskResumed { container_id: String },
    #[serde(rename = "/tasks/exec-added")]
    TaskExecAdded { container_id: String, exec_id: String },
    #[serde(rename = "/tasks/exec-started")]
    TaskExecStarted {
        container_id: String,
        exec_id: String,
        pid: u32,
    },
}

impl Event {
    /// Returns the topic this event is published under.
    pub fn topic(&self) -> &'static str {
        match self {
            Self::TaskCreate { .. } => "/tasks/create",
            Self::TaskStart { .. } => "/tasks/start",
            Self::TaskExit { .. } => "/tasks/exit",
            Self::TaskDelete { .. } => "/tasks/delete",
            Self::TaskOom { .. } => "/tasks/oom",
            Self::TaskPaused { .. } => "/tasks/paused",
            Self::TaskResumed { .. } => "/tasks/resumed",
            Self::TaskExecAdded { .. } => "/tasks/exec-added",
            Self::TaskExecStarted { .. } => "/tasks/exec-started",
        }
    }

    /// Returns the container the event concerns.
    pub fn container_id(&self) -> &str {
        match self {
            Self::TaskCreate { container_id, .. }
            | Self::TaskStart { container_id, .. }
            | Self::TaskExit { container_id, .. }
            | Self::TaskDelete { container_id, .. }
            | Self::TaskOom { container_id }
            | Self::TaskPaused { container_id }
            | Self::TaskResumed { container_id }
            | Self::TaskExecAdded { container_id, .. }
            | Self::TaskExecStarted { container_id, .. } => container_id,
        }
    }
}

/// An event with its namespace and publication time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub timestamp: DateTime<Utc>,
    pub namespace: String,
    pub event: Event,
}

/// Broadcast exchange for task events.
#[derive(Debug, Clone)]
pub struct Exchange {
    tx: broadcast::Sender<Envelope>,
}

impl Exchange {
    /// Creates an exchange with the default buffer.
    #[must_use]
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_BUFFER);
        Self { tx }
    }

    /// Publishes an event. Having no subscribers is not an error.
    pub fn publish(&self, namespace: &str, event: Event) {
        debug!(namespace = %namespace, topic = event.topic(), id = event.container_id(), "publishing event");
        let envelope = Envelope {
            timestamp: Utc::now(),
            namespace: namespace.to_string(),
            event,
        };
        let _ = self.tx.send(envelope);
    }

    /// Subscribes to every event published after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<Envelope> {
        self.tx.subscribe()
    }
}

impl Default for Exchange {
    fn default() -> Self {
        Self::new()
    }
}
