//! Error types for the control-plane core.
//!
//! Every variant maps onto a small taxonomy of kinds ([`ErrorKind`]) so
//! callers can branch on *what went wrong* without matching concrete
//! variants. The same taxonomy is carried across the shim RPC boundary as an
//! [`ErrorCode`], which lets a `NotFound` raised inside a shim arrive in the
//! daemon as a `NotFound`.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Result type alias for control-plane operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Kind of failure, independent of the variant that carries it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Lease, task, namespace or resource is absent.
    NotFound,
    /// Duplicate identifier.
    AlreadyExists,
    /// Object is in the wrong state for the operation.
    FailedPrecondition,
    /// Malformed input.
    InvalidArgument,
    /// Transient failure: lock contention, closed connection, timeout.
    Unavailable,
    /// Feature or version not supported.
    NotImplemented,
    /// Unexpected failure inside this process.
    Internal,
    /// Failure without a more specific mapping.
    Unknown,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotFound => write!(f, "not found"),
            Self::AlreadyExists => write!(f, "already exists"),
            Self::FailedPrecondition => write!(f, "failed precondition"),
            Self::InvalidArgument => write!(f, "invalid argument"),
            Self::Unavailable => write!(f, "unavailable"),
            Self::NotImplemented => write!(f, "not implemented"),
            Self::Internal => write!(f, "internal"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// Wire representation of an error kind.
///
/// Shims return one of these codes in error responses; the daemon maps them
/// back with [`Error::from_remote`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    NotFound,
    AlreadyExists,
    FailedPrecondition,
    InvalidArgument,
    Unavailable,
    NotImplemented,
    Internal,
    Unknown,
}

impl From<ErrorKind> for ErrorCode {
    fn from(kind: ErrorKind) -> Self {
        match kind {
            ErrorKind::NotFound => Self::NotFound,
            ErrorKind::AlreadyExists => Self::AlreadyExists,
            ErrorKind::FailedPrecondition => Self::FailedPrecondition,
            ErrorKind::InvalidArgument => Self::InvalidArgument,
            ErrorKind::Unavailable => Self::Unavailable,
            ErrorKind::NotImplemented => Self::NotImplemented,
            ErrorKind::Internal => Self::Internal,
            ErrorKind::Unknown => Self::Unknown,
        }
    }
}

/// Errors that can occur in the control-plane core.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    // =========================================================================
    // Taxonomy Errors
    // =========================================================================
    /// Object not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// Object already exists.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Operation not valid in the current state.
    #[error("failed precondition: {0}")]
    FailedPrecondition(String),

    /// Malformed argument.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Resource temporarily unavailable.
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// Unsupported feature or version.
    #[error("not implemented: {0}")]
    NotImplemented(String),

    // =========================================================================
    // Shim Errors
    // =========================================================================
    /// The shim connection is closed.
    #[error("shim connection closed")]
    ConnectionClosed,

    /// Failed to connect to a shim.
    #[error("failed to connect to shim at {address}: {reason}")]
    ConnectFailed { address: String, reason: String },

    /// Shim binary invocation failed.
    #[error("shim binary {binary} failed: {reason}")]
    ShimBinary { binary: PathBuf, reason: String },

    /// Error reported by the remote shim without a more specific mapping.
    #[error("shim error ({code:?}): {message}")]
    Remote { code: ErrorCode, message: String },

    // =========================================================================
    // Storage Errors
    // =========================================================================
    /// Storage initialization failed.
    #[error("failed to initialize storage at {path}: {reason}")]
    StorageInitFailed { path: PathBuf, reason: String },

    /// Storage write failed.
    #[error("failed to write to storage: {0}")]
    StorageWriteFailed(String),

    // =========================================================================
    // I/O Errors
    // =========================================================================
    /// Generic I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // =========================================================================
    // Timeout Errors
    // =========================================================================
    /// Operation timed out.
    #[error("operation timed out after {duration:?}: {operation}")]
    Timeout {
        operation: String,
        duration: std::time::Duration,
    },

    // =========================================================================
    // Internal Errors
    // =========================================================================
    /// Internal error (should not happen).
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Returns the taxonomy kind of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::AlreadyExists(_) => ErrorKind::AlreadyExists,
            Self::FailedPrecondition(_) => ErrorKind::FailedPrecondition,
            Self::InvalidArgument(_) => ErrorKind::InvalidArgument,
            Self::Unavailable(_) | Self::ConnectionClosed | Self::Timeout { .. } => {
                ErrorKind::Unavailable
            }
            Self::ConnectFailed { .. } => ErrorKind::Unavailable,
            Self::NotImplemented(_) => ErrorKind::NotImplemented,
            Self::Remote { code, .. } => match code {
                ErrorCode::NotFound => ErrorKind::NotFound,
                ErrorCode::AlreadyExists => ErrorKind::AlreadyExists,
                ErrorCode::FailedPrecondition => ErrorKind::FailedPrecondition,
                ErrorCode::InvalidArgument => ErrorKind::InvalidArgument,
                ErrorCode::Unavailable => ErrorKind::Unavailable,
                ErrorCode::NotImplemented => ErrorKind::NotImplemented,
                ErrorCode::Internal => ErrorKind::Internal,
                ErrorCode::Unknown => ErrorKind::Unknown,
            },
            Self::Io(e) if e.kind() == std::io::ErrorKind::NotFound => ErrorKind::NotFound,
            Self::Serialization(_) => ErrorKind::InvalidArgument,
            Self::ShimBinary { .. } | Self::Io(_) => ErrorKind::Unknown,
            Self::StorageInitFailed { .. } | Self::StorageWriteFailed(_) | Self::Internal(_) => {
                ErrorKind::Internal
            }
        }
    }

    /// Returns the wire code for this error.
    pub fn code(&self) -> ErrorCode {
        self.kind().into()
    }

    /// Maps a remote error code back onto a local variant.
    pub fn from_remote(code: ErrorCode, message: impl Into<String>) -> Self {
        let message = message.into();
        match code {
            ErrorCode::NotFound => Self::NotFound(message),
            ErrorCode::AlreadyExists => Self::AlreadyExists(message),
            ErrorCode::FailedPrecondition => Self::FailedPrecondition(message),
            ErrorCode::InvalidArgument => Self::InvalidArgument(message),
            ErrorCode::Unavailable => Self::Unavailable(message),
            ErrorCode::NotImplemented => Self::NotImplemented(message),
            ErrorCode::Internal | ErrorCode::Unknown => Self::Remote { code, message },
        }
    }

    /// Produces an equivalent error of the same kind.
    ///
    /// Used where one failure has to be reported to several waiters.
    pub fn replicate(&self) -> Self {
        match self {
            Self::ConnectionClosed => Self::ConnectionClosed,
            other => Self::from_remote(other.code(), other.to_string()),
        }
    }

    /// Returns true for [`ErrorKind::NotFound`].
    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }

    /// Returns true for [`ErrorKind::AlreadyExists`].
    pub fn is_already_exists(&self) -> bool {
        self.kind() == ErrorKind::AlreadyExists
    }

    /// Returns true when the shim connection was closed.
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::ConnectionClosed)
    }
}
