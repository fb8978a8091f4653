//! # Control-Plane Constants
//!
//! Timeouts, label keys, GC policy defaults and identifier rules. These
//! constants are the single source of truth for the bounds used across the
//! metadata store, the collector and the shim layer.
//!
//! ## Cross-References
//!
//! - [`crate::gc::scheduler`]: GC policy defaults
//! - [`crate::metadata`]: GC label keys
//! - [`crate::shim`]: shim timeouts and bundle file names

use std::time::Duration;

// =============================================================================
// Shim Timeouts
// =============================================================================
//
// Every interaction with a shim is bounded. A shim is a separate process that
// may be wedged or dead; none of these waits may block a caller forever.
// =============================================================================

/// Bound on validating a freshly loaded shim connection.
///
/// A shim that cannot answer a `connect` call within this window is treated
/// as unusable and the load fails.
pub const LOAD_TIMEOUT: Duration = Duration::from_secs(5);

/// Bound on waiting for a shim to shut down after its task was deleted.
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(3);

/// Bound on dead-shim reconciliation.
pub const CLEANUP_TIMEOUT: Duration = Duration::from_secs(5);

/// Bound on the fail-fast raw dial performed before a GRPC connection.
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Bound on a shim binary `start` invocation.
pub const SHIM_START_TIMEOUT: Duration = Duration::from_secs(30);

/// Exit status reported when a dead shim's real exit status is unknown.
pub const FALLBACK_EXIT_STATUS: u32 = 255;

// =============================================================================
// Bundle Layout
// =============================================================================

/// File in a bundle holding the shim's bootstrap params or legacy address.
pub const ADDRESS_FILE: &str = "address";

/// File in a bundle holding the task's runtime spec.
pub const CONFIG_FILE: &str = "config.json";

/// File in a bundle the shim writes its log to.
pub const SHIM_LOG_FILE: &str = "log";

/// File in a bundle naming the runtime the shim was started with, so the
/// task can be reconnected after a daemon restart.
pub const RUNTIME_FILE: &str = "runtime";

/// Highest shim bootstrap protocol version understood.
pub const SHIM_BOOTSTRAP_VERSION: i32 = 2;

// =============================================================================
// Storage Paths
// =============================================================================

/// Subdirectory of the root holding content blobs.
///
/// Structure: `blobs/sha256/<2-char-prefix>/<full-hash>`
pub const BLOB_STORE_DIR: &str = "blobs";

/// Metadata database file under the root.
pub const METADATA_FILE: &str = "meta.json";

/// Subdirectory of the state dir holding task bundles.
///
/// Structure: `tasks/<namespace>/<id>/`
pub const TASK_STATE_DIR: &str = "tasks";

// =============================================================================
// GC Labels
// =============================================================================
//
// Labels on metadata records that steer the collector. Reference labels may
// carry a suffix so one object can hold several references of the same kind:
// `magik.io/gc.ref.content.layer.0`, `magik.io/gc.ref.snapshot.overlay/1`.
// =============================================================================

/// Marks content or a snapshot as a GC root.
pub const LABEL_GC_ROOT: &str = "magik.io/gc.root";

/// Prefix of labels referencing content by digest.
pub const LABEL_GC_REF_CONTENT: &str = "magik.io/gc.ref.content";

/// Prefix of labels referencing a snapshot; followed by `.<snapshotter>`.
pub const LABEL_GC_REF_SNAPSHOT: &str = "magik.io/gc.ref.snapshot.";

/// RFC 3339 expiry of a lease or image.
pub const LABEL_GC_EXPIRE: &str = "magik.io/gc.expire";

/// Lease label: pin resources without following their references.
pub const LABEL_GC_FLAT: &str = "magik.io/gc.flat";

// =============================================================================
// GC Policy Defaults
// =============================================================================
//
// The scheduler runs passes on explicit request and in the background after
// enough mutations. These defaults keep the collector under 2% of wall time.
// =============================================================================

/// Maximum share of wall-clock time spent collecting.
pub const DEFAULT_GC_PAUSE_THRESHOLD: f64 = 0.02;

/// Deletions that trigger a pass (0 = any deletion schedules one).
pub const DEFAULT_GC_DELETION_THRESHOLD: u64 = 0;

/// Mutations that trigger a pass (0 = disabled).
pub const DEFAULT_GC_MUTATION_THRESHOLD: u64 = 100;

/// Delay between a trigger and the pass it schedules.
pub const DEFAULT_GC_SCHEDULE_DELAY: Duration = Duration::from_millis(0);

/// Delay before the first background pass after startup.
pub const DEFAULT_GC_STARTUP_DELAY: Duration = Duration::from_millis(100);

// =============================================================================
// Identifier Validation
// =============================================================================

/// Maximum identifier length (leases, tasks, containers, namespaces).
pub const MAX_IDENTIFIER_LEN: usize = 76;

/// Separators permitted inside identifiers.
pub const IDENTIFIER_SEPARATORS: &str = "._-";

/// Validates an identifier.
///
/// Identifiers start with an ASCII alphanumeric and otherwise contain only
/// alphanumerics and `.`, `_`, `-`. They are used as path components in the
/// state directory, so `/` and `..` can never appear.
#[inline]
#[must_use = "validation result must be checked to ensure the identifier is safe"]
pub fn validate_identifier(id: &str) -> std::result::Result<(), &'static str> {
    if id.is_empty() {
        return Err("identifier cannot be empty");
    }
    if id.len() > MAX_IDENTIFIER_LEN {
        return Err("identifier exceeds maximum length");
    }
    if !id.starts_with(|c: char| c.is_ascii_alphanumeric()) {
        return Err("identifier must start with an alphanumeric character");
    }
    if !id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || IDENTIFIER_SEPARATORS.contains(c))
    {
        return Err("identifier contains invalid characters");
    }
    if id.contains("..") {
        return Err("identifier cannot contain '..'");
    }
    Ok(())
}
