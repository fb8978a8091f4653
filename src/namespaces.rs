//! Namespace names.
//!
//! Every metadata record, task and event belongs to exactly one namespace.
//! Namespaces are passed explicitly; there is no ambient "current namespace".

use crate::constants::MAX_IDENTIFIER_LEN;
use crate::error::{Error, Result};

/// Namespace used when a caller has no preference.
pub const DEFAULT_NAMESPACE: &str = "default";

/// Validates a namespace name.
///
/// Namespaces are alphanumeric segments joined by `.` or `-`, at most
/// [`MAX_IDENTIFIER_LEN`] bytes.
pub fn validate(namespace: &str) -> Result<()> {
    if namespace.is_empty() {
        return Err(Error::InvalidArgument("namespace cannot be empty".into()));
    }
    if namespace.len() > MAX_IDENTIFIER_LEN {
        return Err(Error::InvalidArgument(format!(
            "namespace {namespace:?} exceeds {MAX_IDENTIFIER_LEN} bytes"
        )));
    }
    let valid_segments = namespace
        .split(['.', '-'])
        .all(|segment| !segment.is_empty() && segment.chars().all(|c| c.is_ascii_alphanumeric()));
    if !valid_segments {
        return Err(Error::InvalidArgument(format!(
            "namespace {namespace:?} must be alphanumeric segments separated by '.' or '-'"
        )));
    }
    Ok(())
}
