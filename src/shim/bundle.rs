//! Task bundle directories.
//!
//! Every task owns a directory under the state dir:
//!
//! ```text
//! <state>/tasks/<namespace>/<id>/
//!   config.json   runtime spec of the task
//!   runtime       runtime name the shim was started with
//!   address       bootstrap params printed by the shim binary
//!   log           shim log
//! ```
//!
//! The directory exists for as long as the task's shim may be running. It is
//! how a restarted daemon finds the shims it has to reconnect to.

use crate::constants::{ADDRESS_FILE, CONFIG_FILE, RUNTIME_FILE, SHIM_LOG_FILE, validate_identifier};
use crate::error::{Error, Result};
use crate::namespaces;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// A task bundle on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bundle {
    namespace: String,
    id: String,
    path: PathBuf,
}

impl Bundle {
    /// Creates the bundle directory for `(namespace, id)` under `root`.
    ///
    /// Fails with `AlreadyExists` if the directory is present.
    pub fn create(
        root: &Path,
        namespace: &str,
        id: &str,
        runtime: &str,
        spec: Option<&serde_json::Value>,
    ) -> Result<Self> {
        let path = Self::bundle_path(root, namespace, id)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::create_dir(&path).map_err(|e| match e.kind() {
            std::io::ErrorKind::AlreadyExists => {
                Error::AlreadyExists(format!("bundle {namespace}/{id}"))
            }
            _ => Error::Io(e),
        })?;

        let bundle = Self {
            namespace: namespace.to_string(),
            id: id.to_string(),
            path,
        };

        let written = (|| -> Result<()> {
            fs::write(bundle.path.join(RUNTIME_FILE), runtime)?;
            if let Some(spec) = spec {
                fs::write(bundle.config_path(), serde_json::to_vec_pretty(spec)?)?;
            }
            Ok(())
        })();
        if let Err(e) = written {
            let _ = fs::remove_dir_all(&bundle.path);
            return Err(e);
        }

        debug!(namespace = %namespace, id = %id, path = %bundle.path.display(), "bundle created");
        Ok(bundle)
    }

    /// Opens an existing bundle.
    pub fn load(root: &Path, namespace: &str, id: &str) -> Result<Self> {
        let path = Self::bundle_path(root, namespace, id)?;
        if !path.is_dir() {
            return Err(Error::NotFound(format!("bundle {namespace}/{id}")));
        }
        Ok(Self {
            namespace: namespace.to_string(),
            id: id.to_string(),
            path,
        })
    }

    /// Lists the `(namespace, id)` of every bundle under `root`.
    pub fn list(root: &Path) -> Result<Vec<(String, String)>> {
        let mut bundles = Vec::new();
        if !root.exists() {
            return Ok(bundles);
        }
        for ns_entry in fs::read_dir(root)? {
            let ns_entry = ns_entry?;
            if !ns_entry.file_type()?.is_dir() {
                continue;
            }
            let namespace = ns_entry.file_name().to_string_lossy().into_owned();
            if namespaces::validate(&namespace).is_err() {
                warn!(path = %ns_entry.path().display(), "skipping invalid namespace directory");
                continue;
            }
            for entry in fs::read_dir(ns_entry.path())? {
                let entry = entry?;
                if entry.file_type()?.is_dir() {
                    bundles.push((namespace.clone(), entry.file_name().to_string_lossy().into_owned()));
                }
            }
        }
        bundles.sort();
        Ok(bundles)
    }

    fn bundle_path(root: &Path, namespace: &str, id: &str) -> Result<PathBuf> {
        namespaces::validate(namespace)?;
        validate_identifier(id)
            .map_err(|reason| Error::InvalidArgument(format!("task id {id:?}: {reason}")))?;
        Ok(root.join(namespace).join(id))
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Path to the bundle directory.
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn config_path(&self) -> PathBuf {
        self.path.join(CONFIG_FILE)
    }

    pub fn log_path(&self) -> PathBuf {
        self.path.join(SHIM_LOG_FILE)
    }

    /// Runtime name recorded at creation.
    pub fn runtime(&self) -> Result<String> {
        let runtime = fs::read_to_string(self.path.join(RUNTIME_FILE))
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => {
                    Error::NotFound(format!("runtime of bundle {}/{}", self.namespace, self.id))
                }
                _ => Error::Io(e),
            })?;
        Ok(runtime.trim().to_string())
    }

    /// Reads the bootstrap params the shim binary printed.
    pub fn read_address(&self) -> Result<String> {
        fs::read_to_string(self.path.join(ADDRESS_FILE)).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => {
                Error::NotFound(format!("shim address of {}/{}", self.namespace, self.id))
            }
            _ => Error::Io(e),
        })
    }

    /// Records the bootstrap params of the shim, replacing any previous ones.
    pub fn write_address(&self, data: &str) -> Result<()> {
        let temp_path = self.path.join(format!("{ADDRESS_FILE}.tmp"));
        fs::write(&temp_path, data)
            .map_err(|e| Error::StorageWriteFailed(format!("failed to write shim address: {e}")))?;
        fs::rename(&temp_path, self.path.join(ADDRESS_FILE)).map_err(|e| {
            let _ = fs::remove_file(&temp_path);
            Error::StorageWriteFailed(format!("failed to commit shim address: {e}"))
        })
    }

    /// Removes the bundle directory. A missing directory is not an error.
    pub fn delete(&self) -> Result<()> {
        match fs::remove_dir_all(&self.path) {
            Ok(()) => {
                debug!(namespace = %self.namespace, id = %self.id, "bundle removed");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Io(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_create_load_delete() {
        let temp = TempDir::new().unwrap();
        let spec = serde_json::json!({"ociVersion": "1.0.2"});

        let bundle = Bundle::create(temp.path(), "ns1", "c1", "runc", Some(&spec)).unwrap();
        assert_eq!(bundle.path(), temp.path().join("ns1").join("c1"));
        assert!(bundle.config_path().exists());
        assert_eq!(bundle.runtime().unwrap(), "runc");

        let loaded = Bundle::load(temp.path(), "ns1", "c1").unwrap();
        assert_eq!(loaded, bundle);

        bundle.delete().unwrap();
        assert!(!bundle.path().exists());
        bundle.delete().unwrap();
        assert!(Bundle::load(temp.path(), "ns1", "c1").unwrap_err().is_not_found());
    }

    #[test]
    fn test_duplicate_bundle_rejected() {
        let temp = TempDir::new().unwrap();
        Bundle::create(temp.path(), "ns1", "c1", "runc", None).unwrap();
        let err = Bundle::create(temp.path(), "ns1", "c1", "runc", None).unwrap_err();
        assert!(err.is_already_exists());
    }

    #[test]
    fn test_invalid_ids_rejected() {
        let temp = TempDir::new().unwrap();
        assert!(Bundle::create(temp.path(), "ns1", "../escape", "runc", None).is_err());
        assert!(Bundle::create(temp.path(), "", "c1", "runc", None).is_err());
    }

    #[test]
    fn test_address_round_trip() {
        let temp = TempDir::new().unwrap();
        let bundle = Bundle::create(temp.path(), "ns1", "c1", "runc", None).unwrap();
        assert!(bundle.read_address().unwrap_err().is_not_found());

        bundle.write_address("unix:///run/shim.sock").unwrap();
        assert_eq!(bundle.read_address().unwrap(), "unix:///run/shim.sock");
    }

    #[test]
    fn test_list() {
        let temp = TempDir::new().unwrap();
        Bundle::create(temp.path(), "ns2", "b", "runc", None).unwrap();
        Bundle::create(temp.path(), "ns1", "a", "runc", None).unwrap();
        assert_eq!(
            Bundle::list(temp.path()).unwrap(),
            vec![
                ("ns1".to_string(), "a".to_string()),
                ("ns2".to_string(), "b".to_string())
            ]
        );
        assert!(Bundle::list(&temp.path().join("missing")).unwrap().is_empty());
    }
}
