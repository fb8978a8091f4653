//! Namespace-partitioned registry of live objects.
//!
//! [`NsMap`] holds the task/shim objects the daemon currently supervises,
//! keyed by `(namespace, id)`. The mutex is held only for the duration of a
//! single map operation and never across an `.await`. A poisoned mutex is
//! logged and recovered.

use crate::error::{Error, Result};
use crate::namespaces;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use tracing::error;

/// A mutex-guarded `namespace → id → T` map.
///
/// Values are cloned out of the map, so `T` is usually an `Arc`.
#[derive(Debug)]
pub struct NsMap<T> {
    objects: Mutex<HashMap<String, HashMap<String, T>>>,
}

impl<T: Clone> NsMap<T> {
    /// Creates an empty map.
    #[must_use]
    pub fn new() -> Self {
        Self {
            objects: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, HashMap<String, T>>> {
        self.objects.lock().unwrap_or_else(|poisoned| {
            error!("object registry lock poisoned, recovering");
            poisoned.into_inner()
        })
    }

    /// Returns the object stored under `(namespace, id)`.
    pub fn get(&self, namespace: &str, id: &str) -> Result<T> {
        let objects = self.lock();
        objects
            .get(namespace)
            .and_then(|ns| ns.get(id))
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("{namespace}/{id}")))
    }

    /// Returns every object in `namespace`.
    pub fn get_all(&self, namespace: &str) -> Result<Vec<T>> {
        let objects = self.lock();
        Ok(objects
            .get(namespace)
            .map(|ns| ns.values().cloned().collect())
            .unwrap_or_default())
    }

    /// Returns every object across all namespaces.
    pub fn get_all_namespaces(&self) -> Result<Vec<T>> {
        let objects = self.lock();
        Ok(objects
            .values()
            .flat_map(|ns| ns.values().cloned())
            .collect())
    }

    /// Adds an object, failing with `AlreadyExists` on a duplicate key.
    pub fn add(&self, namespace: &str, id: &str, object: T) -> Result<()> {
        namespaces::validate(namespace)?;
        let mut objects = self.lock();
        let ns = objects.entry(namespace.to_string()).or_default();
        if ns.contains_key(id) {
            return Err(Error::AlreadyExists(format!("{namespace}/{id}")));
        }
        ns.insert(id.to_string(), object);
        Ok(())
    }

    /// Removes and returns the object stored under `(namespace, id)`.
    ///
    /// Concurrent callers race on the mutex; exactly one receives `Some`.
    pub fn delete(&self, namespace: &str, id: &str) -> Option<T> {
        let mut objects = self.lock();
        let ns = objects.get_mut(namespace)?;
        let removed = ns.remove(id);
        if ns.is_empty() {
            objects.remove(namespace);
        }
        removed
    }

    /// Returns true if `(namespace, id)` is present.
    pub fn contains(&self, namespace: &str, id: &str) -> bool {
        self.get(namespace, id).is_ok()
    }

    /// Total number of objects across namespaces.
    pub fn len(&self) -> usize {
        self.lock().values().map(HashMap::len).sum()
    }

    /// Returns true if no object is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: Clone> Default for NsMap<T> {
    fn default() -> Self {
        Self::new()
    }
}
