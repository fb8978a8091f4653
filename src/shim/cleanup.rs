//! Dead-shim reconciliation.
//!
//! When a shim's connection drops without the daemon having asked for it,
//! the task may have exited without anyone seeing the exit. Reconciliation
//! asks the shim binary for the exit (falling back to a synthetic one),
//! unregisters the task and publishes the same `TaskExit` + `TaskDelete`
//! pair a clean exit would have produced.

use super::binary::BinaryCall;
use super::protocol::Exit;
use crate::constants::CLEANUP_TIMEOUT;
use crate::events::{Event, Exchange};
use crate::nsmap::NsMap;
use std::path::Path;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Reconciles the task `(namespace, id)` after its shim died.
///
/// The binary delete is bounded by [`CLEANUP_TIMEOUT`]; on failure or
/// timeout the exit is reported as status 255, pid 0, exited now. Events
/// are published only by the caller that actually removed the task from
/// `tasks`, so concurrent or repeated calls publish them once.
pub async fn cleanup_after_dead_shim<T: Clone>(
    namespace: &str,
    id: &str,
    tasks: &NsMap<T>,
    events: &Exchange,
    binary: &dyn BinaryCall,
    bundle: &Path,
) {
    let exit = match timeout(CLEANUP_TIMEOUT, binary.delete(namespace, id, bundle)).await {
        Ok(Ok(exit)) => exit,
        Ok(Err(e)) => {
            warn!(namespace = %namespace, id = %id, error = %e, "failed to clean up dead shim");
            Exit::unknown()
        }
        Err(_) => {
            warn!(namespace = %namespace, id = %id, "timed out cleaning up dead shim");
            Exit::unknown()
        }
    };

    if tasks.delete(namespace, id).is_none() {
        debug!(namespace = %namespace, id = %id, "dead shim task already removed");
        return;
    }

    info!(namespace = %namespace, id = %id, exit_status = exit.exit_status, "reconciled dead shim");
    events.publish(
        namespace,
        Event::TaskExit {
            container_id: id.to_string(),
            id: id.to_string(),
            pid: exit.pid,
            exit_status: exit.exit_status,
            exited_at: exit.exited_at,
        },
    );
    events.publish(
        namespace,
        Event::TaskDelete {
            container_id: id.to_string(),
            pid: exit.pid,
            exit_status: exit.exit_status,
            exited_at: exit.exited_at,
        },
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Error, Result};
    use async_trait::async_trait;
    use chrono::Utc;

    struct FailingBinary;

    #[async_trait]
    impl BinaryCall for FailingBinary {
        async fn delete(&self, _namespace: &str, _id: &str, _bundle: &Path) -> Result<Exit> {
            Err(Error::Unavailable("binary missing".to_string()))
        }
    }

    struct ExitedBinary;

    #[async_trait]
    impl BinaryCall for ExitedBinary {
        async fn delete(&self, _namespace: &str, _id: &str, _bundle: &Path) -> Result<Exit> {
            Ok(Exit {
                pid: 42,
                exit_status: 137,
                exited_at: Utc::now(),
            })
        }
    }

    #[tokio::test]
    async fn test_fallback_exit_when_binary_fails() {
        let tasks = NsMap::new();
        tasks.add("ns1", "c1", 1u32).unwrap();
        let events = Exchange::new();
        let mut rx = events.subscribe();

        cleanup_after_dead_shim("ns1", "c1", &tasks, &events, &FailingBinary, Path::new("/nonexistent")).await;

        assert!(!tasks.contains("ns1", "c1"));
        match rx.recv().await.unwrap().event {
            Event::TaskExit { pid, exit_status, .. } => {
                assert_eq!(pid, 0);
                assert_eq!(exit_status, 255);
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert_eq!(rx.recv().await.unwrap().event.topic(), "/tasks/delete");
    }

    #[tokio::test]
    async fn test_binary_exit_is_published() {
        let tasks = NsMap::new();
        tasks.add("ns1", "c1", 1u32).unwrap();
        let events = Exchange::new();
        let mut rx = events.subscribe();

        cleanup_after_dead_shim("ns1", "c1", &tasks, &events, &ExitedBinary, Path::new("/nonexistent")).await;

        match rx.recv().await.unwrap().event {
            Event::TaskExit { pid, exit_status, .. } => {
                assert_eq!(pid, 42);
                assert_eq!(exit_status, 137);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unregistered_task_publishes_nothing() {
        let tasks: NsMap<u32> = NsMap::new();
        let events = Exchange::new();
        let mut rx = events.subscribe();

        cleanup_after_dead_shim("ns1", "c1", &tasks, &events, &ExitedBinary, Path::new("/nonexistent")).await;

        assert!(matches!(
            rx.try_recv(),
            Err(tokio::sync::broadcast::error::TryRecvError::Empty)
        ));
    }
}
