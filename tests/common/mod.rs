//! Shared helpers for integration tests.
//!
//! Each test binary compiles this module separately, so not every helper is
//! used by every binary.

#![allow(dead_code)]

pub mod fake_shim;

use async_trait::async_trait;
use magikd::{BlobStore, Envelope, MetadataDb, Result, Snapshotter};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::broadcast;

static TRACING: Once = Once::new();

/// Routes `tracing` output through the test harness. Honors `RUST_LOG`.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
            )
            .with_test_writer()
            .try_init();
    });
}

// =============================================================================
// Metadata Fixtures
// =============================================================================

/// In-memory snapshotter backend.
#[derive(Default)]
pub struct MemSnapshotter {
    keys: Mutex<HashSet<String>>,
}

impl MemSnapshotter {
    pub fn contains(&self, key: &str) -> bool {
        self.keys.lock().unwrap().contains(key)
    }

    pub fn len(&self) -> usize {
        self.keys.lock().unwrap().len()
    }
}

#[async_trait]
impl Snapshotter for MemSnapshotter {
    async fn prepare(&self, key: &str, _parent: Option<&str>) -> Result<()> {
        self.keys.lock().unwrap().insert(key.to_string());
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.keys.lock().unwrap().remove(key);
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.keys.lock().unwrap().contains(key))
    }
}

/// Opens an in-memory metadata store with a `mem` snapshotter.
pub fn open_db(temp: &TempDir) -> (Arc<MetadataDb>, Arc<MemSnapshotter>) {
    let blobs = Arc::new(BlobStore::with_path(temp.path().join("blobs")).unwrap());
    let backend = Arc::new(MemSnapshotter::default());
    let db = MetadataDb::new(blobs).with_snapshotter("mem", backend.clone());
    (Arc::new(db), backend)
}

// =============================================================================
// Async Helpers
// =============================================================================

/// Polls `condition` until it holds or five seconds pass.
pub async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

/// Receives events until one with `topic` arrives.
pub async fn next_event(rx: &mut broadcast::Receiver<Envelope>, topic: &str) -> Envelope {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let envelope = rx.recv().await.unwrap();
            if envelope.event.topic() == topic {
                return envelope;
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("no {topic} event"))
}

/// Drains every event published within `quiet` of the last one.
pub async fn drain_events(rx: &mut broadcast::Receiver<Envelope>, quiet: Duration) -> Vec<Envelope> {
    let mut events = Vec::new();
    while let Ok(Ok(envelope)) = tokio::time::timeout(quiet, rx.recv()).await {
        events.push(envelope);
    }
    events
}

// =============================================================================
// Shim Binaries
// =============================================================================

/// Writes an executable shell script standing in for a shim binary.
///
/// `start` prints bootstrap params pointing at `socket`; `delete` prints an
/// exit with status `exit_status`. Every invocation is appended to
/// `<dir>/<name>.log` as `<action> <namespace>/<id>`.
pub fn shim_script(dir: &Path, name: &str, socket: &Path, protocol: &str, exit_status: u32) -> PathBuf {
    let log = dir.join(format!("{name}.log"));
    let body = format!(
        r#"#!/bin/sh
echo "$9 $2/$4" >> "{log}"
case "$9" in
  start)
    printf '{{"Version":2,"Address":"unix://{socket}","Protocol":"{protocol}"}}\n'
    ;;
  delete)
    printf '{{"pid":0,"exit_status":{exit_status},"exited_at":"2026-01-01T00:00:00Z"}}\n'
    ;;
  *)
    echo "unknown action $9" >&2
    exit 2
    ;;
esac
"#,
        log = log.display(),
        socket = socket.display(),
    );
    write_script(dir, name, &body)
}

/// Writes a shim binary whose every action fails.
pub fn failing_script(dir: &Path, name: &str) -> PathBuf {
    let log = dir.join(format!("{name}.log"));
    let body = format!(
        "#!/bin/sh\necho \"$9 $2/$4\" >> \"{}\"\necho \"refusing $9\" >&2\nexit 1\n",
        log.display()
    );
    write_script(dir, name, &body)
}

/// Returns the actions recorded by a script's log.
pub fn script_log(dir: &Path, name: &str) -> Vec<String> {
    std::fs::read_to_string(dir.join(format!("{name}.log")))
        .map(|log| log.lines().map(str::to_string).collect())
        .unwrap_or_default()
}

fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join(name);
    std::fs::write(&path, body).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}
