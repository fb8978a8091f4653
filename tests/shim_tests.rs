//! Tests for shim loading and the task proxy.
//!
//! Every test drives a real Unix socket served by the in-process fake shim.

mod common;

use common::fake_shim::{Behavior, FAKE_PID, FakeShim, KILLED_STATUS};
use common::{eventually, init_tracing, next_event};
use magikd::shim::protocol::{CreateTaskRequest, ExecProcessRequest};
use magikd::shim::{ConnectivityState, OnClose, Protocol, TaskStatus};
use magikd::*;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tempfile::TempDir;

const NS: &str = "ns1";

fn counting_on_close() -> (OnClose, Arc<AtomicUsize>) {
    let fired = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&fired);
    let on_close: OnClose = Box::new(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    (on_close, fired)
}

fn bundle_for(temp: &TempDir, id: &str, address: &str) -> Bundle {
    let bundle = Bundle::create(&temp.path().join("tasks"), NS, id, "fake", None).unwrap();
    bundle.write_address(address).unwrap();
    bundle
}

async fn load_task(temp: &TempDir, fake: &FakeShim, id: &str, protocol: &str) -> (ShimTask, Arc<AtomicUsize>, Exchange) {
    let events = Exchange::new();
    let (on_close, fired) = counting_on_close();
    let bundle = bundle_for(temp, id, &fake.bootstrap(protocol));
    let shim = load_shim(bundle, &events, on_close).await.unwrap();
    (ShimTask::new(shim), fired, events)
}

// =============================================================================
// Loading
// =============================================================================

#[tokio::test]
async fn test_load_validates_with_connect() {
    init_tracing();
    let temp = TempDir::new().unwrap();
    let fake = FakeShim::start(temp.path(), "shim", NS);

    let (task, fired, _events) = load_task(&temp, &fake, "c1", "ttrpc").await;

    assert_eq!(fake.calls(), vec!["connect"]);
    assert_eq!(task.shim().client().protocol(), Protocol::Ttrpc);
    assert_eq!(task.shim().client().channel().state(), ConnectivityState::Ready);
    assert_eq!(task.id(), "c1");
    assert_eq!(task.namespace(), NS);
    assert_eq!(task.pid().await.unwrap(), FAKE_PID);

    task.close().await;
    assert_eq!(fired.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_load_rejects_newer_bootstrap_version_before_dialing() {
    let temp = TempDir::new().unwrap();
    let fake = FakeShim::start(temp.path(), "shim", NS);
    let address = format!(
        r#"{{"Version":3,"Address":"unix://{}","Protocol":"ttrpc"}}"#,
        fake.socket().display()
    );
    let bundle = bundle_for(&temp, "c1", &address);
    let (on_close, _) = counting_on_close();

    let err = load_shim(bundle, &Exchange::new(), on_close).await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::NotImplemented);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(fake.accepted(), 0);
}

#[tokio::test]
async fn test_load_legacy_bare_address_uses_ttrpc() {
    let temp = TempDir::new().unwrap();
    let fake = FakeShim::start(temp.path(), "shim", NS);
    let bundle = bundle_for(&temp, "c1", &format!("unix://{}", fake.socket().display()));
    let (on_close, _) = counting_on_close();

    let shim = load_shim(bundle, &Exchange::new(), on_close).await.unwrap();

    assert_eq!(shim.client().protocol(), Protocol::Ttrpc);
    assert_eq!(fake.calls(), vec!["connect"]);
    shim.close().await;
}

#[tokio::test]
async fn test_load_without_address_file_is_not_found() {
    let temp = TempDir::new().unwrap();
    let bundle = Bundle::create(&temp.path().join("tasks"), NS, "c1", "fake", None).unwrap();
    let (on_close, _) = counting_on_close();

    let err = load_shim(bundle, &Exchange::new(), on_close).await.unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn test_load_unreachable_socket_fails() {
    let temp = TempDir::new().unwrap();
    let missing = temp.path().join("gone.sock");
    let address = format!(
        r#"{{"Version":2,"Address":"unix://{}","Protocol":"ttrpc"}}"#,
        missing.display()
    );
    let bundle = bundle_for(&temp, "c1", &address);
    let (on_close, fired) = counting_on_close();

    let err = load_shim(bundle, &Exchange::new(), on_close).await.unwrap_err();

    assert!(matches!(err, Error::ConnectFailed { .. }));
    assert_eq!(fired.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_failed_validation_closes_connection() {
    let temp = TempDir::new().unwrap();
    let fake = FakeShim::start(temp.path(), "shim", NS);
    fake.set_behavior(Behavior {
        fail_connect: true,
        ..Default::default()
    });
    let bundle = bundle_for(&temp, "c1", &fake.bootstrap("ttrpc"));
    let (on_close, fired) = counting_on_close();

    let err = load_shim(bundle, &Exchange::new(), on_close).await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Unavailable);
    assert_eq!(fake.accepted(), 1);
    assert!(eventually(|| fake.connections() == 0).await);
    assert_eq!(fired.load(Ordering::SeqCst), 0);
}

// =============================================================================
// Task Lifecycle
// =============================================================================

#[tokio::test]
async fn test_task_lifecycle() {
    init_tracing();
    let temp = TempDir::new().unwrap();
    let fake = FakeShim::start(temp.path(), "shim", NS);
    let (task, fired, events) = load_task(&temp, &fake, "c1", "ttrpc").await;
    let task = Arc::new(task);
    let mut rx = events.subscribe();

    let pid = task.create(CreateTaskRequest::default()).await.unwrap();
    assert_eq!(pid, FAKE_PID);
    let created = next_event(&mut rx, "/tasks/create").await;
    assert_eq!(created.namespace, NS);
    match created.event {
        Event::TaskCreate { container_id, bundle, .. } => {
            assert_eq!(container_id, "c1");
            assert_eq!(bundle, task.bundle().path().display().to_string());
        }
        other => panic!("unexpected event {other:?}"),
    }

    assert_eq!(task.start().await.unwrap(), FAKE_PID);
    next_event(&mut rx, "/tasks/start").await;
    assert_eq!(task.state().await.unwrap().status, TaskStatus::Running);

    let pids = task.pids().await.unwrap();
    assert_eq!(pids.len(), 1);
    assert_eq!(pids[0].pid, FAKE_PID);
    assert_eq!(task.stats().await.unwrap()["cpu_usage_ns"], 1000);

    task.pause().await.unwrap();
    next_event(&mut rx, "/tasks/paused").await;
    assert_eq!(task.state().await.unwrap().status, TaskStatus::Paused);
    task.resume().await.unwrap();
    next_event(&mut rx, "/tasks/resumed").await;

    let waiter = {
        let task = Arc::clone(&task);
        tokio::spawn(async move { task.wait().await })
    };
    task.kill(Signal::Kill, false).await.unwrap();
    let status = waiter.await.unwrap().unwrap();
    assert_eq!(status.exit_status, KILLED_STATUS);

    let exited = next_event(&mut rx, "/tasks/exit").await;
    assert_eq!(exited.event.container_id(), "c1");

    let removed = AtomicUsize::new(0);
    let exit = task
        .delete(false, || {
            removed.fetch_add(1, Ordering::SeqCst);
        })
        .await
        .unwrap();

    assert_eq!(exit.pid, FAKE_PID);
    assert_eq!(exit.exit_status, KILLED_STATUS);
    assert_eq!(removed.load(Ordering::SeqCst), 1);
    assert!(fake.calls().contains(&"shutdown"));
    assert!(!task.bundle().path().exists());
    assert_eq!(task.shim().client().channel().state(), ConnectivityState::Shutdown);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(fired.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_sandboxed_delete_skips_shutdown() {
    let temp = TempDir::new().unwrap();
    let fake = FakeShim::start(temp.path(), "shim", NS);
    let (task, _, _events) = load_task(&temp, &fake, "c1", "ttrpc").await;
    task.create(CreateTaskRequest::default()).await.unwrap();

    let exit = task.delete(true, || {}).await.unwrap();

    assert_eq!(exit.exit_status, 0);
    assert!(!fake.calls().contains(&"shutdown"));
    assert!(!fake.has_task("c1"));
}

#[tokio::test]
async fn test_exec_process() {
    let temp = TempDir::new().unwrap();
    let fake = FakeShim::start(temp.path(), "shim", NS);
    let (task, _, events) = load_task(&temp, &fake, "c1", "ttrpc").await;
    let mut rx = events.subscribe();
    task.create(CreateTaskRequest::default()).await.unwrap();

    let process = task
        .exec(ExecProcessRequest {
            exec_id: "sh".to_string(),
            spec: serde_json::json!({ "args": ["sh"] }),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(process.id(), "sh");
    assert_eq!(process.task_id(), "c1");
    next_event(&mut rx, "/tasks/exec-added").await;

    assert_eq!(process.start().await.unwrap(), FAKE_PID + 1);
    next_event(&mut rx, "/tasks/exec-started").await;

    let exit = process.delete().await.unwrap();
    assert_eq!(exit.pid, FAKE_PID + 1);
    assert!(fake.has_task("c1"));

    assert_eq!(task.process("sh").id(), "sh");
    task.close().await;
}

#[tokio::test]
async fn test_exec_requires_id() {
    let temp = TempDir::new().unwrap();
    let fake = FakeShim::start(temp.path(), "shim", NS);
    let (task, _, _events) = load_task(&temp, &fake, "c1", "ttrpc").await;

    let err = task.exec(ExecProcessRequest::default()).await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    assert_eq!(fake.calls(), vec!["connect"]);
    task.close().await;
}

#[tokio::test]
async fn test_remote_errors_keep_their_kind() {
    let temp = TempDir::new().unwrap();
    let fake = FakeShim::start(temp.path(), "shim", NS);
    let (task, _, _events) = load_task(&temp, &fake, "c1", "ttrpc").await;

    assert!(task.state().await.unwrap_err().is_not_found());
    assert_eq!(
        task.checkpoint("/tmp/cp", None).await.unwrap_err().kind(),
        ErrorKind::NotImplemented
    );
    task.close().await;
}

// =============================================================================
// Delete Edge Cases
// =============================================================================

#[tokio::test]
async fn test_delete_tolerates_task_unknown_to_shim() {
    let temp = TempDir::new().unwrap();
    let fake = FakeShim::start(temp.path(), "shim", NS);
    fake.insert_task("c1");
    fake.set_behavior(Behavior {
        delete_not_found: true,
        ..Default::default()
    });
    let (task, _, _events) = load_task(&temp, &fake, "c1", "ttrpc").await;

    let removed = AtomicUsize::new(0);
    let exit = task
        .delete(false, || {
            removed.fetch_add(1, Ordering::SeqCst);
        })
        .await
        .unwrap();

    assert_eq!(exit.pid, 0);
    assert_eq!(exit.exit_status, FALLBACK_EXIT_STATUS);
    assert_eq!(removed.load(Ordering::SeqCst), 1);
    assert!(!task.bundle().path().exists());
}

#[tokio::test]
async fn test_delete_over_lost_connection_is_left_for_cleanup() {
    let temp = TempDir::new().unwrap();
    let fake = FakeShim::start(temp.path(), "shim", NS);
    let (task, fired, _events) = load_task(&temp, &fake, "c1", "ttrpc").await;
    task.create(CreateTaskRequest::default()).await.unwrap();

    fake.sever();
    let channel = task.shim().client().channel().clone();
    assert!(eventually(|| channel.state().is_terminal()).await);
    assert_eq!(channel.state(), ConnectivityState::Idle);
    assert!(eventually(|| fired.load(Ordering::SeqCst) == 1).await);

    let removed = AtomicUsize::new(0);
    let err = task
        .delete(false, || {
            removed.fetch_add(1, Ordering::SeqCst);
        })
        .await
        .unwrap_err();

    assert!(err.is_closed());
    assert_eq!(removed.load(Ordering::SeqCst), 0);
    assert!(task.bundle().path().exists());
    assert_eq!(fired.load(Ordering::SeqCst), 1);
}

// =============================================================================
// Connection Loss
// =============================================================================

#[tokio::test]
async fn test_ttrpc_on_close_fires_once_when_shim_dies() {
    let temp = TempDir::new().unwrap();
    let fake = FakeShim::start(temp.path(), "shim", NS);
    let (task, fired, _events) = load_task(&temp, &fake, "c1", "ttrpc").await;

    fake.sever();

    assert!(eventually(|| fired.load(Ordering::SeqCst) == 1).await);
    let err = task.pid().await.unwrap_err();
    assert!(err.is_closed());
    task.close().await;
    assert_eq!(fired.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_grpc_on_close_fires_when_shim_dies() {
    let temp = TempDir::new().unwrap();
    let fake = FakeShim::start(temp.path(), "shim", NS);
    let (task, fired, _events) = load_task(&temp, &fake, "c1", "grpc").await;
    assert_eq!(task.shim().client().protocol(), Protocol::Grpc);

    fake.sever();

    assert!(eventually(|| fired.load(Ordering::SeqCst) == 1).await);
    assert_eq!(task.shim().client().channel().state(), ConnectivityState::Idle);
}

#[tokio::test]
async fn test_explicit_close_does_not_fire_on_close() {
    for protocol in ["ttrpc", "grpc"] {
        let temp = TempDir::new().unwrap();
        let fake = FakeShim::start(temp.path(), "shim", NS);
        let (task, fired, _events) = load_task(&temp, &fake, "c1", protocol).await;

        task.close().await;

        assert_eq!(task.shim().client().channel().state(), ConnectivityState::Shutdown);
        assert!(eventually(|| fake.connections() == 0).await, "{protocol}");
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0, "{protocol}");
    }
}
