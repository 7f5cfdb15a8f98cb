//! Event loop tests against a scripted runner

use arbor_daemon::{
    AdminError, AdminOp, AdminRunner, Daemon, DaemonError, DaemonHandle, OperationOutcome,
    OperationRequest, StartRequest,
};
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

/// `init` succeeds, `diff` fails, everything else runs until cancelled
struct ScriptedRunner;

#[async_trait]
impl AdminRunner for ScriptedRunner {
    async fn run(&self, request: OperationRequest, token: CancellationToken) -> Result<(), AdminError> {
        match request.op {
            AdminOp::Init => Ok(()),
            AdminOp::Diff => Err(AdminError::Helper {
                helper: "scripted".into(),
                status: "exit status: 3".into(),
            }),
            _ => {
                token.cancelled().await;
                Err(AdminError::Cancelled)
            }
        }
    }
}

const LIMIT: Duration = Duration::from_secs(5);

fn spawn_daemon() -> (DaemonHandle, JoinHandle<Result<(), DaemonError>>) {
    let (daemon, handle) = Daemon::new(Arc::new(ScriptedRunner));
    (handle, tokio::spawn(daemon.run()))
}

fn request(requestor: &str, op: AdminOp) -> StartRequest {
    StartRequest {
        requestor: requestor.to_string(),
        op,
        target: PathBuf::from("/sysroot"),
        args: Vec::new(),
        timeout: None,
    }
}

#[tokio::test]
async fn test_operation_succeeds_and_retires() {
    let (handle, _task) = spawn_daemon();
    let id = handle.start(request("alice", AdminOp::Init)).await.unwrap();

    let outcome = timeout(LIMIT, handle.wait(id)).await.unwrap().unwrap();
    assert_eq!(outcome, OperationOutcome::Succeeded);
    assert!(handle.list().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_failure_is_reported_to_waiter() {
    let (handle, _task) = spawn_daemon();
    let id = handle.start(request("alice", AdminOp::Diff)).await.unwrap();

    let outcome = timeout(LIMIT, handle.wait(id)).await.unwrap().unwrap();
    match outcome {
        OperationOutcome::Failed { message } => assert!(message.contains("exit status: 3")),
        other => panic!("unexpected outcome {:?}", other),
    }
}

#[tokio::test]
async fn test_ids_increase_across_callers() {
    let (handle, _task) = spawn_daemon();
    let other = handle.clone();

    let a = handle.start(request("alice", AdminOp::Deploy)).await.unwrap();
    let b = other.start(request("bob", AdminOp::Deploy)).await.unwrap();
    let c = handle.start(request("alice", AdminOp::Init)).await.unwrap();
    assert!(a < b && b < c);
}

#[tokio::test]
async fn test_only_requestor_may_cancel() {
    let (handle, _task) = spawn_daemon();
    let id = handle.start(request("alice", AdminOp::PullDeploy)).await.unwrap();

    let err = handle.cancel(id, "mallory").await.unwrap_err();
    assert!(matches!(err, DaemonError::PermissionDenied { .. }));

    let listed = handle.list().await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].id, id);
    assert_eq!(listed[0].requestor, "alice");
    assert_eq!(listed[0].operation, AdminOp::PullDeploy);

    handle.cancel(id, "alice").await.unwrap();
    let outcome = timeout(LIMIT, handle.wait(id)).await.unwrap().unwrap();
    assert_eq!(outcome, OperationOutcome::Cancelled);
    assert!(handle.list().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_unknown_ids() {
    let (handle, _task) = spawn_daemon();
    assert!(matches!(handle.cancel(99, "alice").await, Err(DaemonError::NotFound(99))));
    assert!(matches!(handle.wait(99).await, Err(DaemonError::NotFound(99))));
}

#[tokio::test]
async fn test_timeout_cancels_operation() {
    let (handle, _task) = spawn_daemon();
    let mut req = request("alice", AdminOp::UpdateKernel);
    req.timeout = Some(Duration::from_millis(50));
    let id = handle.start(req).await.unwrap();

    let outcome = timeout(LIMIT, handle.wait(id)).await.unwrap().unwrap();
    assert_eq!(outcome, OperationOutcome::Cancelled);
}

#[tokio::test]
async fn test_shutdown_drains_in_flight_operations() {
    let (handle, task) = spawn_daemon();
    handle.start(request("alice", AdminOp::Deploy)).await.unwrap();
    handle.start(request("bob", AdminOp::PullDeploy)).await.unwrap();
    assert_eq!(handle.list().await.unwrap().len(), 2);

    handle.shutdown();
    timeout(LIMIT, task).await.unwrap().unwrap().unwrap();

    let err = handle.start(request("alice", AdminOp::Init)).await.unwrap_err();
    assert!(matches!(err, DaemonError::ShuttingDown));
}

#[tokio::test]
async fn test_dropping_every_handle_stops_the_loop() {
    let (handle, task) = spawn_daemon();
    drop(handle);
    timeout(LIMIT, task).await.unwrap().unwrap().unwrap();
}

struct PanickingRunner;

#[async_trait]
impl AdminRunner for PanickingRunner {
    async fn run(&self, _request: OperationRequest, _token: CancellationToken) -> Result<(), AdminError> {
        panic!("runner blew up");
    }
}

#[tokio::test]
async fn test_panicking_operation_still_retires() {
    let (daemon, handle) = Daemon::new(Arc::new(PanickingRunner));
    let task = tokio::spawn(daemon.run());

    let id = handle.start(request("alice", AdminOp::Deploy)).await.unwrap();
    let outcome = timeout(LIMIT, handle.wait(id)).await.unwrap().unwrap();
    match outcome {
        OperationOutcome::Failed { message } => assert!(message.contains("aborted")),
        other => panic!("unexpected outcome {:?}", other),
    }
    assert!(handle.list().await.unwrap().is_empty());

    handle.start(request("bob", AdminOp::Deploy)).await.unwrap();
    handle.shutdown();
    timeout(LIMIT, task).await.unwrap().unwrap().unwrap();
}
