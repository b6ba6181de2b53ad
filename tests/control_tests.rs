// SPDX-License-Identifier: GPL-3.0-only

//! Integration tests for the control socket and the daemon

mod common;

use common::{Harness, INDEX, fast_policy};
use loopcam::control::client::LogEvent;
use loopcam::control::protocol::{self, Response};
use loopcam::control::{ControlClient, Request, server};
use loopcam::daemon::Daemon;
use loopcam::errors::{AppError, ControlError, Missing};
use loopcam::logging::LogLine;
use loopcam::supervisor::Lifecycle;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

const SETTLE: Duration = Duration::from_secs(5);

/// Serve the harness' control interface on its socket path
fn serve(harness: &Harness) -> (ControlClient, JoinHandle<()>) {
    harness.store.ensure_dir().unwrap();
    let path = harness.store.socket_path();
    let listener = UnixListener::bind(&path).unwrap();
    let task = tokio::spawn(server::serve(listener, Arc::clone(&harness.control)));
    (ControlClient::new(path), task)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_status_over_socket() {
    let harness = Harness::new(fast_policy());
    harness.provision().await;
    let (client, server) = serve(&harness);

    let report = client.status().await.unwrap();
    assert!(report.daemon);
    assert!(report.provisioned);
    assert_eq!(report.device_index, INDEX);
    assert_eq!(report.state.lifecycle, Lifecycle::Stopped);
    assert_eq!(report.pipeline, Some(common::small_pipeline()));

    server.abort();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_lifecycle_commands_over_socket() {
    let harness = Harness::new(fast_policy());
    harness.provision().await;
    let (client, server) = serve(&harness);

    assert_eq!(
        client.command(Request::Start).await.unwrap(),
        "Pipeline starting"
    );
    harness
        .wait_for(SETTLE, |s| s.lifecycle == Lifecycle::Running)
        .await;

    let err = client.command(Request::Start).await.unwrap_err();
    assert!(matches!(err, ControlError::AlreadyRunning));
    assert_eq!(harness.capture.spawned(), 1);

    let report = client.status().await.unwrap();
    assert_eq!(report.state.lifecycle, Lifecycle::Running);
    assert!(report.state.pid.is_some());

    assert_eq!(
        client.command(Request::Stop).await.unwrap(),
        "Pipeline stopped"
    );
    assert_eq!(harness.supervisor.status().lifecycle, Lifecycle::Stopped);
    assert_eq!(harness.capture.live(), 0);

    server.abort();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_errors_cross_the_socket() {
    let harness = Harness::new(fast_policy());
    let (client, server) = serve(&harness);

    let err = client.command(Request::Start).await.unwrap_err();
    assert_eq!(err, ControlError::NotFound(Missing::Device(INDEX)));

    let err = client.follow_logs(None, |_| {}).await.unwrap_err();
    assert_eq!(err, ControlError::NotFound(Missing::Pipeline));

    server.abort();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_malformed_request_gets_an_error() {
    let harness = Harness::new(fast_policy());
    let (client, server) = serve(&harness);

    let stream = UnixStream::connect(client.socket()).await.unwrap();
    let (read, mut write) = stream.into_split();
    write.write_all(b"{\"command\":\"explode\"}\n").await.unwrap();

    let mut lines = BufReader::new(read).lines();
    let line = lines.next_line().await.unwrap().unwrap();
    let response: Response = protocol::decode(&line).unwrap();
    assert!(matches!(
        response,
        Response::Error {
            error: ControlError::Transport(_)
        }
    ));

    // The connection stays usable
    write
        .write_all(&protocol::encode(&Request::Status).unwrap())
        .await
        .unwrap();
    let line = lines.next_line().await.unwrap().unwrap();
    assert!(matches!(
        protocol::decode::<Response>(&line).unwrap(),
        Response::Status { .. }
    ));

    server.abort();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_follow_logs_replays_and_streams() {
    let harness = Harness::new(fast_policy());
    harness.provision().await;
    let (client, server) = serve(&harness);

    harness.logs.publish(LogLine::new("INFO", "test", "old line"));
    harness.control.start().await.unwrap();
    harness
        .wait_for(SETTLE, |s| s.lifecycle == Lifecycle::Running)
        .await;

    let events = Mutex::new(Vec::new());
    let seen = |message: &str| {
        events
            .lock()
            .unwrap()
            .iter()
            .any(|e| matches!(e, LogEvent::Line(line) if line.message == message))
    };

    let follow = client.follow_logs(Some(10), |event| events.lock().unwrap().push(event));
    let drive = async {
        while !seen("old line") {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        harness.logs.publish(LogLine::new("WARN", "test", "live line"));
        while !seen("live line") {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    };

    let followed = tokio::time::timeout(SETTLE, async {
        tokio::select! {
            result = follow => panic!("log stream ended early: {:?}", result),
            _ = drive => {}
        }
    })
    .await;
    assert!(followed.is_ok(), "log lines never arrived");

    // Detaching leaves the pipeline running
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(harness.supervisor.status().lifecycle, Lifecycle::Running);

    harness.control.stop().await.unwrap();
    server.abort();
}

#[tokio::test]
async fn test_missing_daemon_is_reported() {
    let dir = tempfile::tempdir().unwrap();

    let client = ControlClient::new(dir.path().join("absent.sock"));
    let err = client.status().await.unwrap_err();
    assert!(matches!(err, ControlError::NotFound(Missing::Daemon(_))));
    assert_eq!(err.exit_code(), 4);

    // A socket file left behind by a dead daemon
    let stale = dir.path().join("stale.sock");
    drop(std::os::unix::net::UnixListener::bind(&stale).unwrap());
    let err = ControlClient::new(&stale)
        .command(Request::Stop)
        .await
        .unwrap_err();
    assert!(matches!(err, ControlError::NotFound(Missing::Daemon(_))));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_daemon_autostarts_and_cleans_up() {
    let harness = Harness::new(fast_policy());
    harness.provision().await;
    harness.context.set_enabled(true).await.unwrap();

    let daemon = Daemon::new(Arc::clone(&harness.control)).unwrap();
    let socket = daemon.socket_path().to_path_buf();
    let client = ControlClient::new(&socket);

    let (shutdown, signal) = oneshot::channel::<()>();
    let run = daemon.run_until(async {
        let _ = signal.await;
    });
    let drive = async {
        harness
            .wait_for(SETTLE, |s| s.lifecycle == Lifecycle::Running)
            .await;
        let report = client.status().await.unwrap();
        assert!(report.enabled);
        assert_eq!(report.state.lifecycle, Lifecycle::Running);
        let _ = shutdown.send(());
    };

    let (result, ()) = tokio::join!(run, drive);
    result.unwrap();

    assert!(!socket.exists());
    assert_eq!(harness.capture.live(), 0);
    assert_eq!(harness.supervisor.status().lifecycle, Lifecycle::Stopped);
}

#[tokio::test]
async fn test_one_daemon_per_device() {
    let harness = Harness::new(fast_policy());

    let first = Daemon::new(Arc::clone(&harness.control)).unwrap();
    assert!(matches!(
        Daemon::new(Arc::clone(&harness.control)),
        Err(AppError::Other(_))
    ));

    drop(first);
    assert!(Daemon::new(Arc::clone(&harness.control)).is_ok());
}
