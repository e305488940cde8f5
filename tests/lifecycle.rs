//! Full lifecycle runs against a stand-in backend: a shell child plus an
//! in-process loopback HTTP server playing the part of the Python runner.

#![cfg(unix)]

use std::{
    path::{Path, PathBuf},
    process::Command,
    sync::Arc,
    time::{Duration, Instant},
};

use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use novelvoice_desktop::{
    Bridge, BackendEnvironment, HttpTransport, InvokeError, ProbeOpts, ProvisionError,
    ReadinessState, Supervisor, SupervisorConfig, SupervisorDeps, SupervisorError,
};

fn fabricated_env(
    _data_dir: &Path,
    backend_root: &Path,
    _cancel: &CancellationToken,
) -> Result<BackendEnvironment, ProvisionError> {
    Ok(BackendEnvironment {
        python: PathBuf::from("python"),
        backend_root: backend_root.to_path_buf(),
        env_root: backend_root.join("env"),
    })
}

fn sleeper_command(_env: &BackendEnvironment, _port: u16) -> Command {
    let mut cmd = Command::new("sh");
    cmd.args(["-c", "exec sleep 60"]);
    cmd
}

fn test_deps() -> SupervisorDeps {
    SupervisorDeps {
        ensure_environment: fabricated_env,
        build_command: sleeper_command,
    }
}

fn free_port() -> u16 {
    let l = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
    l.local_addr().expect("addr").port()
}

fn supervisor_on(port: u16, probe_overall: Duration) -> (Supervisor, tempfile::TempDir) {
    let td = tempfile::tempdir().expect("tempdir");
    let mut cfg = SupervisorConfig::new(td.path().join("backend"));
    cfg.port = port;
    cfg.probe = ProbeOpts {
        overall: probe_overall,
        interval: Duration::from_millis(50),
        attempt_timeout: Duration::from_millis(500),
    };
    cfg.stop_grace = Duration::from_secs(2);
    let sup = Supervisor::with_deps(td.path().to_path_buf(), cfg, test_deps());
    (sup, td)
}

async fn wait_for_state(sup: &Supervisor, want: ReadinessState, budget: Duration) {
    let deadline = Instant::now() + budget;
    loop {
        if sup.state() == want {
            return;
        }
        assert!(
            Instant::now() < deadline,
            "state never reached {want}, stuck at {}",
            sup.state()
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Serves /health and the handful of API paths the scenarios touch.
async fn serve_backend(port: u16) {
    let listener = tokio::net::TcpListener::bind(("127.0.0.1", port))
        .await
        .expect("bind backend stand-in");
    loop {
        let Ok((mut sock, _)) = listener.accept().await else {
            return;
        };
        tokio::spawn(async move {
            let mut buf = vec![0u8; 4096];
            let n = sock.read(&mut buf).await.unwrap_or(0);
            let req = String::from_utf8_lossy(&buf[..n]);
            let path = req
                .lines()
                .next()
                .and_then(|l| l.split_whitespace().nth(1))
                .unwrap_or("/")
                .to_string();

            let (status_line, body) = match path.as_str() {
                "/health" => ("200 OK", json!({"status": "ok", "pid": 7777}).to_string()),
                "/api/models/status" => (
                    "200 OK",
                    json!({
                        "all_installed": true,
                        "ffmpeg_installed": true,
                        "total_download_mb": 0.0,
                        "models": [
                            {"name": "Narrator", "id": "tts-narrator-v2", "installed": true, "size_mb": 310.0}
                        ]
                    })
                    .to_string(),
                ),
                "/api/synthesis/progress" => (
                    "200 OK",
                    json!({"percent": 42.0, "status": "synthesizing chapter 3", "running": true})
                        .to_string(),
                ),
                "/api/book/load" => (
                    "200 OK",
                    json!({"success": false, "error": "not an epub file"}).to_string(),
                ),
                _ => ("404 Not Found", json!({"error": "no such route"}).to_string()),
            };
            let resp = format!(
                "HTTP/1.1 {status_line}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            );
            let _ = sock.write_all(resp.as_bytes()).await;
            let _ = sock.shutdown().await;
        });
    }
}

fn bridge_for(sup: &Supervisor) -> Bridge {
    Bridge::new(
        Arc::new(sup.clone()),
        Arc::new(HttpTransport::new(sup.http_client(), sup.base_url())),
        sup.data_dir().to_path_buf(),
        sup.cancel_token(),
    )
}

#[tokio::test]
async fn full_lifecycle_reaches_healthy_and_stops_cleanly() {
    let port = free_port();
    let (sup, _td) = supervisor_on(port, Duration::from_secs(10));

    let runner = {
        let sup = sup.clone();
        tokio::spawn(async move { sup.startup().await })
    };

    // The health endpoint must come up only after the launcher's port
    // preflight has passed, i.e. once probing has begun.
    wait_for_state(&sup, ReadinessState::Probing, Duration::from_secs(5)).await;
    tokio::spawn(serve_backend(port));

    runner.await.expect("join").expect("startup");
    assert_eq!(sup.state(), ReadinessState::Healthy);
    let pid = sup.backend_pid().expect("child pid");
    assert!(pid > 0);
    assert_eq!(sup.health().and_then(|h| h.pid), Some(7777));

    let bridge = bridge_for(&sup);
    let report = bridge.check_models().await.expect("check_models");
    assert!(report.all_installed);

    let progress = bridge.synthesis_progress().await.expect("progress");
    assert!(progress.running);
    assert_eq!(progress.percent, 42.0);

    // Backend-level failures surface as typed errors, not transport noise.
    let err = bridge
        .invoke("load_book", json!({"path": "/tmp/not-a-book.txt"}))
        .await
        .unwrap_err();
    assert!(matches!(err, InvokeError::Backend(msg) if msg == "not an epub file"));

    sup.shutdown().await;
    assert_eq!(sup.state(), ReadinessState::Stopped);
    assert!(sup.backend_pid().is_none());
    // Shutdown is idempotent.
    sup.shutdown().await;
    assert_eq!(sup.state(), ReadinessState::Stopped);
}

#[tokio::test]
async fn unready_backend_fails_startup_and_blocks_calls() {
    // No health server at all: probing must exhaust its overall budget.
    let port = free_port();
    let (sup, _td) = supervisor_on(port, Duration::from_millis(600));

    let err = sup.startup().await.unwrap_err();
    assert!(matches!(err, SupervisorError::Probe(_)));
    assert_eq!(sup.state(), ReadinessState::Failed);
    assert!(sup.backend_pid().is_none());

    let bridge = bridge_for(&sup);
    let err = bridge.invoke("check_models", json!(null)).await.unwrap_err();
    assert!(matches!(err, InvokeError::NotReady(ReadinessState::Failed)));
}

#[tokio::test]
async fn backend_crash_fails_fast_on_the_next_call() {
    let port = free_port();
    let (sup, _td) = supervisor_on(port, Duration::from_secs(10));

    let runner = {
        let sup = sup.clone();
        tokio::spawn(async move { sup.startup().await })
    };
    wait_for_state(&sup, ReadinessState::Probing, Duration::from_secs(5)).await;
    tokio::spawn(serve_backend(port));
    runner.await.expect("join").expect("startup");

    let bridge = bridge_for(&sup);
    bridge.check_models().await.expect("healthy call");

    // Kill the child behind the supervisor's back.
    let pid = sup.backend_pid().expect("pid");
    let status = Command::new("kill")
        .args(["-KILL", &pid.to_string()])
        .status()
        .expect("kill");
    assert!(status.success());
    tokio::time::sleep(Duration::from_millis(300)).await;

    let err = bridge.invoke("check_models", json!(null)).await.unwrap_err();
    assert!(matches!(err, InvokeError::BackendUnavailable(_)));
    assert_eq!(sup.state(), ReadinessState::Failed);

    // Fail-fast persists: no restart, same answer on the next call.
    let err = bridge.invoke("check_models", json!(null)).await.unwrap_err();
    assert!(matches!(err, InvokeError::BackendUnavailable(_)));

    sup.shutdown().await;
    assert_eq!(sup.state(), ReadinessState::Failed);
}
