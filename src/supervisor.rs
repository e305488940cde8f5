use std::{
    fmt,
    path::{Path, PathBuf},
    process::Command,
    sync::{Arc, Mutex, MutexGuard},
    time::{Duration, Instant},
};

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::{
    bridge::ReadinessGate,
    error::{InvokeError, ProvisionError, SupervisorError},
    launcher::{self, Launcher},
    probe::{self, HealthReport, ProbeOpts},
    provision::{self, BackendEnvironment},
    trace,
};

pub const DEFAULT_PORT: u16 = 8765;
const LOOPBACK_HOST: &str = "127.0.0.1";

/// Lifecycle phase of the backend, as the frontend sees it.
///
/// `Failed` and `Stopped` are terminal; there is no automatic restart. A
/// crashed or failed backend stays down until the whole app is relaunched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadinessState {
    NotStarted,
    Provisioning,
    Launching,
    Probing,
    Healthy,
    Failed,
    Stopped,
}

impl ReadinessState {
    pub fn as_str(self) -> &'static str {
        match self {
            ReadinessState::NotStarted => "not_started",
            ReadinessState::Provisioning => "provisioning",
            ReadinessState::Launching => "launching",
            ReadinessState::Probing => "probing",
            ReadinessState::Healthy => "healthy",
            ReadinessState::Failed => "failed",
            ReadinessState::Stopped => "stopped",
        }
    }
}

impl fmt::Display for ReadinessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn default_port() -> u16 {
    std::env::var("NOVELVOICE_PORT")
        .ok()
        .and_then(|v| v.trim().parse::<u16>().ok())
        .unwrap_or(DEFAULT_PORT)
}

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub port: u16,
    pub provision_timeout: Duration,
    pub probe: ProbeOpts,
    pub stop_grace: Duration,
    pub backend_root: PathBuf,
}

impl SupervisorConfig {
    pub fn new(backend_root: PathBuf) -> Self {
        Self {
            port: default_port(),
            provision_timeout: Duration::from_secs(600),
            probe: ProbeOpts::default(),
            stop_grace: Duration::from_secs(5),
            backend_root,
        }
    }
}

/// Side-effecting startup steps, injectable for tests.
#[derive(Clone, Copy)]
pub struct SupervisorDeps {
    pub ensure_environment:
        fn(&Path, &Path, &CancellationToken) -> Result<BackendEnvironment, ProvisionError>,
    pub build_command: fn(&BackendEnvironment, u16) -> Command,
}

impl Default for SupervisorDeps {
    fn default() -> Self {
        Self {
            ensure_environment: provision::ensure_environment,
            build_command: launcher::backend_command,
        }
    }
}

struct Inner {
    state: ReadinessState,
    launcher: Launcher,
    last_error: Option<String>,
    crashed: bool,
    health: Option<HealthReport>,
}

/// Owns the backend lifecycle end to end: provision the environment, launch
/// the child, probe it healthy, gate frontend calls, detect crashes, and
/// shut everything down in order. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<Mutex<Inner>>,
    cfg: Arc<SupervisorConfig>,
    data_dir: PathBuf,
    session_id: String,
    shutdown: CancellationToken,
    client: reqwest::Client,
    deps: SupervisorDeps,
}

impl Supervisor {
    pub fn new(data_dir: PathBuf, cfg: SupervisorConfig) -> Self {
        Self::with_deps(data_dir, cfg, SupervisorDeps::default())
    }

    pub fn with_deps(data_dir: PathBuf, cfg: SupervisorConfig, deps: SupervisorDeps) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                state: ReadinessState::NotStarted,
                launcher: Launcher::new(),
                last_error: None,
                crashed: false,
                health: None,
            })),
            cfg: Arc::new(cfg),
            data_dir,
            session_id: Uuid::new_v4().to_string(),
            shutdown: CancellationToken::new(),
            client: reqwest::Client::new(),
            deps,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // A poisoned lock means a panicking thread died mid-update; the state
        // it left behind is still the best information we have.
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn set_state(&self, next: ReadinessState) {
        self.lock().state = next;
        trace::event(
            &self.data_dir,
            Some(&self.session_id),
            "Supervisor",
            "SUP.state",
            "ok",
            Some(serde_json::json!({"state": next.as_str()})),
        );
    }

    fn fail(&self, detail: &str) {
        {
            let mut inner = self.lock();
            inner.state = ReadinessState::Failed;
            inner.last_error = Some(detail.to_string());
        }
        trace::event(
            &self.data_dir,
            Some(&self.session_id),
            "Supervisor",
            "SUP.state",
            "err",
            Some(serde_json::json!({"state": "failed", "detail": detail})),
        );
    }

    async fn stop_child(&self) {
        let inner = self.inner.clone();
        let data_dir = self.data_dir.clone();
        let grace = self.cfg.stop_grace;
        let _ = tokio::task::spawn_blocking(move || {
            let mut guard = inner.lock().unwrap_or_else(|p| p.into_inner());
            guard.launcher.stop(&data_dir, grace);
        })
        .await;
    }

    /// Runs the full startup sequence. One-shot: a second call on the same
    /// supervisor is rejected regardless of how the first one ended.
    pub async fn startup(&self) -> Result<(), SupervisorError> {
        {
            let mut inner = self.lock();
            if inner.state != ReadinessState::NotStarted {
                return Err(SupervisorError::AlreadyStarted(inner.state));
            }
            inner.state = ReadinessState::Provisioning;
        }
        let span = trace::Span::start(
            &self.data_dir,
            Some(&self.session_id),
            "Supervisor",
            "SUP.startup",
            Some(serde_json::json!({"port": self.cfg.port})),
        );

        // Provisioning runs blocking process invocations (venv, pip); keep
        // them off the async runtime.
        let ensure = self.deps.ensure_environment;
        let data_dir = self.data_dir.clone();
        let backend_root = self.cfg.backend_root.clone();
        let cancel = self.shutdown.clone();
        let t0 = Instant::now();
        let handle =
            tokio::task::spawn_blocking(move || ensure(&data_dir, &backend_root, &cancel));
        let env = match tokio::time::timeout(self.cfg.provision_timeout, handle).await {
            Err(_elapsed) => {
                // Unblock the still-running provisioning task at its next
                // cancellation checkpoint.
                self.shutdown.cancel();
                let e = ProvisionError::TimedOut {
                    waited_ms: t0.elapsed().as_millis() as u64,
                };
                self.fail(&e.to_string());
                span.err("provision", "E_PROVISION_TIMEOUT", &e.to_string(), None);
                return Err(e.into());
            }
            Ok(Err(join_err)) => {
                let detail = format!("provisioning task panicked: {join_err}");
                self.fail(&detail);
                span.err("logic", "E_INTERNAL", &detail, None);
                return Err(SupervisorError::Internal(detail));
            }
            Ok(Ok(Err(ProvisionError::Cancelled))) => {
                self.set_state(ReadinessState::Stopped);
                span.err("provision", "E_CANCELLED", "cancelled", None);
                return Err(SupervisorError::Cancelled);
            }
            Ok(Ok(Err(e))) => {
                self.fail(&e.to_string());
                span.err("provision", "E_PROVISION_FAILED", &e.to_string(), None);
                return Err(e.into());
            }
            Ok(Ok(Ok(env))) => env,
        };

        self.set_state(ReadinessState::Launching);
        let build = self.deps.build_command;
        let port = self.cfg.port;
        let launch = {
            let mut inner = self.lock();
            inner
                .launcher
                .start_with(&self.data_dir, build(&env, port), port)
        };
        if let Err(e) = launch {
            self.fail(&e.to_string());
            span.err("process", "E_LAUNCH_FAILED", &e.to_string(), None);
            return Err(e.into());
        }

        self.set_state(ReadinessState::Probing);
        match probe::wait_until_healthy(
            &self.client,
            &self.data_dir,
            LOOPBACK_HOST,
            port,
            &self.cfg.probe,
            &self.shutdown,
        )
        .await
        {
            Ok(report) => {
                {
                    let mut inner = self.lock();
                    inner.health = Some(report);
                    inner.state = ReadinessState::Healthy;
                }
                trace::event(
                    &self.data_dir,
                    Some(&self.session_id),
                    "Supervisor",
                    "SUP.state",
                    "ok",
                    Some(serde_json::json!({"state": "healthy"})),
                );
                span.ok(None);
                Ok(())
            }
            Err(crate::error::ProbeError::Cancelled) => {
                self.stop_child().await;
                self.set_state(ReadinessState::Stopped);
                span.err("logic", "E_CANCELLED", "cancelled", None);
                Err(SupervisorError::Cancelled)
            }
            Err(e) => {
                // A child that never answers health checks is dead weight;
                // take it down before reporting the failure.
                self.stop_child().await;
                self.fail(&e.to_string());
                span.err("http", "E_PROBE_TIMEOUT", &e.to_string(), None);
                Err(e.into())
            }
        }
    }

    /// Graceful shutdown: cancels any in-flight startup stage, stops the
    /// child, and settles the final state. Idempotent.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.stop_child().await;
        let final_state = {
            let mut inner = self.lock();
            if inner.state != ReadinessState::Failed {
                inner.state = ReadinessState::Stopped;
            }
            inner.state
        };
        trace::event(
            &self.data_dir,
            Some(&self.session_id),
            "Supervisor",
            "SUP.shutdown",
            "ok",
            Some(serde_json::json!({"state": final_state.as_str()})),
        );
    }

    pub fn state(&self) -> ReadinessState {
        self.lock().state
    }

    pub fn last_error(&self) -> Option<String> {
        self.lock().last_error.clone()
    }

    pub fn backend_pid(&self) -> Option<u32> {
        self.lock().launcher.pid()
    }

    pub fn health(&self) -> Option<HealthReport> {
        self.lock().health.clone()
    }

    pub fn base_url(&self) -> String {
        format!("http://{LOOPBACK_HOST}:{}", self.cfg.port)
    }

    pub fn http_client(&self) -> reqwest::Client {
        self.client.clone()
    }

    /// Shutdown token shared with the bridge so in-flight calls end with
    /// the lifecycle instead of running out their own timeouts.
    pub fn cancel_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }
}

impl ReadinessGate for Supervisor {
    /// Admits calls only while `Healthy`, with a liveness check folded in:
    /// the first call after a backend crash flips the supervisor to `Failed`
    /// and every later call fails fast without touching the wire.
    fn check_invokable(&self) -> Result<(), InvokeError> {
        let mut inner = self.lock();
        if inner.crashed {
            let msg = inner
                .last_error
                .clone()
                .unwrap_or_else(|| "backend process exited".to_string());
            return Err(InvokeError::BackendUnavailable(msg));
        }
        match inner.state {
            ReadinessState::Healthy => {
                if let Some(status) = inner.launcher.try_wait_exited() {
                    let msg = format!("backend process exited unexpectedly ({status})");
                    inner.state = ReadinessState::Failed;
                    inner.crashed = true;
                    inner.last_error = Some(msg.clone());
                    drop(inner);
                    trace::event(
                        &self.data_dir,
                        Some(&self.session_id),
                        "Supervisor",
                        "SUP.crash_detected",
                        "err",
                        Some(serde_json::json!({"exit_status": status.to_string()})),
                    );
                    return Err(InvokeError::BackendUnavailable(msg));
                }
                Ok(())
            }
            state => Err(InvokeError::NotReady(state)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

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

    fn failing_env(
        _data_dir: &Path,
        _backend_root: &Path,
        _cancel: &CancellationToken,
    ) -> Result<BackendEnvironment, ProvisionError> {
        Err(ProvisionError::InstallFailed("simulated".to_string()))
    }

    fn cancel_aware_env(
        data_dir: &Path,
        backend_root: &Path,
        cancel: &CancellationToken,
    ) -> Result<BackendEnvironment, ProvisionError> {
        if cancel.is_cancelled() {
            return Err(ProvisionError::Cancelled);
        }
        fabricated_env(data_dir, backend_root, cancel)
    }

    fn missing_exe_command(_env: &BackendEnvironment, _port: u16) -> Command {
        Command::new("/nonexistent/novelvoice-python")
    }

    fn test_supervisor(deps: SupervisorDeps) -> (Supervisor, tempfile::TempDir) {
        let td = tempfile::tempdir().expect("tempdir");
        let mut cfg = SupervisorConfig::new(td.path().join("backend"));
        cfg.port = 0; // never reachable, tests that probe inject their own port
        cfg.probe = ProbeOpts {
            overall: Duration::from_millis(400),
            interval: Duration::from_millis(50),
            attempt_timeout: Duration::from_millis(200),
        };
        cfg.stop_grace = Duration::from_secs(1);
        let sup = Supervisor::with_deps(td.path().to_path_buf(), cfg, deps);
        (sup, td)
    }

    #[test]
    fn gate_reports_not_ready_before_startup() {
        let (sup, _td) = test_supervisor(SupervisorDeps::default());
        let err = sup.check_invokable().unwrap_err();
        assert!(matches!(
            err,
            InvokeError::NotReady(ReadinessState::NotStarted)
        ));
    }

    #[tokio::test]
    async fn provisioning_failure_settles_in_failed() {
        let (sup, _td) = test_supervisor(SupervisorDeps {
            ensure_environment: failing_env,
            build_command: missing_exe_command,
        });
        let err = sup.startup().await.unwrap_err();
        assert!(matches!(
            err,
            SupervisorError::Provision(ProvisionError::InstallFailed(_))
        ));
        assert_eq!(sup.state(), ReadinessState::Failed);
        assert!(sup.last_error().is_some());
        // Failed is terminal even across shutdown.
        sup.shutdown().await;
        assert_eq!(sup.state(), ReadinessState::Failed);
    }

    #[tokio::test]
    async fn launch_failure_settles_in_failed() {
        let (sup, _td) = test_supervisor(SupervisorDeps {
            ensure_environment: fabricated_env,
            build_command: missing_exe_command,
        });
        let err = sup.startup().await.unwrap_err();
        assert!(matches!(err, SupervisorError::Launch(_)));
        assert_eq!(sup.state(), ReadinessState::Failed);
        assert!(sup.backend_pid().is_none());
    }

    #[tokio::test]
    async fn startup_is_one_shot() {
        let (sup, _td) = test_supervisor(SupervisorDeps {
            ensure_environment: failing_env,
            build_command: missing_exe_command,
        });
        let _ = sup.startup().await;
        let err = sup.startup().await.unwrap_err();
        assert!(matches!(
            err,
            SupervisorError::AlreadyStarted(ReadinessState::Failed)
        ));
    }

    #[tokio::test]
    async fn shutdown_before_startup_cancels_provisioning() {
        let (sup, _td) = test_supervisor(SupervisorDeps {
            ensure_environment: cancel_aware_env,
            build_command: missing_exe_command,
        });
        sup.shutdown().await;
        let err = sup.startup().await.unwrap_err();
        assert!(matches!(err, SupervisorError::Cancelled));
        assert_eq!(sup.state(), ReadinessState::Stopped);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn probe_timeout_fails_startup_and_reaps_the_child() {
        fn sleeper(_env: &BackendEnvironment, _port: u16) -> Command {
            let mut cmd = Command::new("sh");
            cmd.args(["-c", "exec sleep 30"]);
            cmd
        }
        let (sup, _td) = test_supervisor(SupervisorDeps {
            ensure_environment: fabricated_env,
            build_command: sleeper,
        });
        let err = sup.startup().await.unwrap_err();
        assert!(matches!(
            err,
            SupervisorError::Probe(crate::error::ProbeError::TimedOut { .. })
        ));
        assert_eq!(sup.state(), ReadinessState::Failed);
        assert!(sup.backend_pid().is_none());
    }
}
