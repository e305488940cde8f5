use std::path::PathBuf;

use thiserror::Error;

use crate::supervisor::ReadinessState;

/// Failures while preparing the backend execution environment. Fatal to app
/// startup; retried only on the next full launch.
#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("no usable Python interpreter found (set NOVELVOICE_PYTHON or install python3): {detail}")]
    BasePythonMissing { detail: String },

    #[error("backend requirements manifest missing: {}", .0.display())]
    RequirementsMissing(PathBuf),

    #[error("virtualenv creation failed: {0}")]
    VenvCreateFailed(String),

    #[error("backend dependency install failed: {0}")]
    InstallFailed(String),

    #[error("provisioning timed out after {waited_ms} ms")]
    TimedOut { waited_ms: u64 },

    #[error("provisioning cancelled by shutdown")]
    Cancelled,

    #[error("provisioning io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failures while starting or supervising the backend child process.
#[derive(Debug, Error)]
pub enum LaunchError {
    /// Programming error: exactly one backend process may be live at a time.
    #[error("backend already running (pid {0})")]
    AlreadyRunning(u32),

    #[error("backend interpreter missing at {}", .0.display())]
    ExecutableMissing(PathBuf),

    #[error("port {0} already bound on 127.0.0.1")]
    PortInUse(u16),

    #[error("backend spawn rejected by OS: {0}")]
    Spawn(#[source] std::io::Error),
}

/// Failures of the readiness probe. Individual refused/slow attempts are not
/// errors; only the overall deadline (or shutdown) ends the wait.
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("backend did not become healthy within {waited_ms} ms")]
    TimedOut { waited_ms: u64 },

    #[error("readiness probe cancelled by shutdown")]
    Cancelled,
}

/// Per-call bridge failures. Local to the calling operation; the frontend can
/// retry the specific action.
#[derive(Debug, Error)]
pub enum InvokeError {
    #[error("backend not ready (state: {0})")]
    NotReady(ReadinessState),

    #[error("unsupported operation: {0}")]
    Unsupported(String),

    #[error("invalid arguments for {method}: {detail}")]
    InvalidArgs { method: String, detail: String },

    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("backend error: {0}")]
    Backend(String),

    #[error("transport failure: {0}")]
    Transport(String),

    #[error("call cancelled by shutdown")]
    Cancelled,
}

/// Startup/shutdown failures of the lifecycle orchestrator.
#[derive(Debug, Error)]
pub enum SupervisorError {
    /// Programming error: one supervisor instance runs one lifecycle.
    #[error("supervisor already started (state: {0})")]
    AlreadyStarted(ReadinessState),

    #[error(transparent)]
    Provision(#[from] ProvisionError),

    #[error(transparent)]
    Launch(#[from] LaunchError),

    #[error(transparent)]
    Probe(#[from] ProbeError),

    #[error("startup cancelled by shutdown")]
    Cancelled,

    #[error("internal: {0}")]
    Internal(String),
}
