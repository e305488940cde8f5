use std::{
    path::{Path, PathBuf},
    process::Command,
    time::{SystemTime, UNIX_EPOCH},
};

use anyhow::{anyhow, Context, Result};
use tokio_util::sync::CancellationToken;

use crate::{error::ProvisionError, trace};

/// The installed backend runtime: a virtualenv under the app data dir plus
/// the backend source root the child resolves its own modules from.
///
/// Created once by `ensure_environment`; never mutated afterwards.
#[derive(Debug, Clone)]
pub struct BackendEnvironment {
    pub python: PathBuf,
    pub backend_root: PathBuf,
    pub env_root: PathBuf,
}

pub fn env_root(data_dir: &Path) -> PathBuf {
    data_dir.join("backend-env")
}

pub fn venv_python(env_root: &Path) -> PathBuf {
    if cfg!(windows) {
        env_root.join("venv").join("Scripts").join("python.exe")
    } else {
        env_root.join("venv").join("bin").join("python")
    }
}

pub fn marker_path(env_root: &Path) -> PathBuf {
    env_root.join("provisioned.json")
}

pub fn is_provisioned(data_dir: &Path) -> bool {
    let root = env_root(data_dir);
    marker_path(&root).exists() && venv_python(&root).exists()
}

/// Side-effecting provisioning steps, injectable for tests.
#[derive(Clone)]
pub struct ProvisionerDeps {
    pub create_venv: fn(&Path, &Path) -> Result<()>,
    pub install_requirements: fn(&Path, &Path) -> Result<()>,
}

impl Default for ProvisionerDeps {
    fn default() -> Self {
        Self {
            create_venv,
            install_requirements,
        }
    }
}

fn create_venv(base_python: &Path, venv_dir: &Path) -> Result<()> {
    let status = Command::new(base_python)
        .args(["-m", "venv"])
        .arg(venv_dir)
        .status()
        .with_context(|| format!("run {} -m venv failed", base_python.display()))?;
    if !status.success() {
        return Err(anyhow!("python -m venv exited with {status}"));
    }
    Ok(())
}

fn install_requirements(venv_python: &Path, requirements: &Path) -> Result<()> {
    let status = Command::new(venv_python)
        .args(["-m", "pip", "install", "--disable-pip-version-check", "-r"])
        .arg(requirements)
        .status()
        .with_context(|| format!("run pip install failed: {}", requirements.display()))?;
    if !status.success() {
        return Err(anyhow!("pip install exited with {status}"));
    }
    Ok(())
}

pub fn resolve_base_python() -> Result<PathBuf, ProvisionError> {
    if let Ok(raw) = std::env::var("NOVELVOICE_PYTHON") {
        let t = raw.trim();
        if !t.is_empty() {
            let p = PathBuf::from(t);
            if p.exists() {
                return Ok(p);
            }
            return Err(ProvisionError::BasePythonMissing {
                detail: format!("NOVELVOICE_PYTHON points to missing file: {}", p.display()),
            });
        }
    }

    for candidate in ["python3", "python"] {
        let ok = Command::new(candidate)
            .arg("--version")
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false);
        if ok {
            return Ok(PathBuf::from(candidate));
        }
    }
    Err(ProvisionError::BasePythonMissing {
        detail: "neither python3 nor python is on PATH".to_string(),
    })
}

pub fn ensure_environment(
    data_dir: &Path,
    backend_root: &Path,
    cancel: &CancellationToken,
) -> Result<BackendEnvironment, ProvisionError> {
    ensure_environment_with(data_dir, backend_root, &ProvisionerDeps::default(), cancel)
}

/// Idempotent environment provisioning.
///
/// The install marker is written last, after venv creation and dependency
/// install both succeed. A directory without the marker is treated as a
/// half-built leftover and rebuilt from scratch, so interrupted runs never
/// leave a partially usable environment behind.
pub fn ensure_environment_with(
    data_dir: &Path,
    backend_root: &Path,
    deps: &ProvisionerDeps,
    cancel: &CancellationToken,
) -> Result<BackendEnvironment, ProvisionError> {
    let root = env_root(data_dir);
    let py = venv_python(&root);

    if marker_path(&root).exists() && py.exists() {
        trace::event(
            data_dir,
            None,
            "Provision",
            "PROV.ensure",
            "skipped",
            Some(serde_json::json!({"reason": "already_provisioned", "env_root": root.display().to_string()})),
        );
        return Ok(BackendEnvironment {
            python: py,
            backend_root: backend_root.to_path_buf(),
            env_root: root,
        });
    }

    let span = trace::Span::start(
        data_dir,
        None,
        "Provision",
        "PROV.ensure",
        Some(serde_json::json!({"env_root": root.display().to_string()})),
    );

    let requirements = backend_root.join("requirements.txt");
    if !requirements.exists() {
        let e = ProvisionError::RequirementsMissing(requirements);
        span.err("provision", "E_PROVISION_FAILED", &e.to_string(), None);
        return Err(e);
    }

    // No marker means any existing directory is a half-built leftover.
    if root.exists() {
        if let Err(e) = std::fs::remove_dir_all(&root) {
            span.err("io", "E_IO", &e.to_string(), None);
            return Err(ProvisionError::Io(e));
        }
    }
    if let Err(e) = std::fs::create_dir_all(&root) {
        span.err("io", "E_IO", &e.to_string(), None);
        return Err(ProvisionError::Io(e));
    }

    if cancel.is_cancelled() {
        span.err("provision", "E_CANCELLED", "cancelled", None);
        return Err(ProvisionError::Cancelled);
    }

    let base = match resolve_base_python() {
        Ok(p) => p,
        Err(e) => {
            span.err("provision", "E_PYTHON_NOT_FOUND", &e.to_string(), None);
            return Err(e);
        }
    };

    if let Err(e) = (deps.create_venv)(&base, &root.join("venv")) {
        span.err_anyhow("provision", "E_VENV_CREATE", &e, None);
        return Err(ProvisionError::VenvCreateFailed(format!("{e:#}")));
    }
    if !py.exists() {
        let e = ProvisionError::VenvCreateFailed(format!(
            "interpreter missing after venv create: {}",
            py.display()
        ));
        span.err("provision", "E_VENV_CREATE", &e.to_string(), None);
        return Err(e);
    }

    if cancel.is_cancelled() {
        span.err("provision", "E_CANCELLED", "cancelled", None);
        return Err(ProvisionError::Cancelled);
    }

    if let Err(e) = (deps.install_requirements)(&py, &requirements) {
        span.err_anyhow("provision", "E_INSTALL_FAILED", &e, None);
        return Err(ProvisionError::InstallFailed(format!("{e:#}")));
    }

    if cancel.is_cancelled() {
        span.err("provision", "E_CANCELLED", "cancelled", None);
        return Err(ProvisionError::Cancelled);
    }

    let provisioned_at_ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0);
    let marker = serde_json::json!({
        "provisioned_at_ms": provisioned_at_ms,
        "base_python": base.display().to_string(),
    });
    if let Err(e) = std::fs::write(
        marker_path(&root),
        serde_json::to_string_pretty(&marker).unwrap_or_default(),
    ) {
        span.err("io", "E_IO", &e.to_string(), None);
        return Err(ProvisionError::Io(e));
    }

    span.ok(Some(serde_json::json!({"python": py.display().to_string()})));
    Ok(BackendEnvironment {
        python: py,
        backend_root: backend_root.to_path_buf(),
        env_root: root,
    })
}
