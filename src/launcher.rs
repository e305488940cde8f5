use std::{
    fs::OpenOptions,
    io::{BufRead, BufReader, Write},
    net::{SocketAddr, TcpStream},
    path::{Path, PathBuf},
    process::{Child, Command, ExitStatus, Stdio},
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};

use crate::{error::LaunchError, provision::BackendEnvironment, trace};

const PORT_PREFLIGHT_TIMEOUT: Duration = Duration::from_millis(250);
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// The live backend child. Owned, non-cloneable; exactly one exists at a time
/// and it only ever lives inside the supervisor's `Launcher`.
#[derive(Debug)]
struct BackendProcess {
    child: Child,
    pid: u32,
    pumps: Vec<std::thread::JoinHandle<()>>,
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

pub fn backend_log_path(data_dir: &Path) -> PathBuf {
    data_dir.join("backend.log")
}

fn append_backend_log_best_effort(data_dir: &Path, label: &str, line: &str) {
    let _ = std::fs::create_dir_all(data_dir);
    let Ok(mut f) = OpenOptions::new()
        .create(true)
        .append(true)
        .open(backend_log_path(data_dir))
    else {
        return;
    };
    let _ = writeln!(f, "ts_ms={} [{label}] {line}", now_ms());
}

/// Builds the default backend launch command: venv interpreter, module run,
/// loopback bind only, port assigned by the caller via both argv and env.
pub fn backend_command(env: &BackendEnvironment, port: u16) -> Command {
    let mut cmd = Command::new(&env.python);
    cmd.current_dir(&env.backend_root)
        .env("PYTHONPATH", &env.backend_root)
        .env("NOVELVOICE_PORT", port.to_string())
        .args(["-m", "novelvoice_backend.server", "--host", "127.0.0.1", "--port"])
        .arg(port.to_string());
    cmd
}

fn port_in_use(port: u16) -> bool {
    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    TcpStream::connect_timeout(&addr, PORT_PREFLIGHT_TIMEOUT).is_ok()
}

#[cfg(unix)]
fn terminate_pid(pid: u32) {
    let _ = Command::new("kill")
        .args(["-TERM", &pid.to_string()])
        .status();
}

#[cfg(windows)]
fn terminate_pid(pid: u32) {
    let _ = Command::new("taskkill")
        .args(["/PID", &pid.to_string(), "/T"])
        .status();
}

/// Starts and stops the one backend child. Lives inside the supervisor's
/// lock, which is what makes start/stop race-free.
#[derive(Debug, Default)]
pub struct Launcher {
    current: Option<BackendProcess>,
}

impl Launcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawns `cmd` as the backend child, capturing stdout/stderr onto pump
    /// threads so the parent never blocks on child output.
    pub fn start_with(
        &mut self,
        data_dir: &Path,
        mut cmd: Command,
        port: u16,
    ) -> Result<u32, LaunchError> {
        if let Some(cur) = &self.current {
            return Err(LaunchError::AlreadyRunning(cur.pid));
        }
        if port_in_use(port) {
            return Err(LaunchError::PortInUse(port));
        }

        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        let mut child = cmd.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                LaunchError::ExecutableMissing(PathBuf::from(cmd.get_program()))
            } else {
                LaunchError::Spawn(e)
            }
        })?;
        let pid = child.id();

        let mut pumps = Vec::new();
        if let Some(out) = child.stdout.take() {
            let dir = data_dir.to_path_buf();
            pumps.push(std::thread::spawn(move || {
                for line in BufReader::new(out).lines().map_while(Result::ok) {
                    append_backend_log_best_effort(&dir, "out", &line);
                }
            }));
        }
        if let Some(err) = child.stderr.take() {
            let dir = data_dir.to_path_buf();
            pumps.push(std::thread::spawn(move || {
                for line in BufReader::new(err).lines().map_while(Result::ok) {
                    append_backend_log_best_effort(&dir, "err", &line);
                }
            }));
        }

        trace::event(
            data_dir,
            None,
            "Launcher",
            "LAUNCH.spawn",
            "ok",
            Some(serde_json::json!({"pid": pid, "port": port})),
        );

        self.current = Some(BackendProcess { child, pid, pumps });
        Ok(pid)
    }

    pub fn pid(&self) -> Option<u32> {
        self.current.as_ref().map(|p| p.pid)
    }

    /// Non-destructive liveness check: reports the exit status if the child
    /// has already terminated. The handle stays in place so `stop` remains
    /// the single cleanup path.
    pub fn try_wait_exited(&mut self) -> Option<ExitStatus> {
        let cur = self.current.as_mut()?;
        match cur.child.try_wait() {
            Ok(Some(status)) => Some(status),
            _ => None,
        }
    }

    /// Graceful stop: SIGTERM, wait out the grace period, then force-kill.
    /// Idempotent, and safe when the child already exited on its own.
    pub fn stop(&mut self, data_dir: &Path, grace: Duration) {
        let Some(mut proc) = self.current.take() else {
            return;
        };

        let already_exited = matches!(proc.child.try_wait(), Ok(Some(_)));
        if !already_exited {
            terminate_pid(proc.pid);
            let deadline = Instant::now() + grace;
            loop {
                match proc.child.try_wait() {
                    Ok(Some(_)) => break,
                    Ok(None) if Instant::now() >= deadline => {
                        let _ = proc.child.kill();
                        break;
                    }
                    Ok(None) => std::thread::sleep(STOP_POLL_INTERVAL),
                    Err(_) => break,
                }
            }
        }

        let status = proc.child.wait().ok();
        trace::event(
            data_dir,
            None,
            "Launcher",
            "LAUNCH.stop",
            "ok",
            Some(serde_json::json!({
                "pid": proc.pid,
                "exit_code": status.as_ref().and_then(|s| s.code()),
                "exit_status": status.as_ref().map(|s| s.to_string()),
                "already_exited": already_exited,
            })),
        );

        for pump in proc.pumps {
            let _ = pump.join();
        }
    }
}
