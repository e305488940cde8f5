use std::{
    fs::OpenOptions,
    io::Write,
    path::{Path, PathBuf},
    sync::{Mutex, OnceLock},
    time::{Instant, SystemTime, UNIX_EPOCH},
};

use anyhow::Error as AnyhowError;
use serde::Serialize;
use serde_json::Value;

const DEFAULT_TRACE_MAX_BYTES: u64 = 10_000_000; // 10MB
const DEFAULT_TRACE_MAX_FILES: usize = 5;

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

fn env_bool_default_true(key: &str) -> bool {
    match std::env::var(key) {
        Ok(v) => {
            let t = v.trim().to_ascii_lowercase();
            !(t == "0" || t == "false" || t == "no" || t == "off")
        }
        Err(_) => true,
    }
}

fn env_u64(key: &str, default: u64) -> u64 {
    match std::env::var(key) {
        Ok(v) => v.trim().parse::<u64>().unwrap_or(default),
        Err(_) => default,
    }
}

fn env_usize(key: &str, default: usize) -> usize {
    match std::env::var(key) {
        Ok(v) => v.trim().parse::<usize>().unwrap_or(default),
        Err(_) => default,
    }
}

pub fn enabled() -> bool {
    // Default: enabled. Users can set NOVELVOICE_TRACE_ENABLED=0 to disable.
    env_bool_default_true("NOVELVOICE_TRACE_ENABLED")
}

fn max_bytes() -> u64 {
    env_u64("NOVELVOICE_TRACE_MAX_BYTES", DEFAULT_TRACE_MAX_BYTES)
}

fn max_files() -> usize {
    env_usize("NOVELVOICE_TRACE_MAX_FILES", DEFAULT_TRACE_MAX_FILES)
}

pub fn trace_path(data_dir: &Path) -> PathBuf {
    data_dir.join("trace.jsonl")
}

fn rotate_if_needed_best_effort(data_dir: &Path) {
    let p = trace_path(data_dir);
    let max_b = max_bytes();
    let max_f = max_files();
    if max_f == 0 {
        return;
    }

    let len = match std::fs::metadata(&p) {
        Ok(m) => m.len(),
        Err(_) => return,
    };
    if len <= max_b {
        return;
    }

    // Remove the oldest first so Windows renames won't fail on existing dest files.
    let oldest = data_dir.join(format!("trace.jsonl.{max_f}"));
    if oldest.exists() {
        let _ = std::fs::remove_file(&oldest);
    }

    // Shift: trace.jsonl.(n-1) -> trace.jsonl.n, then trace.jsonl -> trace.jsonl.1
    for i in (1..max_f).rev() {
        let src = data_dir.join(format!("trace.jsonl.{i}"));
        let dst = data_dir.join(format!("trace.jsonl.{}", i + 1));
        if src.exists() {
            let _ = std::fs::rename(&src, &dst);
        }
    }
    let first = data_dir.join("trace.jsonl.1");
    let _ = std::fs::rename(&p, &first);
}

fn trace_write_lock() -> &'static Mutex<()> {
    static TRACE_WRITE_LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    TRACE_WRITE_LOCK.get_or_init(|| Mutex::new(()))
}

pub fn emit_best_effort(data_dir: &Path, ev: &TraceEvent) {
    if !enabled() {
        return;
    }
    let _guard = trace_write_lock()
        .lock()
        .unwrap_or_else(|p| p.into_inner());
    let _ = std::fs::create_dir_all(data_dir);
    rotate_if_needed_best_effort(data_dir);

    let p = trace_path(data_dir);
    let mut f = match OpenOptions::new().create(true).append(true).open(&p) {
        Ok(f) => f,
        Err(e) => {
            crate::safe_eprintln!("trace: open failed: {}: {e}", p.display());
            return;
        }
    };
    let mut line = match serde_json::to_string(ev) {
        Ok(s) => s,
        Err(e) => {
            crate::safe_eprintln!("trace: serialize failed: {e}");
            return;
        }
    };
    line.push('\n');
    if let Err(e) = f.write_all(line.as_bytes()) {
        crate::safe_eprintln!("trace: write failed: {e}");
    }
}

fn anyhow_chain(err: &AnyhowError) -> Vec<String> {
    err.chain().map(|e| e.to_string()).collect()
}

#[derive(Debug, Clone, Serialize)]
pub struct TraceError {
    pub kind: String,    // process|http|io|logic|provision|unknown
    pub code: String,    // E_*
    pub message: String, // short
}

#[derive(Debug, Clone, Serialize)]
pub struct TraceEvent {
    pub ts_ms: i64,
    pub session_id: Option<String>,
    pub component: String,
    pub step_id: String,
    pub op: String,     // start|end|event
    pub status: String, // ok|err|skipped|aborted
    pub duration_ms: Option<u128>,
    pub error: Option<TraceError>,
    pub ctx: Option<Value>,
}

pub fn event(
    data_dir: &Path,
    session_id: Option<&str>,
    component: &str,
    step_id: &str,
    status: &str,
    ctx: Option<Value>,
) {
    emit_best_effort(
        data_dir,
        &TraceEvent {
            ts_ms: now_ms(),
            session_id: session_id.map(|s| s.to_string()),
            component: component.to_string(),
            step_id: step_id.to_string(),
            op: "event".to_string(),
            status: status.to_string(),
            duration_ms: None,
            error: None,
            ctx,
        },
    );
}

pub struct Span {
    data_dir: PathBuf,
    session_id: Option<String>,
    component: String,
    step_id: String,
    t0: Instant,
    finished: bool,
}

impl Span {
    pub fn start(
        data_dir: &Path,
        session_id: Option<&str>,
        component: &str,
        step_id: &str,
        ctx: Option<Value>,
    ) -> Self {
        emit_best_effort(
            data_dir,
            &TraceEvent {
                ts_ms: now_ms(),
                session_id: session_id.map(|s| s.to_string()),
                component: component.to_string(),
                step_id: step_id.to_string(),
                op: "start".to_string(),
                status: "ok".to_string(),
                duration_ms: None,
                error: None,
                ctx,
            },
        );
        Self {
            data_dir: data_dir.to_path_buf(),
            session_id: session_id.map(|s| s.to_string()),
            component: component.to_string(),
            step_id: step_id.to_string(),
            t0: Instant::now(),
            finished: false,
        }
    }

    fn end_event(&self, status: &str, error: Option<TraceError>, ctx: Option<Value>) -> TraceEvent {
        TraceEvent {
            ts_ms: now_ms(),
            session_id: self.session_id.clone(),
            component: self.component.clone(),
            step_id: self.step_id.clone(),
            op: "end".to_string(),
            status: status.to_string(),
            duration_ms: Some(self.t0.elapsed().as_millis()),
            error,
            ctx,
        }
    }

    pub fn ok(mut self, ctx: Option<Value>) {
        self.finished = true;
        emit_best_effort(&self.data_dir, &self.end_event("ok", None, ctx));
    }

    pub fn err(mut self, kind: &str, code: &str, message: &str, ctx: Option<Value>) {
        self.finished = true;
        emit_best_effort(
            &self.data_dir,
            &self.end_event(
                "err",
                Some(TraceError {
                    kind: kind.to_string(),
                    code: code.to_string(),
                    message: message.to_string(),
                }),
                ctx,
            ),
        );
    }

    pub fn err_anyhow(mut self, kind: &str, code: &str, err: &AnyhowError, ctx: Option<Value>) {
        self.finished = true;
        let mut m = serde_json::Map::new();
        m.insert(
            "err_chain".to_string(),
            serde_json::json!(anyhow_chain(err)),
        );
        if let Some(Value::Object(extra)) = ctx {
            for (k, v) in extra.into_iter() {
                m.insert(k, v);
            }
        }
        emit_best_effort(
            &self.data_dir,
            &self.end_event(
                "err",
                Some(TraceError {
                    kind: kind.to_string(),
                    code: code.to_string(),
                    message: err.to_string(),
                }),
                Some(Value::Object(m)),
            ),
        );
    }
}

impl Drop for Span {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        let ev = self.end_event(
            "aborted",
            Some(TraceError {
                kind: "logic".to_string(),
                code: "ABORTED".to_string(),
                message: "span dropped without explicit ok/err".to_string(),
            }),
            None,
        );
        emit_best_effort(&self.data_dir, &ev);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{fs, thread};

    #[test]
    fn concurrent_emit_keeps_jsonl_lines_parseable() {
        let td = tempfile::tempdir().expect("tempdir");
        let dir = td.path().to_path_buf();
        let threads = 8;
        let per_thread = 60;

        let mut joins = Vec::new();
        for i in 0..threads {
            let dir2 = dir.clone();
            joins.push(thread::spawn(move || {
                for j in 0..per_thread {
                    event(
                        &dir2,
                        Some("session-concurrent"),
                        "TraceTest",
                        "TRACE.concurrent_emit",
                        "ok",
                        Some(serde_json::json!({"i": i, "j": j})),
                    );
                }
            }));
        }

        for j in joins {
            j.join().expect("join");
        }

        let raw = fs::read_to_string(trace_path(&dir)).expect("read trace");
        let mut lines = 0usize;
        for line in raw.lines() {
            lines += 1;
            let v: serde_json::Value = serde_json::from_str(line).expect("valid json line");
            assert!(v.get("step_id").is_some());
            assert!(v.get("status").is_some());
        }
        assert_eq!(lines, threads * per_thread);
    }

    #[test]
    fn span_err_anyhow_records_the_full_error_chain() {
        let td = tempfile::tempdir().expect("tempdir");
        let err = anyhow::anyhow!("connection reset").context("pip install failed");
        Span::start(td.path(), Some("s-2"), "TraceTest", "TRACE.chained", None).err_anyhow(
            "provision",
            "E_INSTALL_FAILED",
            &err,
            Some(serde_json::json!({"step": "install"})),
        );

        let raw = fs::read_to_string(trace_path(td.path())).expect("read trace");
        let last = raw.lines().last().expect("at least one line");
        let v: serde_json::Value = serde_json::from_str(last).expect("valid json");
        assert_eq!(v["status"], "err");
        assert_eq!(v["error"]["code"], "E_INSTALL_FAILED");
        assert_eq!(v["error"]["message"], "pip install failed");
        let chain = v["ctx"]["err_chain"].as_array().expect("err_chain");
        assert_eq!(chain.len(), 2);
        assert_eq!(chain[1], "connection reset");
        assert_eq!(v["ctx"]["step"], "install");
    }

    #[test]
    fn span_drop_emits_aborted_end() {
        let td = tempfile::tempdir().expect("tempdir");
        {
            let _span = Span::start(td.path(), Some("s-1"), "TraceTest", "TRACE.dropped", None);
        }
        let raw = fs::read_to_string(trace_path(td.path())).expect("read trace");
        let last = raw.lines().last().expect("at least one line");
        let v: serde_json::Value = serde_json::from_str(last).expect("valid json");
        assert_eq!(v["op"], "end");
        assert_eq!(v["status"], "aborted");
    }
}
