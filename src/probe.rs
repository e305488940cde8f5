use std::{
    path::Path,
    time::{Duration, Instant},
};

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::{error::ProbeError, trace};

/// Body of a successful `GET /health` response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: String,
    #[serde(default)]
    pub pid: Option<u32>,
}

/// Two-level probe timing: `attempt_timeout` bounds one request so a hung
/// connection cannot eat the whole budget; `overall` bounds the wait as a
/// whole; `interval` paces the retries.
#[derive(Debug, Clone)]
pub struct ProbeOpts {
    pub overall: Duration,
    pub interval: Duration,
    pub attempt_timeout: Duration,
}

impl Default for ProbeOpts {
    fn default() -> Self {
        Self {
            overall: Duration::from_secs(60),
            interval: Duration::from_millis(500),
            attempt_timeout: Duration::from_secs(2),
        }
    }
}

pub fn health_url(host: &str, port: u16) -> String {
    format!("http://{host}:{port}/health")
}

async fn attempt(client: &reqwest::Client, url: &str, timeout: Duration) -> Option<HealthReport> {
    let resp = client.get(url).timeout(timeout).send().await.ok()?;
    if !resp.status().is_success() {
        return None;
    }
    resp.json::<HealthReport>().await.ok()
}

/// Polls `GET /health` until the backend answers 200 with a parseable body,
/// the overall deadline passes, or `cancel` fires. Refused connections and
/// slow or malformed answers are retried, never surfaced per-attempt.
pub async fn wait_until_healthy(
    client: &reqwest::Client,
    data_dir: &Path,
    host: &str,
    port: u16,
    opts: &ProbeOpts,
    cancel: &CancellationToken,
) -> Result<HealthReport, ProbeError> {
    let url = health_url(host, port);
    let started = Instant::now();
    let span = trace::Span::start(
        data_dir,
        None,
        "Probe",
        "PROBE.wait_healthy",
        Some(serde_json::json!({"url": url, "overall_ms": opts.overall.as_millis() as u64})),
    );

    let mut attempts: u32 = 0;
    loop {
        if cancel.is_cancelled() {
            span.err("logic", "E_CANCELLED", "cancelled", None);
            return Err(ProbeError::Cancelled);
        }

        attempts += 1;
        let result = tokio::select! {
            _ = cancel.cancelled() => {
                span.err("logic", "E_CANCELLED", "cancelled", None);
                return Err(ProbeError::Cancelled);
            }
            r = attempt(client, &url, opts.attempt_timeout) => r,
        };

        if let Some(report) = result {
            span.ok(Some(serde_json::json!({
                "attempts": attempts,
                "pid": report.pid,
                "waited_ms": started.elapsed().as_millis() as u64,
            })));
            return Ok(report);
        }

        let elapsed = started.elapsed();
        if elapsed >= opts.overall {
            let waited_ms = elapsed.as_millis() as u64;
            span.err(
                "http",
                "E_PROBE_TIMEOUT",
                &format!("no healthy answer after {attempts} attempts"),
                Some(serde_json::json!({"waited_ms": waited_ms})),
            );
            return Err(ProbeError::TimedOut { waited_ms });
        }

        let remaining = opts.overall - elapsed;
        let pause = opts.interval.min(remaining);
        tokio::select! {
            _ = cancel.cancelled() => {
                span.err("logic", "E_CANCELLED", "cancelled", None);
                return Err(ProbeError::Cancelled);
            }
            _ = tokio::time::sleep(pause) => {}
        }
    }
}
