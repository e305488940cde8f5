use std::{path::PathBuf, sync::Arc, time::Duration};

use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::{error::InvokeError, trace};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verb {
    Get,
    Post,
}

impl Verb {
    fn as_str(self) -> &'static str {
        match self {
            Verb::Get => "GET",
            Verb::Post => "POST",
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Route {
    method: &'static str,
    verb: Verb,
    template: &'static str,
    has_id: bool,
}

/// Every operation the frontend may invoke. Additions go here and nowhere
/// else; an unknown method name is rejected before any network traffic.
const METHOD_TABLE: &[Route] = &[
    Route { method: "load_book", verb: Verb::Post, template: "/api/book/load", has_id: false },
    Route { method: "selected_chapters", verb: Verb::Get, template: "/api/book/selected", has_id: false },
    Route { method: "get_chapter", verb: Verb::Get, template: "/api/chapter/{id}", has_id: true },
    Route { method: "update_chapter", verb: Verb::Post, template: "/api/chapter/{id}/update", has_id: true },
    Route { method: "toggle_chapter", verb: Verb::Post, template: "/api/chapter/{id}/toggle", has_id: true },
    Route { method: "preview_voice", verb: Verb::Post, template: "/api/voice/preview", has_id: false },
    Route { method: "start_synthesis", verb: Verb::Post, template: "/api/synthesis/start", has_id: false },
    Route { method: "synthesis_progress", verb: Verb::Get, template: "/api/synthesis/progress", has_id: false },
    Route { method: "stop_synthesis", verb: Verb::Post, template: "/api/synthesis/stop", has_id: false },
    Route { method: "check_models", verb: Verb::Get, template: "/api/models/status", has_id: false },
    Route { method: "dependencies", verb: Verb::Get, template: "/api/models/dependencies", has_id: false },
    Route { method: "start_model_download", verb: Verb::Post, template: "/api/models/download", has_id: false },
    Route { method: "download_progress", verb: Verb::Get, template: "/api/models/download_progress", has_id: false },
    Route { method: "default_output_dir", verb: Verb::Get, template: "/api/output_dir", has_id: false },
];

fn lookup(method: &str) -> Option<&'static Route> {
    METHOD_TABLE.iter().find(|r| r.method == method)
}

fn resolve_path(route: &Route, args: &Value) -> Result<String, InvokeError> {
    if !route.has_id {
        return Ok(route.template.to_string());
    }
    let id = args
        .get("id")
        .and_then(|v| match v {
            Value::String(s) if !s.is_empty() => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
        .ok_or_else(|| InvokeError::InvalidArgs {
            method: route.method.to_string(),
            detail: "missing required argument: id".to_string(),
        })?;
    Ok(route.template.replace("{id}", &id))
}

/// How calls reach the backend. Implementations carry the wire mechanics;
/// the bridge owns routing, gating and error mapping. `cancel` is the
/// supervisor's shutdown token: an in-flight call must not outlive it.
pub trait Transport: Send + Sync {
    fn dispatch<'a>(
        &'a self,
        verb: Verb,
        path: &'a str,
        body: Option<&'a Value>,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<Value, InvokeError>>;
}

/// Loopback HTTP to the supervised child.
pub struct HttpTransport {
    client: reqwest::Client,
    base: String,
    call_timeout: Duration,
}

impl HttpTransport {
    pub fn new(client: reqwest::Client, base: String) -> Self {
        Self {
            client,
            base,
            call_timeout: Duration::from_secs(30),
        }
    }

    pub fn with_call_timeout(mut self, call_timeout: Duration) -> Self {
        self.call_timeout = call_timeout;
        self
    }

    async fn send(&self, verb: Verb, path: &str, body: Option<&Value>) -> Result<Value, InvokeError> {
        let url = format!("{}{path}", self.base);
        let mut req = match verb {
            Verb::Get => self.client.get(&url),
            Verb::Post => self.client.post(&url),
        }
        .timeout(self.call_timeout);
        if let Some(b) = body {
            req = req.json(b);
        }
        let resp = req
            .send()
            .await
            .map_err(|e| InvokeError::Transport(format!("{verb} {url} failed: {e}", verb = verb.as_str())))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(InvokeError::Transport(format!(
                "backend returned HTTP {status} for {path}"
            )));
        }
        resp.json::<Value>()
            .await
            .map_err(|e| InvokeError::Transport(format!("invalid JSON from {path}: {e}")))
    }
}

impl Transport for HttpTransport {
    fn dispatch<'a>(
        &'a self,
        verb: Verb,
        path: &'a str,
        body: Option<&'a Value>,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<Value, InvokeError>> {
        Box::pin(async move {
            tokio::select! {
                _ = cancel.cancelled() => Err(InvokeError::Cancelled),
                r = self.send(verb, path, body) => r,
            }
        })
    }
}

/// In-process backend surface for the direct (no child process) transport.
pub trait LocalBackend: Send + Sync {
    fn call(&self, verb: Verb, path: &str, body: Option<&Value>) -> Result<Value, String>;
}

/// Direct transport: same routing and envelope handling as HTTP, no sockets.
pub struct DirectTransport {
    backend: Arc<dyn LocalBackend>,
}

impl DirectTransport {
    pub fn new(backend: Arc<dyn LocalBackend>) -> Self {
        Self { backend }
    }
}

impl Transport for DirectTransport {
    fn dispatch<'a>(
        &'a self,
        verb: Verb,
        path: &'a str,
        body: Option<&'a Value>,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<Value, InvokeError>> {
        Box::pin(async move {
            if cancel.is_cancelled() {
                return Err(InvokeError::Cancelled);
            }
            self.backend
                .call(verb, path, body)
                .map_err(InvokeError::Backend)
        })
    }
}

/// Readiness check the bridge consults before every dispatch. Implemented by
/// the supervisor; test doubles stand in for it in unit tests.
pub trait ReadinessGate: Send + Sync {
    fn check_invokable(&self) -> Result<(), InvokeError>;
}

fn unwrap_envelope(value: Value) -> Result<Value, InvokeError> {
    if let Value::Object(obj) = &value {
        if obj.get("success") == Some(&Value::Bool(false)) {
            let msg = obj
                .get("error")
                .and_then(|v| v.as_str())
                .unwrap_or("unspecified backend error")
                .to_string();
            return Err(InvokeError::Backend(msg));
        }
    }
    Ok(value)
}

/// Routes `invoke(method, args)` calls from the frontend onto a transport,
/// after the readiness gate admits them.
pub struct Bridge {
    gate: Arc<dyn ReadinessGate>,
    transport: Arc<dyn Transport>,
    data_dir: PathBuf,
    cancel: CancellationToken,
}

impl Bridge {
    pub fn new(
        gate: Arc<dyn ReadinessGate>,
        transport: Arc<dyn Transport>,
        data_dir: PathBuf,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            gate,
            transport,
            data_dir,
            cancel,
        }
    }

    /// Unknown methods are rejected before the gate so a typo surfaces as
    /// `Unsupported` in every lifecycle state.
    pub async fn invoke(&self, method: &str, args: Value) -> Result<Value, InvokeError> {
        let Some(route) = lookup(method) else {
            return Err(InvokeError::Unsupported(method.to_string()));
        };
        let path = resolve_path(route, &args)?;
        self.gate.check_invokable()?;

        let span = trace::Span::start(
            &self.data_dir,
            None,
            "Bridge",
            "BRIDGE.invoke",
            Some(serde_json::json!({"method": method, "path": path})),
        );

        let body = match route.verb {
            Verb::Post if !args.is_null() => Some(&args),
            _ => None,
        };
        match self
            .transport
            .dispatch(route.verb, &path, body, &self.cancel)
            .await
        {
            Ok(value) => match unwrap_envelope(value) {
                Ok(v) => {
                    span.ok(None);
                    Ok(v)
                }
                Err(e) => {
                    span.err("logic", "E_BACKEND", &e.to_string(), None);
                    Err(e)
                }
            },
            Err(e) => {
                let code = match &e {
                    InvokeError::Transport(_) => "E_TRANSPORT",
                    InvokeError::BackendUnavailable(_) => "E_BACKEND_GONE",
                    InvokeError::Cancelled => "E_CANCELLED",
                    _ => "E_INVOKE",
                };
                span.err("http", code, &e.to_string(), None);
                Err(e)
            }
        }
    }

    pub async fn check_models(&self) -> Result<ModelStatusReport, InvokeError> {
        let v = self.invoke("check_models", Value::Null).await?;
        serde_json::from_value(v)
            .map_err(|e| InvokeError::Transport(format!("malformed model status: {e}")))
    }

    pub async fn synthesis_progress(&self) -> Result<SynthesisProgress, InvokeError> {
        let v = self.invoke("synthesis_progress", Value::Null).await?;
        serde_json::from_value(v)
            .map_err(|e| InvokeError::Transport(format!("malformed synthesis progress: {e}")))
    }

    pub async fn download_progress(&self) -> Result<DownloadProgress, InvokeError> {
        let v = self.invoke("download_progress", Value::Null).await?;
        serde_json::from_value(v)
            .map_err(|e| InvokeError::Transport(format!("malformed download progress: {e}")))
    }
}

/// Snapshot of a running or finished synthesis job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SynthesisProgress {
    pub percent: f64,
    pub status: String,
    pub running: bool,
}

/// Snapshot of a model download job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadProgress {
    #[serde(default)]
    pub current_model: Option<String>,
    pub model_index: u32,
    pub total_models: u32,
    pub status: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelDependency {
    pub name: String,
    pub id: String,
    pub installed: bool,
    pub size_mb: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelStatusReport {
    pub all_installed: bool,
    pub ffmpeg_installed: bool,
    pub total_download_mb: f64,
    pub models: Vec<ModelDependency>,
}
