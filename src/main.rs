use std::sync::Arc;

use novelvoice_desktop::{
    data_dir, panic_log, safe_eprintln, Bridge, HttpTransport, Supervisor, SupervisorConfig,
};

#[tokio::main]
async fn main() {
    panic_log::install_best_effort();

    let data_dir = match data_dir::data_dir() {
        Ok(d) => d,
        Err(e) => {
            safe_eprintln!("novelvoice: cannot resolve data dir: {e:#}");
            std::process::exit(1);
        }
    };
    let backend_root = match data_dir::backend_root() {
        Ok(d) => d,
        Err(e) => {
            safe_eprintln!("novelvoice: cannot resolve backend root: {e:#}");
            std::process::exit(1);
        }
    };

    let cfg = SupervisorConfig::new(backend_root);
    let supervisor = Supervisor::new(data_dir.clone(), cfg);

    if let Err(e) = supervisor.startup().await {
        safe_eprintln!("novelvoice: backend startup failed: {e}");
        if let Some(detail) = supervisor.last_error() {
            safe_eprintln!("novelvoice: last error: {detail}");
        }
        safe_eprintln!("novelvoice: see {} for details", data_dir.join("trace.jsonl").display());
        supervisor.shutdown().await;
        std::process::exit(1);
    }

    let pid = supervisor.backend_pid().unwrap_or(0);
    safe_eprintln!("novelvoice: backend healthy at {} (pid {pid})", supervisor.base_url());

    let bridge = Bridge::new(
        Arc::new(supervisor.clone()),
        Arc::new(HttpTransport::new(
            supervisor.http_client(),
            supervisor.base_url(),
        )),
        data_dir.clone(),
        supervisor.cancel_token(),
    );

    match bridge.check_models().await {
        Ok(report) => {
            if report.all_installed {
                safe_eprintln!("novelvoice: all voice models installed");
            } else {
                safe_eprintln!(
                    "novelvoice: {} model(s) pending download ({:.0} MB)",
                    report.models.iter().filter(|m| !m.installed).count(),
                    report.total_download_mb
                );
            }
        }
        Err(e) => safe_eprintln!("novelvoice: model status unavailable: {e}"),
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        safe_eprintln!("novelvoice: signal wait failed: {e}");
    }
    safe_eprintln!("novelvoice: shutting down backend");
    supervisor.shutdown().await;
}
