pub mod bridge;
pub mod data_dir;
pub mod error;
pub mod launcher;
pub mod panic_log;
pub mod probe;
pub mod provision;
pub mod safe_print;
pub mod supervisor;
pub mod trace;

pub use bridge::{Bridge, DirectTransport, HttpTransport, LocalBackend, ReadinessGate, Transport};
pub use error::{InvokeError, LaunchError, ProbeError, ProvisionError, SupervisorError};
pub use probe::{HealthReport, ProbeOpts};
pub use provision::BackendEnvironment;
pub use supervisor::{ReadinessState, Supervisor, SupervisorConfig, SupervisorDeps};
