//! Parallelizer Common Library
//!
//! Shared types, the master/worker wire protocol and the Unix socket
//! transport used by the parallel test session.

pub mod error;
pub mod protocol;
pub mod runner;
pub mod transport;
pub mod types;

// Re-export commonly used types
pub use error::{Error, Result};
pub use protocol::{MasterReply, WorkerEvent, WorkerSettings};
pub use runner::{CommandRunner, ReportSink, RunnerOptions, TestRunner};
pub use types::*;

/// Parallelizer version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Environment variable carrying the worker id into runner commands
pub const ENV_WORKER_ID: &str = "PARALLELIZER_WORKER_ID";

/// Environment variable carrying the appliance url into runner commands
pub const ENV_APPLIANCE_URL: &str = "PARALLELIZER_APPLIANCE_URL";

/// Environment variable carrying the session timestamp into runner commands
pub const ENV_SESSION_TS: &str = "PARALLELIZER_SESSION_TS";

/// IPC endpoint of a master: `<cache_dir>/parallelize/<pid>`
pub fn endpoint_path(cache_dir: &std::path::Path, pid: u32) -> std::path::PathBuf {
    cache_dir.join("parallelize").join(pid.to_string())
}

/// Session timestamp shared by master and workers
pub fn session_timestamp() -> String {
    let now = chrono::Utc::now();
    format!("{}.{:06}", now.timestamp(), now.timestamp_subsec_micros())
}
