//! Parallelizer Master
//!
//! Distributes a collected test suite across worker processes, one per
//! appliance, and merges their reports into a single terminal session.

pub mod appliance;
pub mod collection;
pub mod config;
pub mod hooks;
pub mod local;
pub mod process;
pub mod registry;
pub mod reporter;
pub mod scheduler;
pub mod session;
pub mod terminal;

pub use appliance::{Appliance, ApplianceRef, ConfiguredAppliance};
pub use config::SessionConfig;
pub use hooks::{NoopHooks, ResultsLog, SessionHooks, SessionInfo, TestStatus};
pub use local::run_local;
pub use process::{CommandLauncher, LaunchSpec, Launcher, WorkerProcess};
pub use registry::SlaveRegistry;
pub use reporter::DistReporter;
pub use scheduler::Scheduler;
pub use session::{ParallelSession, SessionOutcome};
pub use terminal::TerminalReporter;
