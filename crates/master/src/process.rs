//! Worker process launching
//!
//! A worker is launched with the startup contract
//! `--worker ID --appliance JSON --ts TS --config JSON`. The registry only
//! sees the [`WorkerProcess`] handle, so tests can launch in-process workers.

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use parallelizer_common::{Error, Result, WorkerId, WorkerSettings};
use parking_lot::Mutex;
use serde_json::Value;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::Arc;
use tracing::{debug, info};

/// A running worker
pub trait WorkerProcess: Send {
    fn pid(&self) -> Option<u32>;

    /// Exit status if the worker has exited.
    ///
    /// Death by signal is reported as the negated signal number, so a
    /// SIGKILL shows up as `-9`.
    fn try_wait(&mut self) -> Result<Option<i32>>;

    /// Ask the worker to finish its current test and shut down
    fn interrupt(&mut self) -> Result<()>;

    /// Terminate the worker without any protocol
    fn kill(&mut self) -> Result<()>;
}

/// Worker process shared between the registry and shutdown monitors
pub type ProcessHandle = Arc<Mutex<Box<dyn WorkerProcess>>>;

/// Everything needed to start one worker
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub id: WorkerId,
    pub appliance: Value,
    pub session_ts: String,
    pub settings: WorkerSettings,
}

impl LaunchSpec {
    /// Command line arguments of the worker binary
    pub fn args(&self) -> Result<Vec<String>> {
        Ok(vec![
            "--worker".to_string(),
            self.id.to_string(),
            "--appliance".to_string(),
            serde_json::to_string(&self.appliance)?,
            "--ts".to_string(),
            self.session_ts.clone(),
            "--config".to_string(),
            self.settings.to_json()?,
        ])
    }
}

/// Starts worker processes
pub trait Launcher: Send + Sync {
    fn launch(&self, spec: &LaunchSpec) -> Result<Box<dyn WorkerProcess>>;
}

fn exit_code(status: ExitStatus) -> i32 {
    match status.code() {
        Some(code) => code,
        None => -status.signal().unwrap_or(0),
    }
}

/// Worker running as an OS child process
pub struct ChildProcess {
    child: Child,
    status: Option<i32>,
}

impl ChildProcess {
    pub fn new(child: Child) -> Self {
        Self {
            child,
            status: None,
        }
    }

    fn signal(&mut self, signal: Signal) -> Result<()> {
        if self.try_wait()?.is_some() {
            return Ok(());
        }
        kill(Pid::from_raw(self.child.id() as i32), signal).map_err(std::io::Error::from)?;
        Ok(())
    }
}

impl WorkerProcess for ChildProcess {
    fn pid(&self) -> Option<u32> {
        Some(self.child.id())
    }

    fn try_wait(&mut self) -> Result<Option<i32>> {
        if self.status.is_none() {
            self.status = self.child.try_wait()?.map(exit_code);
        }
        Ok(self.status)
    }

    fn interrupt(&mut self) -> Result<()> {
        self.signal(Signal::SIGINT)
    }

    fn kill(&mut self) -> Result<()> {
        self.signal(Signal::SIGKILL)
    }
}

/// Launches the worker binary
#[derive(Debug, Clone)]
pub struct CommandLauncher {
    binary: PathBuf,
}

impl CommandLauncher {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }
}

impl Launcher for CommandLauncher {
    fn launch(&self, spec: &LaunchSpec) -> Result<Box<dyn WorkerProcess>> {
        let args = spec.args()?;
        debug!("Worker command: {} {}", self.binary.display(), args.join(" "));

        // Workers log to their own file; stdout is discarded
        let child = Command::new(&self.binary)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| Error::Spawn {
                worker: spec.id.to_string(),
                reason: format!("{}: {}", self.binary.display(), e),
            })?;

        info!("Worker {} started with PID {}", spec.id, child.id());
        Ok(Box::new(ChildProcess::new(child)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parallelizer_common::RunnerOptions;
    use std::time::Duration;

    fn spawn(script: &str) -> ChildProcess {
        ChildProcess::new(
            Command::new("sh")
                .args(["-c", script])
                .stdout(Stdio::null())
                .spawn()
                .unwrap(),
        )
    }

    fn wait(process: &mut ChildProcess) -> i32 {
        for _ in 0..100 {
            if let Some(code) = process.try_wait().unwrap() {
                return code;
            }
            std::thread::sleep(Duration::from_millis(50));
        }
        panic!("process did not exit");
    }

    #[test]
    fn test_exit_code_is_reported() {
        let mut process = spawn("exit 3");
        assert_eq!(wait(&mut process), 3);
        // Cached after the first reap
        assert_eq!(process.try_wait().unwrap(), Some(3));
    }

    #[test]
    fn test_kill_reports_negative_signal() {
        let mut process = spawn("sleep 30");
        assert_eq!(process.try_wait().unwrap(), None);
        process.kill().unwrap();
        assert_eq!(wait(&mut process), -9);
    }

    #[test]
    fn test_interrupt_after_exit_is_noop() {
        let mut process = spawn("exit 0");
        assert_eq!(wait(&mut process), 0);
        assert!(process.interrupt().is_ok());
    }

    #[test]
    fn test_launch_spec_args() {
        let spec = LaunchSpec {
            id: WorkerId::new("slave03"),
            appliance: serde_json::json!({"url": "https://a"}),
            session_ts: "1700000000.000001".to_string(),
            settings: WorkerSettings::new("/tmp/ep", RunnerOptions::default()),
        };
        let args = spec.args().unwrap();
        assert_eq!(args[0], "--worker");
        assert_eq!(args[1], "slave03");
        assert_eq!(args[3], r#"{"url":"https://a"}"#);
        assert_eq!(args[5], "1700000000.000001");
        let settings = WorkerSettings::from_json(&args[7]).unwrap();
        assert_eq!(settings.endpoint, PathBuf::from("/tmp/ep"));
    }

    #[test]
    fn test_missing_binary_is_spawn_error() {
        let launcher = CommandLauncher::new("/nonexistent/parallelizer-worker");
        let spec = LaunchSpec {
            id: WorkerId::new("slave00"),
            appliance: Value::Null,
            session_ts: String::new(),
            settings: WorkerSettings::new("/tmp/ep", RunnerOptions::default()),
        };
        assert!(matches!(
            launcher.launch(&spec),
            Err(Error::Spawn { .. })
        ));
    }
}
