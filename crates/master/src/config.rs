//! Master configuration

use parallelizer_common::{Error, ProviderTag, Result, RunnerOptions};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Parallel session configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// External runner options, forwarded to every worker
    pub runner: RunnerOptions,

    /// Worker process configuration
    pub worker: WorkerConfig,

    /// Test group allocation
    pub scheduler: SchedulerConfig,

    /// Worker lifecycle
    pub registry: RegistryConfig,

    /// Master/worker transport
    pub transport: TransportConfig,

    /// Appliances, one worker each
    pub appliances: Vec<ApplianceConfig>,
}

/// Worker process configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Worker binary; a bare name is looked up next to the master binary first
    pub binary: PathBuf,

    /// Directory receiving one log file per worker
    pub log_dir: PathBuf,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("parallelizer-worker"),
            log_dir: PathBuf::from(".parallelizer/logs"),
        }
    }
}

/// What happens to an appliance that has to switch providers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CleanupPolicy {
    /// Remove every provider from the appliance before reassigning it
    #[default]
    DeleteAllProviders,
    /// Only rebind the worker's affinity
    ReassignOnly,
}

/// Test group allocation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Providers a single worker may hold at once
    pub max_providers_per_worker: usize,

    /// Provider switch behaviour
    pub cleanup_policy: CleanupPolicy,

    /// Known provider tags
    pub provider_tags: Vec<ProviderTag>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_providers_per_worker: 1,
            cleanup_policy: CleanupPolicy::default(),
            provider_tags: Vec::new(),
        }
    }
}

/// Worker lifecycle
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Spawns allowed per appliance before the session is aborted
    pub spawn_ceiling_factor: usize,

    /// Time a stopping worker gets before it is killed
    pub shutdown_timeout_secs: u64,

    /// Exit status poll interval of the shutdown monitor
    pub monitor_poll_ms: u64,

    /// Progress report interval of the shutdown monitor
    pub monitor_report_secs: u64,

    /// Time a worker may leave its outbox full before it is interrupted
    pub drain_timeout_secs: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            spawn_ceiling_factor: 3,
            shutdown_timeout_secs: 300,
            monitor_poll_ms: 500,
            monitor_report_secs: 60,
            drain_timeout_secs: 60,
        }
    }
}

impl RegistryConfig {
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    pub fn monitor_poll(&self) -> Duration {
        Duration::from_millis(self.monitor_poll_ms)
    }

    pub fn monitor_report(&self) -> Duration {
        Duration::from_secs(self.monitor_report_secs)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }
}

/// Master/worker transport
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Runner cache directory holding the IPC endpoint
    pub cache_dir: PathBuf,

    /// Receive poll timeout of the session loop
    pub poll_interval_ms: u64,

    /// Unsent messages allowed per worker
    pub outbox_capacity: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            cache_dir: PathBuf::from(".parallelizer/cache"),
            poll_interval_ms: 50,
            outbox_capacity: 256,
        }
    }
}

impl TransportConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// One appliance entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplianceConfig {
    pub url: String,

    #[serde(default)]
    pub hostname: Option<String>,

    /// Command removing all providers; `{url}` is substituted
    #[serde(default)]
    pub cleanup_command: Option<Vec<String>>,
}

impl ApplianceConfig {
    pub fn from_url(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            hostname: None,
            cleanup_command: None,
        }
    }
}

impl SessionConfig {
    /// Load configuration from file
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Self = toml::from_str(&content)?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to file
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let content = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Reject values the session cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.scheduler.max_providers_per_worker == 0 {
            return Err(Error::InvalidConfig(
                "scheduler.max_providers_per_worker must be at least 1".to_string(),
            ));
        }
        // The initial spawns alone reach a factor of 1
        if self.registry.spawn_ceiling_factor < 2 {
            return Err(Error::InvalidConfig(
                "registry.spawn_ceiling_factor must be at least 2".to_string(),
            ));
        }
        if self.runner.collect_command.is_empty() || self.runner.run_command.is_empty() {
            return Err(Error::InvalidConfig(
                "runner.collect_command and runner.run_command must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Resolve the worker binary, preferring one installed next to ours
    pub fn worker_binary(&self) -> PathBuf {
        let binary = &self.worker.binary;
        if binary.components().count() == 1 {
            if let Some(dir) = std::env::current_exe()
                .ok()
                .and_then(|exe| exe.parent().map(Path::to_path_buf))
            {
                let sibling = dir.join(binary);
                if sibling.exists() {
                    return sibling;
                }
            }
        }
        binary.clone()
    }
}
