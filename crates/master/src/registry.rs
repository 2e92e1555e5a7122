//! Worker registry
//!
//! Owns one [`WorkerRecord`] per worker and arbitrates spawning, interrupts,
//! kills and the per-iteration audit. Records are only mutated from the
//! session loop; shutdown monitors hold nothing but the process handle.

use crate::appliance::ApplianceRef;
use crate::config::RegistryConfig;
use crate::process::{LaunchSpec, Launcher, ProcessHandle};
use parallelizer_common::{
    Error, ProviderTag, Result, TestId, WorkerId, WorkerIdGenerator, WorkerSettings,
};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Master-side state of one worker
pub struct WorkerRecord {
    pub id: WorkerId,
    pub appliance: ApplianceRef,
    pub settings: WorkerSettings,
    pub process: Option<ProcessHandle>,
    /// Dispatched tests without a completing report, in dispatch order
    pub in_flight: Vec<TestId>,
    pub provider_affinity: Vec<ProviderTag>,
    pub forbid_restart: bool,
    /// A shutdown monitor owns the process
    pub monitoring: bool,
    /// Since when the worker's outbox has been full
    pub stalled_since: Option<Instant>,
}

impl WorkerRecord {
    fn new(id: WorkerId, appliance: ApplianceRef, settings: WorkerSettings) -> Self {
        Self {
            id,
            appliance,
            settings,
            process: None,
            in_flight: Vec::new(),
            provider_affinity: Vec::new(),
            forbid_restart: false,
            monitoring: false,
            stalled_since: None,
        }
    }

    /// Exit status of the child, `None` while it runs or was never started
    pub fn poll(&self) -> Option<i32> {
        let process = self.process.as_ref()?;
        let status = process.lock().try_wait();
        match status {
            Ok(status) => status,
            Err(e) => {
                warn!("Failed to poll {}: {}", self.id, e);
                None
            }
        }
    }

    pub fn is_alive(&self) -> bool {
        self.process.is_some() && self.poll().is_none()
    }
}

/// Something the audit did, for the session to report
#[derive(Debug, Clone, PartialEq)]
pub enum AuditEvent {
    /// The child exited without a shutdown handshake
    Exited {
        id: WorkerId,
        code: i32,
        /// In-flight tests to queue for redistribution
        redistributed: Vec<TestId>,
        /// Fresh id started on the same appliance
        respawned: Option<WorkerId>,
    },
    /// A forbidden worker was confirmed gone and removed
    Removed { id: WorkerId, url: String },
    /// A retired worker was still running and got interrupted
    Deactivated { id: WorkerId },
    /// A worker did not drain its outbox in time and got interrupted
    Stalled { id: WorkerId },
}

/// Registry of all workers of a session
pub struct SlaveRegistry {
    records: BTreeMap<WorkerId, WorkerRecord>,
    ids: WorkerIdGenerator,
    launcher: Arc<dyn Launcher>,
    config: RegistryConfig,
    settings: WorkerSettings,
    session_ts: String,
    spawn_count: usize,
    appliance_count: usize,
    /// Every child ever launched, killed on drop if still alive
    children: Vec<ProcessHandle>,
    monitors: Vec<JoinHandle<()>>,
}

impl SlaveRegistry {
    pub fn new(
        launcher: Arc<dyn Launcher>,
        config: RegistryConfig,
        settings: WorkerSettings,
        session_ts: impl Into<String>,
    ) -> Self {
        Self {
            records: BTreeMap::new(),
            ids: WorkerIdGenerator::new(),
            launcher,
            config,
            settings,
            session_ts: session_ts.into(),
            spawn_count: 0,
            appliance_count: 0,
            children: Vec::new(),
            monitors: Vec::new(),
        }
    }

    /// Create a record with a fresh id for `appliance`, not yet started
    pub fn register(&mut self, appliance: ApplianceRef) -> WorkerId {
        self.appliance_count += 1;
        self.insert(appliance)
    }

    fn insert(&mut self, appliance: ApplianceRef) -> WorkerId {
        let id = self.ids.next_id();
        debug!("Registered {} for {}", id, appliance.describe());
        self.records.insert(
            id.clone(),
            WorkerRecord::new(id.clone(), appliance, self.settings.clone()),
        );
        id
    }

    pub fn get(&self, id: &WorkerId) -> Option<&WorkerRecord> {
        self.records.get(id)
    }

    pub fn get_mut(&mut self, id: &WorkerId) -> Option<&mut WorkerRecord> {
        self.records.get_mut(id)
    }

    fn record_mut(&mut self, id: &WorkerId) -> Result<&mut WorkerRecord> {
        self.records
            .get_mut(id)
            .ok_or_else(|| Error::UnknownPeer(id.to_string()))
    }

    pub fn contains(&self, id: &WorkerId) -> bool {
        self.records.contains_key(id)
    }

    pub fn records(&self) -> impl Iterator<Item = &WorkerRecord> {
        self.records.values()
    }

    pub fn ids(&self) -> Vec<WorkerId> {
        self.records.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn spawn_count(&self) -> usize {
        self.spawn_count
    }

    /// Spawns allowed before the session is aborted
    pub fn spawn_ceiling(&self) -> usize {
        self.config.spawn_ceiling_factor * self.appliance_count
    }

    pub fn ceiling_reached(&self) -> bool {
        self.spawn_count >= self.spawn_ceiling()
    }

    /// Launch the child of a record. No-op once restarts are forbidden.
    pub fn spawn(&mut self, id: &WorkerId) -> Result<()> {
        let launcher = self.launcher.clone();
        let session_ts = self.session_ts.clone();
        let record = self.record_mut(id)?;
        if record.forbid_restart {
            debug!("Not spawning {}: restart forbidden", id);
            return Ok(());
        }

        let spec = LaunchSpec {
            id: record.id.clone(),
            appliance: record.appliance.descriptor(),
            session_ts,
            settings: record.settings.clone(),
        };
        record.stalled_since = None;
        // Failed launches count too, so a broken environment hits the ceiling
        self.spawn_count += 1;

        let process: ProcessHandle = Arc::new(Mutex::new(launcher.launch(&spec)?));
        self.children.push(process.clone());
        self.record_mut(id)?.process = Some(process);
        Ok(())
    }

    /// Spawn every record that has no child yet.
    ///
    /// A failed launch is logged; the audit retries it until the ceiling.
    pub fn spawn_all(&mut self) {
        for id in self.ids() {
            let pending = self
                .records
                .get(&id)
                .map_or(false, |r| r.process.is_none());
            if pending {
                if let Err(e) = self.spawn(&id) {
                    error!("Failed to spawn {}: {}", id, e);
                }
            }
        }
    }

    /// Gracefully stop a worker: SIGINT plus shutdown monitor
    pub fn interrupt(&mut self, id: &WorkerId) -> Result<()> {
        let record = self.record_mut(id)?;
        record.forbid_restart = true;
        if record.is_alive() && !record.monitoring {
            if let Some(process) = record.process.clone() {
                info!("Interrupting {}", id);
                process.lock().interrupt()?;
                record.monitoring = true;
                self.monitor_shutdown(id.clone(), process);
            }
        }
        Ok(())
    }

    /// Rudely stop a worker: SIGKILL plus shutdown monitor
    pub fn kill(&mut self, id: &WorkerId) -> Result<()> {
        let record = self.record_mut(id)?;
        record.forbid_restart = true;
        if record.is_alive() {
            if let Some(process) = record.process.clone() {
                info!("Killing {}", id);
                process.lock().kill()?;
                if !record.monitoring {
                    record.monitoring = true;
                    self.monitor_shutdown(id.clone(), process);
                }
            }
        }
        Ok(())
    }

    /// Declare a worker's appliance unusable.
    ///
    /// The next audit interrupts the worker and removes it once gone.
    pub fn retire(&mut self, id: &WorkerId) -> Result<()> {
        self.record_mut(id)?.forbid_restart = true;
        Ok(())
    }

    /// Kill a worker and start a fresh one, with a new id, on its appliance
    pub fn replace(&mut self, id: &WorkerId) -> Result<WorkerId> {
        self.kill(id)?;
        let appliance = self.record_mut(id)?.appliance.clone();
        let new_id = self.insert(appliance);
        self.spawn(&new_id)?;
        Ok(new_id)
    }

    /// Drop a crashed record and start a fresh id on its appliance.
    ///
    /// The replacement keeps the provider affinity of the appliance.
    /// Returns `None` once the ceiling is hit.
    fn respawn_crashed(&mut self, id: &WorkerId) -> Option<WorkerId> {
        let record = self.records.remove(id)?;
        if self.ceiling_reached() {
            return None;
        }
        let new_id = self.insert(record.appliance);
        if let Some(replacement) = self.records.get_mut(&new_id) {
            replacement.provider_affinity = record.provider_affinity;
        }
        // A failed launch leaves the record unstarted for the next audit
        if let Err(e) = self.spawn(&new_id) {
            error!("Failed to respawn {} as {}: {}", id, new_id, e);
        }
        Some(new_id)
    }

    /// Remove a record after its clean shutdown handshake
    pub fn deregister(&mut self, id: &WorkerId) -> Option<WorkerRecord> {
        let mut record = self.records.remove(id)?;
        record.forbid_restart = true;
        if let Some(process) = record.process.clone() {
            if !record.monitoring {
                record.monitoring = true;
                self.monitor_shutdown(id.clone(), process);
            }
        }
        Some(record)
    }

    /// Add dispatched tests to a worker's in-flight list
    pub fn dispatch(&mut self, id: &WorkerId, tests: &[TestId]) -> Result<()> {
        self.record_mut(id)?.in_flight.extend(tests.iter().cloned());
        Ok(())
    }

    /// A completing report arrived for `nodeid`
    pub fn complete(&mut self, id: &WorkerId, nodeid: &str) -> Result<()> {
        let record = self.record_mut(id)?;
        record.in_flight.retain(|t| t != nodeid);
        Ok(())
    }

    pub fn mark_stalled(&mut self, id: &WorkerId) {
        if let Some(record) = self.records.get_mut(id) {
            record.stalled_since.get_or_insert_with(Instant::now);
        }
    }

    pub fn clear_stalled(&mut self, id: &WorkerId) {
        if let Some(record) = self.records.get_mut(id) {
            record.stalled_since = None;
        }
    }

    /// Reconcile records with the state of their children.
    ///
    /// Unexpected exits hand their in-flight tests back and are replaced
    /// by a fresh id while the spawn ceiling allows. Forbidden workers are
    /// interrupted while alive and removed once gone.
    pub fn audit(&mut self) -> Vec<AuditEvent> {
        let mut events = Vec::new();

        for id in self.ids() {
            let Some(record) = self.records.get_mut(&id) else {
                continue;
            };

            if let Some(code) = record.poll() {
                record.process = None;
                let redistributed = std::mem::take(&mut record.in_flight);
                if !record.forbid_restart && code == 0 {
                    // Clean exit without a shutdown handshake: nothing to restart
                    record.forbid_restart = true;
                }

                if record.forbid_restart {
                    if code != 0 || !redistributed.is_empty() {
                        events.push(AuditEvent::Exited {
                            id: id.clone(),
                            code,
                            redistributed,
                            respawned: None,
                        });
                    }
                } else {
                    // The dead id is retired so its late messages are rejected
                    let respawned = self.respawn_crashed(&id);
                    events.push(AuditEvent::Exited {
                        id,
                        code,
                        redistributed,
                        respawned,
                    });
                    continue;
                }
            }

            let Some(record) = self.records.get_mut(&id) else {
                continue;
            };
            if record.forbid_restart {
                if record.process.is_none() {
                    let url = record.appliance.url().to_string();
                    self.records.remove(&id);
                    events.push(AuditEvent::Removed { id, url });
                } else if !record.monitoring {
                    if let Err(e) = self.interrupt(&id) {
                        error!("Failed to interrupt {}: {}", id, e);
                    }
                    events.push(AuditEvent::Deactivated { id });
                }
                continue;
            }

            if record.process.is_none() {
                if self.ceiling_reached() {
                    continue;
                }
                if let Err(e) = self.spawn(&id) {
                    error!("Failed to respawn {}: {}", id, e);
                }
                continue;
            }

            let stalled = record
                .stalled_since
                .map_or(false, |since| since.elapsed() > self.config.drain_timeout());
            if stalled {
                warn!("{} has not drained its outbox, interrupting", id);
                if let Err(e) = self.interrupt(&id) {
                    error!("Failed to interrupt {}: {}", id, e);
                }
                events.push(AuditEvent::Stalled { id });
            }
        }

        events
    }

    fn monitor_shutdown(&mut self, id: WorkerId, process: ProcessHandle) {
        let timeout = self.config.shutdown_timeout();
        let poll = self.config.monitor_poll();
        let report = self.config.monitor_report();
        self.monitors.push(tokio::spawn(monitor_shutdown(
            id, process, timeout, poll, report,
        )));
    }

    /// Wait for every shutdown monitor to finish
    pub async fn join_monitors(&mut self) {
        for handle in self.monitors.drain(..) {
            if let Err(e) = handle.await {
                error!("Shutdown monitor failed: {}", e);
            }
        }
    }
}

impl Drop for SlaveRegistry {
    fn drop(&mut self) {
        for process in &self.children {
            let mut process = process.lock();
            if matches!(process.try_wait(), Ok(None)) {
                let _ = process.kill();
            }
        }
    }
}

/// Poll a stopping worker until it exits, escalating to SIGKILL on timeout
async fn monitor_shutdown(
    id: WorkerId,
    process: ProcessHandle,
    timeout: Duration,
    poll: Duration,
    report: Duration,
) {
    let start = Instant::now();
    let mut last_report = start;

    while start.elapsed() < timeout {
        let status = process.lock().try_wait();
        match status {
            Ok(Some(0)) => {
                info!("{} exited", id);
                return;
            }
            Ok(Some(code)) => {
                warn!("{} died with status {}", id, code);
                return;
            }
            Ok(None) => {}
            Err(e) => {
                warn!("Failed to poll {} during shutdown: {}", id, e);
                return;
            }
        }

        if last_report.elapsed() >= report {
            let remaining = timeout.saturating_sub(start.elapsed()).as_secs();
            info!(
                "{} shutting down, will continue polling for {} seconds",
                id, remaining
            );
            last_report = Instant::now();
        }
        tokio::time::sleep(poll).await;
    }

    warn!("{} failed to shut down gracefully; killed", id);
    let result = process.lock().kill();
    if let Err(e) = result {
        error!("Failed to kill {}: {}", id, e);
    }
}
