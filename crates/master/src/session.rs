//! Parallel session
//!
//! The master side of a distributed run. One loop owns the router, the
//! registry and the scheduler: every iteration audits the workers, checks
//! the termination conditions and handles at most one worker event. Only
//! the SIGQUIT watcher and the shutdown monitors run beside it, and neither
//! touches session state.

use crate::appliance::ApplianceRef;
use crate::collection::report_collection_diff;
use crate::config::SessionConfig;
use crate::hooks::SessionInfo;
use crate::process::Launcher;
use crate::registry::{AuditEvent, SlaveRegistry};
use crate::reporter::DistReporter;
use crate::scheduler::{AllocationSource, Scheduler};
use crate::terminal::markup;
use parallelizer_common::protocol::Markup;
use parallelizer_common::transport::{routed, split_routed, Multipart, Router};
use parallelizer_common::{
    endpoint_path, session_timestamp, Error, MasterReply, Phase, Result, TestId, TestReport,
    WorkerEvent, WorkerId, WorkerSettings,
};
use serde_json::Value;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Every collected test passed
pub const EXIT_OK: i32 = 0;
/// Some tests failed, errored or never ran
pub const EXIT_TESTS_FAILED: i32 = 1;
/// The session was aborted
pub const EXIT_INTERRUPTED: i32 = 2;
/// Nothing was collected
pub const EXIT_NO_TESTS: i32 = 5;

/// How a session ended
#[derive(Debug, Clone, PartialEq)]
pub struct SessionOutcome {
    pub exit_code: i32,
    pub collected: usize,
    /// Reason, when the session was aborted
    pub aborted: Option<String>,
}

fn markup_of(colors: &[&str]) -> Markup {
    colors.iter().map(|c| (c.to_string(), true)).collect()
}

/// Exit code from the terminal stats of a finished session
pub(crate) fn exit_code(
    reporter: &DistReporter,
    collected: usize,
    collect_only: bool,
    aborted: bool,
) -> i32 {
    let terminal = reporter.terminal();
    if aborted {
        EXIT_INTERRUPTED
    } else if collected == 0 {
        EXIT_NO_TESTS
    } else if collect_only {
        EXIT_OK
    } else if terminal.count("failed") + terminal.count("error") > 0
        || terminal.completed() < collected
    {
        EXIT_TESTS_FAILED
    } else {
        EXIT_OK
    }
}

/// Master of a distributed test session
pub struct ParallelSession {
    router: Router,
    registry: SlaveRegistry,
    scheduler: Scheduler,
    reporter: DistReporter,
    collection: Vec<TestId>,
    collect_only: bool,
    poll_interval: Duration,
    finished: Arc<AtomicBool>,
    /// The first `need_tests` has arrived
    distributing: bool,
}

impl ParallelSession {
    /// Bind the endpoint and register one worker per appliance.
    ///
    /// Workers are only started by [`ParallelSession::run`].
    pub async fn new(
        config: &SessionConfig,
        collection: Vec<TestId>,
        appliances: Vec<ApplianceRef>,
        launcher: Arc<dyn Launcher>,
        reporter: DistReporter,
    ) -> Result<Self> {
        let endpoint = endpoint_path(&config.transport.cache_dir, std::process::id());
        let router = Router::bind(&endpoint, config.transport.outbox_capacity).await?;
        info!("Master listening on {}", endpoint.display());

        let mut settings = WorkerSettings::new(&endpoint, config.runner.clone());
        settings.log_dir = Some(config.worker.log_dir.clone());
        settings.debug = tracing::enabled!(tracing::Level::DEBUG);

        let mut registry = SlaveRegistry::new(
            launcher,
            config.registry.clone(),
            settings,
            session_timestamp(),
        );
        let urls: Vec<String> = appliances.iter().map(|a| a.url().to_string()).collect();
        for appliance in appliances {
            registry.register(appliance);
        }

        let session = Self {
            router,
            registry,
            scheduler: Scheduler::new(collection.clone(), &config.scheduler),
            reporter,
            collect_only: config.runner.collect_only,
            poll_interval: config.transport.poll_interval(),
            finished: Arc::new(AtomicBool::new(false)),
            distributing: false,
            collection,
        };

        for id in session.registry.ids() {
            session.announce(&id);
        }
        session.reporter.hooks().parallel_configured(Some(&SessionInfo {
            endpoint: endpoint.clone(),
            appliances: urls,
            collected: session.collection.len(),
        }));

        Ok(session)
    }

    pub fn endpoint(&self) -> &Path {
        self.router.endpoint()
    }

    pub fn registry(&self) -> &SlaveRegistry {
        &self.registry
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn reporter(&self) -> &DistReporter {
        &self.reporter
    }

    /// Flag that ends the session at the next iteration, as SIGQUIT does
    pub fn finish_handle(&self) -> Arc<AtomicBool> {
        self.finished.clone()
    }

    fn print_message(&self, prefix: &str, message: &str, markup: &Markup) {
        self.reporter.terminal().print_message(prefix, message, markup);
    }

    fn watch_sigquit(&self) -> Result<JoinHandle<()>> {
        use tokio::signal::unix::{signal, SignalKind};

        let mut quit = signal(SignalKind::quit())?;
        let finished = self.finished.clone();
        Ok(tokio::spawn(async move {
            if quit.recv().await.is_some() {
                info!("Received SIGQUIT, finishing session");
                finished.store(true, Ordering::SeqCst);
            }
        }))
    }

    /// Run the distributed test loop until every worker is gone
    pub async fn run(&mut self) -> Result<SessionOutcome> {
        self.registry.spawn_all();
        self.print_message(
            "master",
            &format!("Waiting for {} slave collections", self.registry.len()),
            &markup("red"),
        );

        // Only tagged lines while the loop runs
        self.reporter.terminal_mut().suppress();
        let watcher = self.watch_sigquit()?;

        let result = self.dispatch_loop().await;

        watcher.abort();
        let unfinished = self.reporter.pending();
        if unfinished > 0 {
            warn!("{} tests never reported their teardown", unfinished);
        }
        self.kill_remaining();
        self.reporter.terminal_mut().restore();
        self.registry.join_monitors().await;

        let aborted = match result {
            Ok(()) => None,
            Err(Error::SessionAborted(reason)) => Some(reason),
            Err(e) => {
                error!("Exception in runtest loop: {}", e);
                self.print_message("master", &e.to_string(), &Markup::new());
                Some(e.to_string())
            }
        };

        let collected = self.collection.len();
        if self.collect_only && aborted.is_none() {
            self.reporter
                .terminal()
                .write_line(&format!("{} tests collected", collected), &markup("green"));
        } else {
            self.reporter.terminal().summary(collected, aborted.as_deref());
        }

        Ok(SessionOutcome {
            exit_code: exit_code(&self.reporter, collected, self.collect_only, aborted.is_some()),
            collected,
            aborted,
        })
    }

    async fn dispatch_loop(&mut self) -> Result<()> {
        loop {
            self.audit();

            if self.registry.ceiling_reached() {
                self.print_message(
                    "master",
                    "too many slave respawns, exiting",
                    &markup_of(&["red", "bold"]),
                );
                return Err(Error::SessionAborted(
                    "Interrupted due to slave failures".to_string(),
                ));
            }

            if self.registry.is_empty() {
                self.print_message("master", "all slaves have exited", &markup("yellow"));
                let pending = self.scheduler.pending();
                if pending > 0 {
                    return Err(Error::SessionAborted(format!(
                        "{} test groups left undispatched",
                        pending
                    )));
                }
                return Ok(());
            }

            if self.finished.load(Ordering::SeqCst) {
                self.print_message(
                    "master",
                    "QUIT signal received, finishing session",
                    &markup("yellow"),
                );
                return Err(Error::SessionAborted("Interrupted by SIGQUIT".to_string()));
            }

            let parts = match self.router.recv_timeout(self.poll_interval).await {
                Ok(Some(parts)) => parts,
                Ok(None) => continue,
                Err(e) => {
                    error!("Failed to receive from workers: {}", e);
                    continue;
                }
            };

            if let Err(e) = self.handle(parts).await {
                if e.is_fatal() {
                    return Err(e);
                }
                error!("Exception in runtest loop: {}", e);
            }
        }
    }

    fn audit(&mut self) {
        for event in self.registry.audit() {
            match event {
                AuditEvent::Exited {
                    id,
                    code,
                    redistributed,
                    respawned,
                } => {
                    warn!(
                        "{}",
                        Error::WorkerCrash {
                            worker: id.to_string(),
                            code
                        }
                    );
                    let mut message = if code == -9 {
                        format!("{} killed due to error", id)
                    } else {
                        format!("{} terminated unexpectedly with status {}", id, code)
                    };
                    if respawned.is_some() {
                        message.push_str(", respawning");
                    }
                    if !redistributed.is_empty() {
                        message.push_str(&format!(
                            " and redistributing {} tests",
                            redistributed.len()
                        ));
                    }
                    self.print_message("master", &message, &markup("purple"));
                    self.scheduler.requeue_failed(redistributed);
                    if let Some(new_id) = respawned {
                        self.announce(&new_id);
                    }
                }
                AuditEvent::Removed { id, url } => {
                    debug!("{} removed from the registry", id);
                    self.reporter.hooks().node_shutdown(&url);
                }
                AuditEvent::Deactivated { id } => {
                    self.print_message(
                        "master",
                        &format!("{}'s appliance has died, deactivating slave", id),
                        &Markup::new(),
                    );
                }
                AuditEvent::Stalled { id } => {
                    self.print_message(
                        "master",
                        &format!("{} stopped reading its messages, interrupting", id),
                        &markup("red"),
                    );
                }
            }
        }
    }

    fn reply(&mut self, id: &WorkerId, reply: MasterReply) {
        let payload = match reply.encode() {
            Ok(payload) => payload,
            Err(e) => {
                error!("Failed to encode reply to {}: {}", id, e);
                return;
            }
        };
        match self.router.send(routed(id, payload)) {
            Ok(()) => self.registry.clear_stalled(id),
            Err(Error::Saturated(_)) => {
                warn!("Outbox of {} is full", id);
                self.registry.mark_stalled(id);
            }
            Err(e) => warn!("Failed to reply to {}: {}", id, e),
        }
    }

    fn ack(&mut self, id: &WorkerId, event_name: &str) {
        self.reply(id, MasterReply::ack(event_name));
    }

    async fn handle(&mut self, parts: Multipart) -> Result<()> {
        let (id, payload) = split_routed(parts)?;
        let event = WorkerEvent::decode(&payload)?;
        if !self.registry.contains(&id) {
            error!("message from terminated worker {} {}", id, event.name());
            return Ok(());
        }
        debug!("{} from {}", event.name(), id);

        match event {
            WorkerEvent::Message { message, markup } => {
                self.print_message(id.as_str(), &message, &markup);
                self.ack(&id, "message");
            }
            WorkerEvent::CollectionFinish { node_ids } => {
                self.collection_finish(&id, &node_ids)?;
            }
            WorkerEvent::NeedTests => {
                if !self.distributing {
                    info!("starting master test distribution");
                    self.distributing = true;
                }
                self.send_tests(&id).await?;
            }
            WorkerEvent::RuntestLogstart { nodeid, location } => {
                self.ack(&id, "runtest_logstart");
                self.reporter.runtest_logstart(&id, &nodeid, &location);
            }
            WorkerEvent::RuntestLogreport { report } => {
                self.ack(&id, "runtest_logreport");
                let Some(report) = unserialize_report(report) else {
                    return Ok(());
                };
                if report.completes_test() {
                    self.registry.complete(&id, &report.nodeid)?;
                }
                self.reporter.runtest_logreport(&id, &report);
            }
            WorkerEvent::InternalError { message } => {
                self.ack(&id, "internalerror");
                self.print_message(id.as_str(), &message, &markup("purple"));
                self.respawn(&id)?;
            }
            WorkerEvent::Shutdown => {
                if let Some(record) = self.registry.get(&id) {
                    self.reporter.hooks().node_shutdown(record.appliance.url());
                }
                self.ack(&id, "shutdown");
                if let Some(record) = self.registry.deregister(&id) {
                    if !record.in_flight.is_empty() {
                        warn!(
                            "{} shut down with {} unreported tests",
                            id,
                            record.in_flight.len()
                        );
                        self.scheduler.requeue_failed(record.in_flight);
                    }
                }
            }
        }
        Ok(())
    }

    fn collection_finish(&mut self, id: &WorkerId, node_ids: &[TestId]) -> Result<()> {
        debug!("diffing {} collection", id);
        match report_collection_diff(id.as_str(), &self.collection, node_ids) {
            None => self.ack(id, "collectionfinish"),
            Some(diff) => {
                self.print_message(id.as_str(), "collection differs, respawning", &markup("purple"));
                self.print_message("master", &diff, &markup("purple"));
                let err = Error::CollectionDivergence {
                    worker: id.to_string(),
                    diff,
                };
                error!("{}", err);
                self.reply(id, MasterReply::Die);
                self.respawn(id)?;
            }
        }
        Ok(())
    }

    /// Kill a worker and put a fresh one on its appliance
    fn respawn(&mut self, id: &WorkerId) -> Result<()> {
        let new_id = self.registry.replace(id)?;
        self.announce(&new_id);
        Ok(())
    }

    fn announce(&self, id: &WorkerId) {
        if let Some(record) = self.registry.get(id) {
            self.print_message(
                id.as_str(),
                &format!("using appliance {}", record.appliance.url()),
                &markup("green"),
            );
        }
    }

    async fn send_tests(&mut self, id: &WorkerId) -> Result<()> {
        let allocation = self.scheduler.allocate(&mut self.registry, id).await?;

        if let AllocationSource::Reassigned {
            provider,
            cleanup_error,
            cleaned,
        } = &allocation.source
        {
            debug!("{} reassigned to {}", id, provider);
            if *cleaned {
                self.print_message(
                    id.as_str(),
                    "removing providers from appliance",
                    &markup("purple"),
                );
            }
            if let Some(e) = cleanup_error {
                self.print_message(
                    id.as_str(),
                    &format!("exception during provider removal: {}", e),
                    &markup("red"),
                );
            }
        }

        let count = allocation.tests.len();
        self.reply(id, MasterReply::Tests(allocation.tests));
        if count > 0 {
            let progress = self.scheduler.progress(count, id);
            self.print_message("master", &progress, &Markup::new());
        }
        Ok(())
    }

    fn kill_remaining(&mut self) {
        for id in self.registry.ids() {
            if let Err(e) = self.registry.kill(&id) {
                error!("Failed to kill {}: {}", id, e);
            }
        }
    }
}

/// Rebuild a report from its wire form.
///
/// A report that does not deserialize is replaced by a failed one for the
/// same test and phase, so the test is not silently lost.
fn unserialize_report(value: Value) -> Option<TestReport> {
    match serde_json::from_value::<TestReport>(value.clone()) {
        Ok(report) => Some(report),
        Err(e) => {
            let err = Error::ReportDeserialization(e.to_string());
            error!("{}", err);
            let nodeid = value.get("nodeid").and_then(Value::as_str)?;
            let when = value
                .get("when")
                .cloned()
                .and_then(|w| serde_json::from_value::<Phase>(w).ok())
                .unwrap_or(Phase::Call);
            Some(TestReport::worst_case(nodeid, when, err.to_string()))
        }
    }
}
