//! Parallelizer Worker
//!
//! A worker is bound to one appliance. It collects on its own, sends its
//! collection to the master for comparison, then keeps asking for tests and
//! streams every phase report back until the master has nothing left.
//! Every event waits for the master's reply before the next one is sent.

use async_trait::async_trait;
use parallelizer_common::transport::Dealer;
use parallelizer_common::{
    CollectedTest, Error, MasterReply, ReportSink, Result, TestId, TestReport, TestRunner,
    WorkerEvent, WorkerId,
};
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Time allowed for the master's router to accept us
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// How a worker run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    /// No more tests; shut down cleanly
    Finished,
    /// Stopped early on request, after a clean shutdown
    Quit,
    /// The master replied `die`
    Died,
}

/// Send one event and wait for its reply.
///
/// Acks that do not answer this event are duplicates and are skipped.
async fn send_event(dealer: &mut Dealer, event: &WorkerEvent) -> Result<MasterReply> {
    debug!("sending {}", event.name());
    dealer.send(event.encode()?).await?;

    loop {
        let reply = MasterReply::decode(&dealer.recv().await?)?;
        match (&reply, event) {
            (MasterReply::Die, _) => {
                info!("Slave instructed to die by master; shutting down");
                return Err(Error::Died);
            }
            (MasterReply::Ack(name), WorkerEvent::NeedTests) => {
                debug!("ignoring ack {} while waiting for tests", name);
            }
            (MasterReply::Ack(name), _) if name != event.name() => {
                debug!("ignoring ack {} while waiting for {}", name, event.name());
            }
            (MasterReply::Tests(_), WorkerEvent::NeedTests) | (MasterReply::Ack(_), _) => {
                debug!("received {:?} from master", reply);
                return Ok(reply);
            }
            (MasterReply::Tests(tests), _) => {
                warn!(
                    "ignoring {} tests sent in reply to {}",
                    tests.len(),
                    event.name()
                );
            }
        }
    }
}

/// Forwards phase reports to the master as they are produced
struct EventSink<'a> {
    dealer: &'a mut Dealer,
}

#[async_trait]
impl ReportSink for EventSink<'_> {
    async fn report(&mut self, report: TestReport) -> Result<()> {
        let event = WorkerEvent::RuntestLogreport {
            report: serde_json::to_value(&report)?,
        };
        send_event(self.dealer, &event).await?;
        Ok(())
    }
}

/// Drives one worker through the master protocol
pub struct WorkerManager {
    dealer: Dealer,
    runner: Box<dyn TestRunner>,
    collection: HashMap<TestId, CollectedTest>,
    quit: Arc<AtomicBool>,
    collect_only: bool,
}

impl WorkerManager {
    pub fn new(dealer: Dealer, runner: Box<dyn TestRunner>) -> Self {
        Self {
            dealer,
            runner,
            collection: HashMap::new(),
            quit: Arc::new(AtomicBool::new(false)),
            collect_only: false,
        }
    }

    /// Connect to the master's endpoint as `id`
    pub async fn connect(endpoint: &Path, id: WorkerId, runner: Box<dyn TestRunner>) -> Result<Self> {
        let dealer = Dealer::connect_timeout(endpoint, id, CONNECT_TIMEOUT).await?;
        Ok(Self::new(dealer, runner))
    }

    /// Report test ids as messages instead of running them
    pub fn with_collect_only(mut self, collect_only: bool) -> Self {
        self.collect_only = collect_only;
        self
    }

    pub fn id(&self) -> &WorkerId {
        self.dealer.identity()
    }

    /// Flag that stops the worker after the current test
    pub fn quit_handle(&self) -> Arc<AtomicBool> {
        self.quit.clone()
    }

    /// Share an externally owned quit flag
    pub fn with_quit_handle(mut self, quit: Arc<AtomicBool>) -> Self {
        self.quit = quit;
        self
    }

    fn quit_signaled(&self) -> bool {
        self.quit.load(Ordering::SeqCst)
    }

    async fn event(&mut self, event: WorkerEvent) -> Result<MasterReply> {
        send_event(&mut self.dealer, &event).await
    }

    /// Print a message on the master console
    pub async fn message(&mut self, message: impl Into<String>) -> Result<()> {
        self.event(WorkerEvent::Message {
            message: message.into(),
            markup: Default::default(),
        })
        .await?;
        Ok(())
    }

    async fn need_tests(&mut self) -> Result<Vec<CollectedTest>> {
        let ids = match self.event(WorkerEvent::NeedTests).await? {
            MasterReply::Tests(ids) => ids,
            other => {
                return Err(Error::Protocol(format!(
                    "expected tests, got {:?}",
                    other
                )))
            }
        };

        Ok(ids
            .into_iter()
            .map(|id| match self.collection.get(&id) {
                Some(test) => test.clone(),
                None => {
                    warn!("{} is not in the local collection", id);
                    CollectedTest::new(id)
                }
            })
            .collect())
    }

    async fn run_test(&mut self, test: &CollectedTest, next: Option<&CollectedTest>) -> Result<()> {
        if self.collect_only {
            return self.message(test.nodeid.clone()).await;
        }

        self.event(WorkerEvent::RuntestLogstart {
            nodeid: test.nodeid.clone(),
            location: test.location.clone(),
        })
        .await?;

        let mut sink = EventSink {
            dealer: &mut self.dealer,
        };
        self.runner.run(test, next, &mut sink).await
    }

    async fn collect(&mut self) -> Result<()> {
        let tests = self.runner.collect().await?;
        debug!("collection finished: {} tests", tests.len());
        let node_ids: Vec<TestId> = tests.iter().map(|t| t.nodeid.clone()).collect();
        self.collection = tests.into_iter().map(|t| (t.nodeid.clone(), t)).collect();
        self.event(WorkerEvent::CollectionFinish { node_ids }).await?;
        Ok(())
    }

    async fn runtest_loop(&mut self) -> Result<WorkerExit> {
        info!("entering runtest loop");
        let mut batch: VecDeque<CollectedTest> = self.need_tests().await?.into();

        while let Some(test) = batch.pop_front() {
            // Ask for the next batch before the last test so the master can
            // dispatch while we run it
            if batch.is_empty() && !self.quit_signaled() {
                batch.extend(self.need_tests().await?);
            }
            let next = batch.front().cloned();
            self.run_test(&test, next.as_ref()).await?;

            if self.quit_signaled() {
                self.message("shutting down after the current test due to QUIT signal")
                    .await?;
                return Ok(WorkerExit::Quit);
            }
        }
        Ok(WorkerExit::Finished)
    }

    async fn shutdown(&mut self) -> Result<()> {
        self.message("shutting down").await?;
        self.event(WorkerEvent::Shutdown).await?;
        Ok(())
    }

    async fn internal_error(&mut self, err: &Error) {
        let message = format!("INTERNALERROR> {}", err);
        error!("{}", message);
        // Only the last line goes to the console
        let short = message.lines().last().unwrap_or_default().to_string();
        if let Err(e) = self.event(WorkerEvent::InternalError { message: short }).await {
            warn!("Failed to report internal error: {}", e);
        }
    }

    async fn session(&mut self) -> Result<WorkerExit> {
        self.collect().await?;
        let exit = self.runtest_loop().await?;
        self.shutdown().await?;
        Ok(exit)
    }

    /// Run the whole worker protocol
    pub async fn run(mut self) -> Result<WorkerExit> {
        match self.session().await {
            Ok(exit) => Ok(exit),
            Err(Error::Died) => Ok(WorkerExit::Died),
            Err(e) => {
                self.internal_error(&e).await;
                Err(e)
            }
        }
    }
}

/// Stop the worker after the current test on SIGINT or SIGQUIT
pub fn install_signal_handlers(quit: Arc<AtomicBool>) -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    for (kind, name) in [(SignalKind::interrupt(), "SIGINT"), (SignalKind::quit(), "SIGQUIT")] {
        let mut stream = signal(kind)?;
        let quit = quit.clone();
        tokio::spawn(async move {
            while stream.recv().await.is_some() {
                info!("Received {}, stopping after the current test", name);
                quit.store(true, Ordering::SeqCst);
            }
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use parallelizer_common::transport::{routed, split_routed, Router};
    use parallelizer_common::{Outcome, Phase};

    struct FakeRunner {
        tests: Vec<&'static str>,
        fail_run: bool,
    }

    #[async_trait]
    impl TestRunner for FakeRunner {
        async fn collect(&mut self) -> Result<Vec<CollectedTest>> {
            Ok(self.tests.iter().map(|t| CollectedTest::new(*t)).collect())
        }

        async fn run(
            &mut self,
            test: &CollectedTest,
            _next: Option<&CollectedTest>,
            sink: &mut dyn ReportSink,
        ) -> Result<()> {
            if self.fail_run {
                return Err(Error::Runner("runner exploded".to_string()));
            }
            for when in [Phase::Setup, Phase::Call, Phase::Teardown] {
                sink.report(TestReport::new(test, when, Outcome::Passed)).await?;
            }
            Ok(())
        }
    }

    struct FakeMaster {
        router: Router,
        _dir: tempfile::TempDir,
    }

    impl FakeMaster {
        async fn new() -> (Self, std::path::PathBuf) {
            let dir = tempfile::tempdir().unwrap();
            let endpoint = dir.path().join("parallelize").join("1");
            let router = Router::bind(&endpoint, 16).await.unwrap();
            (Self { router, _dir: dir }, endpoint)
        }

        async fn expect(&mut self) -> (WorkerId, WorkerEvent) {
            let parts = self
                .router
                .recv_timeout(Duration::from_secs(5))
                .await
                .unwrap()
                .expect("worker event");
            let (peer, payload) = split_routed(parts).unwrap();
            (peer, WorkerEvent::decode(&payload).unwrap())
        }

        fn reply(&self, peer: &WorkerId, reply: MasterReply) {
            self.router
                .send(routed(peer, reply.encode().unwrap()))
                .unwrap();
        }

        /// Ack every event until `need_tests`, collecting their names
        async fn ack_until_need_tests(&mut self) -> (WorkerId, Vec<String>) {
            let mut seen = Vec::new();
            loop {
                let (peer, event) = self.expect().await;
                if event == WorkerEvent::NeedTests {
                    return (peer, seen);
                }
                seen.push(event.name().to_string());
                self.reply(&peer, MasterReply::ack(event.name()));
            }
        }
    }

    async fn worker(endpoint: &Path, runner: FakeRunner) -> WorkerManager {
        WorkerManager::connect(endpoint, WorkerId::new("slave00"), Box::new(runner))
            .await
            .unwrap()
    }

    fn runner(tests: Vec<&'static str>) -> FakeRunner {
        FakeRunner {
            tests,
            fail_run: false,
        }
    }

    #[tokio::test]
    async fn test_full_protocol_with_lookahead() {
        let (mut master, endpoint) = FakeMaster::new().await;
        let manager = worker(&endpoint, runner(vec!["a.py::t1", "a.py::t2"])).await;
        let handle = tokio::spawn(manager.run());

        let (peer, event) = master.expect().await;
        assert_eq!(
            event,
            WorkerEvent::CollectionFinish {
                node_ids: vec!["a.py::t1".into(), "a.py::t2".into()]
            }
        );
        master.reply(&peer, MasterReply::ack("collectionfinish"));

        let (peer, seen) = master.ack_until_need_tests().await;
        assert!(seen.is_empty());
        master.reply(&peer, MasterReply::Tests(vec!["a.py::t1".into(), "a.py::t2".into()]));

        // t1 runs fully, then need_tests is sent before t2
        let (peer, seen) = master.ack_until_need_tests().await;
        assert_eq!(
            seen,
            vec![
                "runtest_logstart",
                "runtest_logreport",
                "runtest_logreport",
                "runtest_logreport"
            ]
        );
        master.reply(&peer, MasterReply::Tests(vec![]));

        let mut names = Vec::new();
        loop {
            let (peer, event) = master.expect().await;
            names.push(event.name().to_string());
            master.reply(&peer, MasterReply::ack(event.name()));
            if event == WorkerEvent::Shutdown {
                break;
            }
        }
        assert_eq!(
            names,
            vec![
                "runtest_logstart",
                "runtest_logreport",
                "runtest_logreport",
                "runtest_logreport",
                "message",
                "shutdown"
            ]
        );
        assert_eq!(handle.await.unwrap().unwrap(), WorkerExit::Finished);
    }

    #[tokio::test]
    async fn test_die_on_collection_divergence() {
        let (mut master, endpoint) = FakeMaster::new().await;
        let manager = worker(&endpoint, runner(vec!["a.py::t1"])).await;
        let handle = tokio::spawn(manager.run());

        let (peer, _) = master.expect().await;
        master.reply(&peer, MasterReply::Die);
        assert_eq!(handle.await.unwrap().unwrap(), WorkerExit::Died);
    }

    #[tokio::test]
    async fn test_duplicate_acks_are_ignored() {
        let (mut master, endpoint) = FakeMaster::new().await;
        let manager = worker(&endpoint, runner(vec![])).await;
        let handle = tokio::spawn(manager.run());

        let (peer, _) = master.expect().await;
        master.reply(&peer, MasterReply::ack("collectionfinish"));
        let (peer, event) = master.expect().await;
        assert_eq!(event, WorkerEvent::NeedTests);
        // A stray ack arrives before the real answer
        master.reply(&peer, MasterReply::ack("collectionfinish"));
        master.reply(&peer, MasterReply::Tests(vec![]));

        let (_, seen) = async {
            let mut seen = Vec::new();
            loop {
                let (peer, event) = master.expect().await;
                seen.push(event.name().to_string());
                master.reply(&peer, MasterReply::ack(event.name()));
                if event == WorkerEvent::Shutdown {
                    return (peer, seen);
                }
            }
        }
        .await;
        assert_eq!(seen, vec!["message", "shutdown"]);
        assert_eq!(handle.await.unwrap().unwrap(), WorkerExit::Finished);
    }

    #[tokio::test]
    async fn test_quit_stops_after_current_test() {
        let (mut master, endpoint) = FakeMaster::new().await;
        let manager = worker(&endpoint, runner(vec!["a.py::t1", "a.py::t2"])).await;
        let quit = manager.quit_handle();
        let handle = tokio::spawn(manager.run());

        let (peer, _) = master.expect().await;
        master.reply(&peer, MasterReply::ack("collectionfinish"));
        let (peer, _) = master.expect().await;
        quit.store(true, Ordering::SeqCst);
        master.reply(&peer, MasterReply::Tests(vec!["a.py::t1".into(), "a.py::t2".into()]));

        let mut messages = Vec::new();
        loop {
            let (peer, event) = master.expect().await;
            assert_ne!(event, WorkerEvent::NeedTests);
            if let WorkerEvent::Message { message, .. } = &event {
                messages.push(message.clone());
            }
            master.reply(&peer, MasterReply::ack(event.name()));
            if event == WorkerEvent::Shutdown {
                break;
            }
        }
        assert_eq!(
            messages,
            vec![
                "shutting down after the current test due to QUIT signal",
                "shutting down"
            ]
        );
        assert_eq!(handle.await.unwrap().unwrap(), WorkerExit::Quit);
    }

    #[tokio::test]
    async fn test_runner_error_sends_internalerror() {
        let (mut master, endpoint) = FakeMaster::new().await;
        let manager = worker(
            &endpoint,
            FakeRunner {
                tests: vec!["a.py::t1"],
                fail_run: true,
            },
        )
        .await;
        let handle = tokio::spawn(manager.run());

        let (peer, _) = master.expect().await;
        master.reply(&peer, MasterReply::ack("collectionfinish"));
        let (peer, _) = master.expect().await;
        master.reply(&peer, MasterReply::Tests(vec!["a.py::t1".into()]));
        let (peer, _) = master.ack_until_need_tests().await;
        master.reply(&peer, MasterReply::Tests(vec![]));

        // logstart, then the failure
        let (peer, event) = master.expect().await;
        assert_eq!(event.name(), "runtest_logstart");
        master.reply(&peer, MasterReply::ack(event.name()));
        let (peer, event) = master.expect().await;
        match &event {
            WorkerEvent::InternalError { message } => {
                assert!(message.starts_with("INTERNALERROR> "));
                assert!(message.contains("runner exploded"));
            }
            other => panic!("unexpected event {:?}", other),
        }
        master.reply(&peer, MasterReply::ack("internalerror"));
        assert!(handle.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn test_collect_only_reports_ids() {
        let (mut master, endpoint) = FakeMaster::new().await;
        let manager = worker(&endpoint, runner(vec!["a.py::t1"]))
            .await
            .with_collect_only(true);
        let handle = tokio::spawn(manager.run());

        let (peer, _) = master.expect().await;
        master.reply(&peer, MasterReply::ack("collectionfinish"));
        let (peer, _) = master.expect().await;
        master.reply(&peer, MasterReply::Tests(vec!["a.py::t1".into()]));
        let (peer, _) = master.ack_until_need_tests().await;
        master.reply(&peer, MasterReply::Tests(vec![]));

        let (peer, event) = master.expect().await;
        assert_eq!(
            event,
            WorkerEvent::Message {
                message: "a.py::t1".to_string(),
                markup: Default::default()
            }
        );
        master.reply(&peer, MasterReply::ack("message"));
        let (peer, _) = master.expect().await;
        master.reply(&peer, MasterReply::ack("message"));
        let (peer, event) = master.expect().await;
        assert_eq!(event, WorkerEvent::Shutdown);
        master.reply(&peer, MasterReply::ack("shutdown"));
        assert_eq!(handle.await.unwrap().unwrap(), WorkerExit::Finished);
    }
}
