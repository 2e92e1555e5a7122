//! Host reporting hooks
//!
//! The session calls into [`SessionHooks`] at the same points pytest fires
//! its hooks: once when the parallel decision is made, for every forwarded
//! log start and phase report, and whenever a worker node goes away.

use parallelizer_common::{Location, Phase, TestId, TestReport};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::info;

/// Description of an active parallel session
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    /// IPC endpoint workers connect to
    pub endpoint: PathBuf,
    /// Appliance urls, one per worker
    pub appliances: Vec<String>,
    /// Number of tests in the master collection
    pub collected: usize,
}

/// Classification of one phase report
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestStatus {
    /// Stats bucket, empty when the phase is not counted
    pub category: String,
    pub letter: String,
    /// Status word printed next to the test, empty when nothing is printed
    pub word: String,
}

impl TestStatus {
    pub fn new(category: &str, letter: &str, word: &str) -> Self {
        Self {
            category: category.to_string(),
            letter: letter.to_string(),
            word: word.to_string(),
        }
    }

    pub fn silent() -> Self {
        Self::new("", "", "")
    }
}

/// Default pytest outcome classification
pub fn classify(report: &TestReport) -> TestStatus {
    if report.wasxfail.is_some() {
        if report.skipped() {
            return TestStatus::new("xfailed", "x", "xfail");
        }
        if report.passed() && report.when == Phase::Call {
            return TestStatus::new("xpassed", "X", "XPASS");
        }
    }

    if report.passed() {
        if report.when == Phase::Call {
            TestStatus::new("passed", ".", "PASSED")
        } else {
            TestStatus::silent()
        }
    } else if report.failed() {
        if report.when == Phase::Call {
            TestStatus::new("failed", "F", "FAILED")
        } else {
            TestStatus::new("error", "E", "ERROR")
        }
    } else {
        TestStatus::new("skipped", "s", "SKIPPED")
    }
}

/// Hook points the session fires into the host runner
pub trait SessionHooks: Send + Sync {
    /// Fired exactly once; `None` when the session runs without workers
    fn parallel_configured(&self, _session: Option<&SessionInfo>) {}

    fn runtest_logstart(&self, _nodeid: &str, _location: &Location) {}

    fn runtest_logreport(&self, _report: &TestReport) {}

    fn report_teststatus(&self, report: &TestReport) -> TestStatus {
        classify(report)
    }

    /// A worker node shut down or was removed; `nodeinfo` is its appliance url
    fn node_shutdown(&self, _nodeinfo: &str) {}
}

/// Hooks that do nothing beyond the default classification
#[derive(Debug, Default)]
pub struct NoopHooks;

impl SessionHooks for NoopHooks {}

/// Final result of one test
#[derive(Debug, Clone, Serialize)]
pub struct TestResult {
    pub nodeid: TestId,
    pub outcome: String,
    pub duration: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub longrepr: Option<String>,
}

/// Results file contents
#[derive(Debug, Clone, Default, Serialize)]
pub struct ResultsSummary {
    pub parallel: bool,
    pub appliances: Vec<String>,
    pub tests: Vec<TestResult>,
    pub counts: BTreeMap<String, usize>,
    pub shutdown_nodes: Vec<String>,
}

#[derive(Default)]
struct ResultsState {
    summary: ResultsSummary,
    /// Index into `summary.tests` by node id
    index: BTreeMap<TestId, usize>,
}

/// Hooks recording every outcome for a JSON results file
#[derive(Default)]
pub struct ResultsLog {
    state: Mutex<ResultsState>,
}

impl ResultsLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn summary(&self) -> ResultsSummary {
        self.state.lock().summary.clone()
    }

    /// Write the results as pretty JSON
    pub fn write_results(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(&self.summary())?;
        std::fs::write(path, json)?;

        info!("Results written to: {}", path.display());
        Ok(())
    }
}

impl SessionHooks for ResultsLog {
    fn parallel_configured(&self, session: Option<&SessionInfo>) {
        let mut state = self.state.lock();
        state.summary.parallel = session.is_some();
        if let Some(session) = session {
            state.summary.appliances = session.appliances.clone();
        }
    }

    fn runtest_logreport(&self, report: &TestReport) {
        let status = self.report_teststatus(report);
        if status.category.is_empty() {
            return;
        }

        let mut state = self.state.lock();
        *state
            .summary
            .counts
            .entry(status.category.clone())
            .or_insert(0) += 1;

        let result = TestResult {
            nodeid: report.nodeid.clone(),
            outcome: status.category,
            duration: report.duration,
            longrepr: report.longrepr.clone(),
        };

        // A later failing phase overrides an earlier passing one
        match state.index.get(&report.nodeid).copied() {
            Some(i) => {
                if report.failed() || state.summary.tests[i].outcome == "passed" {
                    state.summary.tests[i] = result;
                }
            }
            None => {
                let i = state.summary.tests.len();
                state.index.insert(report.nodeid.clone(), i);
                state.summary.tests.push(result);
            }
        }
    }

    fn node_shutdown(&self, nodeinfo: &str) {
        self.state
            .lock()
            .summary
            .shutdown_nodes
            .push(nodeinfo.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parallelizer_common::{CollectedTest, Outcome};

    fn report(when: Phase, outcome: Outcome) -> TestReport {
        TestReport::new(&CollectedTest::new("a.py::t1"), when, outcome)
    }

    #[test]
    fn test_classify_call_outcomes() {
        assert_eq!(classify(&report(Phase::Call, Outcome::Passed)).word, "PASSED");
        assert_eq!(classify(&report(Phase::Call, Outcome::Failed)).word, "FAILED");
        assert_eq!(classify(&report(Phase::Call, Outcome::Skipped)).word, "SKIPPED");
    }

    #[test]
    fn test_classify_setup_and_teardown() {
        assert_eq!(classify(&report(Phase::Setup, Outcome::Passed)), TestStatus::silent());
        assert_eq!(classify(&report(Phase::Teardown, Outcome::Passed)).word, "");
        let error = classify(&report(Phase::Teardown, Outcome::Failed));
        assert_eq!(error.category, "error");
        assert_eq!(error.word, "ERROR");
        assert_eq!(classify(&report(Phase::Setup, Outcome::Skipped)).word, "SKIPPED");
    }

    #[test]
    fn test_classify_expected_failures() {
        let mut xfail = report(Phase::Call, Outcome::Skipped);
        xfail.wasxfail = Some("known bug".to_string());
        assert_eq!(classify(&xfail).word, "xfail");

        let mut xpass = report(Phase::Call, Outcome::Passed);
        xpass.wasxfail = Some(String::new());
        assert_eq!(classify(&xpass), TestStatus::new("xpassed", "X", "XPASS"));
    }

    #[test]
    fn test_results_log_keeps_worst_outcome() {
        let log = ResultsLog::new();
        log.runtest_logreport(&report(Phase::Setup, Outcome::Passed));
        log.runtest_logreport(&report(Phase::Call, Outcome::Passed));
        log.runtest_logreport(&report(Phase::Teardown, Outcome::Failed));

        let summary = log.summary();
        assert_eq!(summary.tests.len(), 1);
        assert_eq!(summary.tests[0].outcome, "error");
        assert_eq!(summary.counts.get("passed"), Some(&1));
        assert_eq!(summary.counts.get("error"), Some(&1));
    }

    #[test]
    fn test_results_log_writes_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out").join("results.json");
        let log = ResultsLog::new();
        log.parallel_configured(None);
        log.node_shutdown("https://10.0.0.1");
        log.write_results(&path).unwrap();

        let value: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(value["parallel"], false);
        assert_eq!(value["shutdown_nodes"][0], "https://10.0.0.1");
    }
}
