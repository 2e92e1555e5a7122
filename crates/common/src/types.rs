//! Core types shared by master and workers

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Node identifier of a single test, as produced by collection
pub type TestId = String;

/// Provider identifier matched against parametrize ids
pub type ProviderTag = String;

/// Stable identity of a worker process
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(String);

impl WorkerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }

    /// Parse an identity received on the wire
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        std::str::from_utf8(bytes).ok().map(Self::new)
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Monotonic source of `slaveNN` identities. Identities are never reused.
#[derive(Debug, Default)]
pub struct WorkerIdGenerator {
    next: AtomicUsize,
}

impl WorkerIdGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_id(&self) -> WorkerId {
        let n = self.next.fetch_add(1, Ordering::Relaxed);
        WorkerId(format!("slave{:02}", n))
    }
}

/// Test location: file path, optional line number, display name
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location(pub String, pub Option<u32>, pub String);

impl Location {
    /// Derive a location from a node id when the runner gives nothing better
    pub fn from_nodeid(nodeid: &str) -> Self {
        match nodeid.split_once("::") {
            Some((path, name)) => Location(path.to_string(), None, name.to_string()),
            None => Location(nodeid.to_string(), None, nodeid.to_string()),
        }
    }

    pub fn path(&self) -> &str {
        &self.0
    }

    pub fn domain(&self) -> &str {
        &self.2
    }
}

/// A collected test as seen by a runner
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectedTest {
    pub nodeid: TestId,
    pub location: Location,
}

impl CollectedTest {
    pub fn new(nodeid: impl Into<TestId>) -> Self {
        let nodeid = nodeid.into();
        let location = Location::from_nodeid(&nodeid);
        Self { nodeid, location }
    }
}

/// Test lifecycle phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Setup,
    Call,
    Teardown,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Phase::Setup => "setup",
            Phase::Call => "call",
            Phase::Teardown => "teardown",
        };
        f.write_str(s)
    }
}

/// Outcome of one phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Passed,
    Failed,
    Skipped,
}

/// Per-phase test report.
///
/// This is the full wire form; no runner-internal objects cross the socket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestReport {
    pub nodeid: TestId,
    pub location: Location,
    pub when: Phase,
    pub outcome: Outcome,
    #[serde(default)]
    pub longrepr: Option<String>,
    #[serde(default)]
    pub duration: f64,
    #[serde(default)]
    pub keywords: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub sections: Vec<(String, String)>,
    /// Reason of an expected failure, present for xfail/xpass results
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wasxfail: Option<String>,
}

impl TestReport {
    pub fn new(test: &CollectedTest, when: Phase, outcome: Outcome) -> Self {
        Self {
            nodeid: test.nodeid.clone(),
            location: test.location.clone(),
            when,
            outcome,
            longrepr: None,
            duration: 0.0,
            keywords: BTreeMap::new(),
            sections: Vec::new(),
            wasxfail: None,
        }
    }

    pub fn with_longrepr(mut self, longrepr: impl Into<String>) -> Self {
        self.longrepr = Some(longrepr.into());
        self
    }

    pub fn with_duration(mut self, duration: f64) -> Self {
        self.duration = duration;
        self
    }

    /// Report used when the real one could not be reconstructed
    pub fn worst_case(nodeid: &str, when: Phase, reason: impl Into<String>) -> Self {
        let test = CollectedTest::new(nodeid);
        Self::new(&test, when, Outcome::Failed).with_longrepr(reason)
    }

    /// Whether this report completes the test from the master's point of view
    pub fn completes_test(&self) -> bool {
        matches!(self.when, Phase::Call | Phase::Teardown)
    }

    pub fn passed(&self) -> bool {
        self.outcome == Outcome::Passed
    }

    pub fn failed(&self) -> bool {
        self.outcome == Outcome::Failed
    }

    pub fn skipped(&self) -> bool {
        self.outcome == Outcome::Skipped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_ids_are_monotonic() {
        let gen = WorkerIdGenerator::new();
        assert_eq!(gen.next_id().as_str(), "slave00");
        assert_eq!(gen.next_id().as_str(), "slave01");
        assert_eq!(gen.next_id().as_str(), "slave02");
    }

    #[test]
    fn test_location_from_nodeid() {
        let loc = Location::from_nodeid("cfme/tests/test_a.py::test_one[prov-5.0]");
        assert_eq!(loc.path(), "cfme/tests/test_a.py");
        assert_eq!(loc.domain(), "test_one[prov-5.0]");
        assert_eq!(loc.1, None);
    }

    #[test]
    fn test_report_serialization_keeps_fields() {
        let test = CollectedTest::new("a.py::t1");
        let mut report = TestReport::new(&test, Phase::Call, Outcome::Failed)
            .with_longrepr("AssertionError")
            .with_duration(1.25);
        report
            .keywords
            .insert("t1".to_string(), serde_json::json!(1));
        report
            .sections
            .push(("Captured stdout call".to_string(), "hi".to_string()));

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["when"], "call");
        assert_eq!(json["outcome"], "failed");
        assert_eq!(json["location"], serde_json::json!(["a.py", null, "t1"]));
        assert!(json.get("wasxfail").is_none());

        let back: TestReport = serde_json::from_value(json).unwrap();
        assert_eq!(back, report);
    }

    #[test]
    fn test_only_call_and_teardown_complete_a_test() {
        let test = CollectedTest::new("a.py::t1");
        assert!(!TestReport::new(&test, Phase::Setup, Outcome::Skipped).completes_test());
        assert!(TestReport::new(&test, Phase::Call, Outcome::Passed).completes_test());
        assert!(TestReport::new(&test, Phase::Teardown, Outcome::Passed).completes_test());
    }
}
