//! Test runner seam
//!
//! The parallelizer never runs tests itself. Master and workers drive a
//! [`TestRunner`]: collect node ids, then run one test at a time while
//! streaming per-phase reports into a [`ReportSink`].

use crate::types::{CollectedTest, Outcome, Phase, TestReport};
use crate::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::process::Stdio;
use std::time::Instant;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, trace, warn};

/// Exit status pytest uses when nothing was collected
const EXIT_NO_TESTS: i32 = 5;

/// Number of stderr lines kept as the failure representation
const LONGREPR_TAIL_LINES: usize = 40;

/// Receives phase reports as soon as they exist
#[async_trait]
pub trait ReportSink: Send {
    async fn report(&mut self, report: TestReport) -> Result<()>;
}

/// A test runner driven by the parallelizer
#[async_trait]
pub trait TestRunner: Send {
    /// Collect the ordered list of tests
    async fn collect(&mut self) -> Result<Vec<CollectedTest>>;

    /// Run one test through setup, call and teardown.
    ///
    /// `next` is the test that will run afterwards, if known.
    async fn run(
        &mut self,
        test: &CollectedTest,
        next: Option<&CollectedTest>,
        sink: &mut dyn ReportSink,
    ) -> Result<()>;
}

/// Options of the external runner, forwarded verbatim to workers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerOptions {
    /// Command printing one node id per line
    pub collect_command: Vec<String>,

    /// Command running a single node id, appended as last argument
    pub run_command: Vec<String>,

    /// Extra arguments appended to both commands
    pub args: Vec<String>,

    /// Report collected ids instead of running them
    pub collect_only: bool,

    /// Extra environment for both commands
    pub env: BTreeMap<String, String>,
}

impl Default for RunnerOptions {
    fn default() -> Self {
        Self {
            collect_command: vec![
                "pytest".to_string(),
                "--collect-only".to_string(),
                "-q".to_string(),
            ],
            run_command: vec![
                "pytest".to_string(),
                "-p".to_string(),
                "no:cacheprovider".to_string(),
            ],
            args: Vec::new(),
            collect_only: false,
            env: BTreeMap::new(),
        }
    }
}

/// Runner that shells out to an external test command
pub struct CommandRunner {
    options: RunnerOptions,
}

impl CommandRunner {
    pub fn new(options: RunnerOptions) -> Self {
        Self { options }
    }

    /// Add an environment variable for every spawned command
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.env.insert(key.into(), value.into());
        self
    }

    pub fn options(&self) -> &RunnerOptions {
        &self.options
    }

    fn command(&self, argv: &[String]) -> Result<Command> {
        let (program, rest) = argv
            .split_first()
            .ok_or_else(|| Error::InvalidConfig("empty runner command".to_string()))?;
        let mut cmd = Command::new(program);
        cmd.args(rest)
            .args(&self.options.args)
            .envs(&self.options.env)
            .stdin(Stdio::null());
        Ok(cmd)
    }
}

/// Parse `--collect-only -q` style output into node ids
pub fn parse_collection(stdout: &str) -> Vec<CollectedTest> {
    stdout
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && line.contains("::"))
        .map(CollectedTest::new)
        .collect()
}

fn tail(text: &str, lines: usize) -> String {
    let all: Vec<&str> = text.lines().collect();
    let start = all.len().saturating_sub(lines);
    all[start..].join("\n")
}

#[async_trait]
impl TestRunner for CommandRunner {
    async fn collect(&mut self) -> Result<Vec<CollectedTest>> {
        let output = self
            .command(&self.options.collect_command)?
            .output()
            .await
            .map_err(|e| Error::Runner(format!("Failed to run collection: {}", e)))?;

        let code = output.status.code();
        if !output.status.success() && code != Some(EXIT_NO_TESTS) {
            return Err(Error::Runner(format!(
                "collection exited with {:?}: {}",
                code,
                tail(&String::from_utf8_lossy(&output.stderr), LONGREPR_TAIL_LINES)
            )));
        }

        let tests = parse_collection(&String::from_utf8_lossy(&output.stdout));
        debug!("Collected {} tests", tests.len());
        Ok(tests)
    }

    async fn run(
        &mut self,
        test: &CollectedTest,
        _next: Option<&CollectedTest>,
        sink: &mut dyn ReportSink,
    ) -> Result<()> {
        let start = Instant::now();
        let mut child = self
            .command(&self.options.run_command)?
            .arg(&test.nodeid)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Error::Runner(format!("Failed to run {}: {}", test.nodeid, e)))?;

        // Drain stderr concurrently so a chatty test cannot fill the pipe
        let mut stderr = child
            .stderr
            .take()
            .ok_or_else(|| Error::Internal("stderr not captured".to_string()))?;
        let stderr_task = tokio::spawn(async move {
            let mut buf = String::new();
            let _ = stderr.read_to_string(&mut buf).await;
            buf
        });

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Internal("stdout not captured".to_string()))?;
        let mut lines = BufReader::new(stdout).lines();
        let mut captured = Vec::new();
        let mut streamed = 0usize;

        while let Some(line) = lines.next_line().await? {
            match serde_json::from_str::<TestReport>(&line) {
                Ok(report) => {
                    trace!("{} reported {} {:?}", report.nodeid, report.when, report.outcome);
                    streamed += 1;
                    sink.report(report).await?;
                }
                Err(_) => captured.push(line),
            }
        }

        let status = child.wait().await?;
        let stderr = stderr_task.await.unwrap_or_default();
        if streamed > 0 {
            return Ok(());
        }

        // The command did not stream reports; derive them from its status
        let duration = start.elapsed().as_secs_f64();
        let outcome = match status.code() {
            Some(0) => Outcome::Passed,
            Some(EXIT_NO_TESTS) => Outcome::Skipped,
            _ => Outcome::Failed,
        };
        if outcome == Outcome::Failed {
            warn!("{} exited with {:?}", test.nodeid, status.code());
        }

        sink.report(TestReport::new(test, Phase::Setup, Outcome::Passed))
            .await?;

        let mut call = TestReport::new(test, Phase::Call, outcome).with_duration(duration);
        match outcome {
            Outcome::Failed => {
                call.longrepr = Some(tail(&stderr, LONGREPR_TAIL_LINES));
            }
            Outcome::Skipped => {
                call.longrepr = Some(format!("{}: no tests ran", test.nodeid));
            }
            Outcome::Passed => {}
        }
        if !captured.is_empty() {
            call.sections
                .push(("Captured stdout call".to_string(), captured.join("\n")));
        }
        sink.report(call).await?;

        sink.report(TestReport::new(test, Phase::Teardown, Outcome::Passed))
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct VecSink(Vec<TestReport>);

    #[async_trait]
    impl ReportSink for VecSink {
        async fn report(&mut self, report: TestReport) -> Result<()> {
            self.0.push(report);
            Ok(())
        }
    }

    fn sh(script: &str) -> Vec<String> {
        vec!["sh".to_string(), "-c".to_string(), script.to_string()]
    }

    #[test]
    fn test_parse_collection_skips_summary_lines() {
        let out = "a.py::t1\na.py::t2[prov_a]\n\n2 tests collected in 0.01s\n";
        let tests = parse_collection(out);
        let ids: Vec<_> = tests.iter().map(|t| t.nodeid.as_str()).collect();
        assert_eq!(ids, vec!["a.py::t1", "a.py::t2[prov_a]"]);
    }

    #[test]
    fn test_tail_keeps_last_lines() {
        assert_eq!(tail("a\nb\nc\nd", 2), "c\nd");
        assert_eq!(tail("a", 5), "a");
    }

    #[tokio::test]
    async fn test_command_runner_collects() {
        let mut runner = CommandRunner::new(RunnerOptions {
            collect_command: sh("printf 'a.py::t1\\nb.py::t2\\n'"),
            ..Default::default()
        });
        let tests = runner.collect().await.unwrap();
        assert_eq!(tests.len(), 2);
        assert_eq!(tests[1].nodeid, "b.py::t2");
    }

    #[tokio::test]
    async fn test_command_runner_synthesizes_failure_reports() {
        let mut runner = CommandRunner::new(RunnerOptions {
            // The node id is appended as $0 of the script
            run_command: sh("echo boom >&2; exit 1"),
            ..Default::default()
        });
        let test = CollectedTest::new("a.py::t1");
        let mut sink = VecSink(Vec::new());
        runner.run(&test, None, &mut sink).await.unwrap();

        let phases: Vec<_> = sink.0.iter().map(|r| (r.when, r.outcome)).collect();
        assert_eq!(
            phases,
            vec![
                (Phase::Setup, Outcome::Passed),
                (Phase::Call, Outcome::Failed),
                (Phase::Teardown, Outcome::Passed),
            ]
        );
        assert_eq!(sink.0[1].longrepr.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn test_command_runner_forwards_streamed_reports() {
        let report = TestReport::new(
            &CollectedTest::new("a.py::t1"),
            Phase::Setup,
            Outcome::Skipped,
        );
        let line = serde_json::to_string(&report).unwrap();
        let mut runner = CommandRunner::new(RunnerOptions {
            run_command: sh(&format!("echo '{}'", line)),
            ..Default::default()
        });
        let mut sink = VecSink(Vec::new());
        runner
            .run(&CollectedTest::new("a.py::t1"), None, &mut sink)
            .await
            .unwrap();
        assert_eq!(sink.0, vec![report]);
    }
}
