//! Host terminal reporter
//!
//! Prints operator-facing status lines. Every live line carries the
//! originating node (`master` or a worker id) and a timestamp. While the
//! dispatch loop runs the reporter is suppressed: its own per-test output is
//! off and only tagged lines written by the dist reporter appear, but stats
//! are still stashed so the final summary is complete.

use crate::hooks::TestStatus;
use colored::Colorize;
use parallelizer_common::protocol::Markup;
use parallelizer_common::{Location, TestId, TestReport};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::io::Write;
use std::sync::Arc;
use std::time::Instant;

/// Order in which stats categories are summarized
const SUMMARY_ORDER: &[&str] = &["failed", "passed", "skipped", "xfailed", "xpassed", "error"];

/// Markup for a single colour
pub fn markup(color: &str) -> Markup {
    let mut m = Markup::new();
    m.insert(color.to_string(), true);
    m
}

/// Markup used for a status word
pub fn word_markup(word: &str) -> Markup {
    match word {
        "PASSED" | "xfail" => markup("green"),
        "ERROR" | "FAILED" | "XPASS" => markup("red"),
        "" => Markup::new(),
        _ => markup("yellow"),
    }
}

fn paint(text: &str, markup: &Markup) -> String {
    let mut out = text.normal();
    for (key, enabled) in markup {
        if !enabled {
            continue;
        }
        out = match key.as_str() {
            "red" => out.red(),
            "green" => out.green(),
            "yellow" => out.yellow(),
            "blue" => out.blue(),
            "cyan" => out.cyan(),
            "magenta" | "purple" => out.magenta(),
            "white" => out.white(),
            "bold" => out.bold(),
            "light" => out.dimmed(),
            _ => out,
        };
    }
    out.to_string()
}

/// Display form of a test location
pub fn location_line(nodeid: &str, location: &Location) -> String {
    if nodeid.ends_with(location.domain()) {
        nodeid.to_string()
    } else {
        format!("{} <- {}", nodeid, location.path())
    }
}

/// Terminal reporter of the host runner
pub struct TerminalReporter {
    out: Mutex<Box<dyn Write + Send>>,
    colored: bool,
    suppressed: bool,
    stats: BTreeMap<String, Vec<TestId>>,
    completed: BTreeSet<TestId>,
    started: Instant,
}

impl TerminalReporter {
    /// Reporter writing to stdout
    pub fn stdout() -> Self {
        Self::with_writer(Box::new(std::io::stdout()), true)
    }

    pub fn with_writer(out: Box<dyn Write + Send>, colored: bool) -> Self {
        Self {
            out: Mutex::new(out),
            colored,
            suppressed: false,
            stats: BTreeMap::new(),
            completed: BTreeSet::new(),
            started: Instant::now(),
        }
    }

    pub fn write_line(&self, line: &str, markup: &Markup) {
        let line = if self.colored {
            paint(line, markup)
        } else {
            line.to_string()
        };
        let mut out = self.out.lock();
        // The terminal going away must not take the session down
        let _ = writeln!(out, "{}", line);
        let _ = out.flush();
    }

    /// Write `message` behind a `(prefix)[timestamp] ` tag
    pub fn write_prefixed(&self, prefix: &str, message: &str, markup: &Markup) {
        let stamp = chrono::Local::now().format("%Y%m%d %H:%M:%S");
        self.write_line(&format!("({})[{}] {}", prefix, stamp, message), markup);
    }

    /// Print a message from `master` or a worker.
    ///
    /// Without markup, master lines are blue and worker lines cyan.
    pub fn print_message(&self, prefix: &str, message: &str, markup: &Markup) {
        let markup = if !markup.is_empty() {
            markup.clone()
        } else if prefix == "master" {
            self::markup("blue")
        } else {
            self::markup("cyan")
        };
        self.write_prefixed(prefix, message, &markup);
    }

    /// Turn off the reporter's own per-test output
    pub fn suppress(&mut self) {
        self.suppressed = true;
    }

    pub fn restore(&mut self) {
        self.suppressed = false;
    }

    pub fn is_suppressed(&self) -> bool {
        self.suppressed
    }

    /// Stash a classified report in the stats
    pub fn record(&mut self, report: &TestReport, status: &TestStatus) {
        if status.category.is_empty() {
            return;
        }
        self.stats
            .entry(status.category.clone())
            .or_default()
            .push(report.nodeid.clone());
        self.completed.insert(report.nodeid.clone());
    }

    /// Normal per-report handling, used when no dist reporter is active
    pub fn runtest_logreport(&mut self, report: &TestReport, status: &TestStatus) {
        if self.suppressed {
            return;
        }
        self.record(report, status);
        if !status.word.is_empty() {
            let line = format!(
                "{} {}",
                location_line(&report.nodeid, &report.location),
                status.word
            );
            self.write_line(&line, &word_markup(&status.word));
        }
    }

    pub fn stats(&self) -> &BTreeMap<String, Vec<TestId>> {
        &self.stats
    }

    pub fn count(&self, category: &str) -> usize {
        self.stats.get(category).map_or(0, Vec::len)
    }

    /// Tests that reached a counted outcome
    pub fn completed(&self) -> usize {
        self.completed.len()
    }

    /// Final summary; tests that never reported are counted as not run
    pub fn summary(&self, collected: usize, aborted: Option<&str>) {
        if let Some(reason) = aborted {
            self.write_line(&format!("!!! {} !!!", reason), &markup("red"));
        }

        let failures: Vec<&TestId> = ["failed", "error"]
            .iter()
            .filter_map(|c| self.stats.get(*c))
            .flatten()
            .collect();
        if !failures.is_empty() {
            self.write_line("short test summary info", &markup("bold"));
            for category in ["failed", "error"] {
                for nodeid in self.stats.get(category).into_iter().flatten() {
                    let word = if category == "failed" { "FAILED" } else { "ERROR" };
                    self.write_line(&format!("{} {}", word, nodeid), &markup("red"));
                }
            }
        }

        let mut parts: Vec<String> = SUMMARY_ORDER
            .iter()
            .filter(|c| self.count(c) > 0)
            .map(|c| format!("{} {}", self.count(c), c))
            .collect();
        for (category, ids) in &self.stats {
            if !SUMMARY_ORDER.contains(&category.as_str()) {
                parts.push(format!("{} {}", ids.len(), category));
            }
        }
        let not_run = collected.saturating_sub(self.completed());
        if not_run > 0 {
            parts.push(format!("{} not run", not_run));
        }
        if parts.is_empty() {
            parts.push("no tests ran".to_string());
        }

        let color = if failures.is_empty() && aborted.is_none() && not_run == 0 {
            "green"
        } else if failures.is_empty() && aborted.is_none() {
            "yellow"
        } else {
            "red"
        };
        self.write_line(
            &format!(
                "== {} in {:.2}s ==",
                parts.join(", "),
                self.started.elapsed().as_secs_f64()
            ),
            &markup(color),
        );
    }
}

/// Writer sharing its buffer, for capturing terminal output
#[derive(Clone, Default)]
pub struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

impl SharedBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock()).into_owned()
    }
}

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}
