//! Distributed test reporter
//!
//! Bridges worker phase reports into the host hooks and the terminal
//! reporter while the dispatch loop owns the terminal. A test's final word
//! is only printed at teardown: a test that passes its call phase and fails
//! teardown must end up reported as an error.

use crate::hooks::SessionHooks;
use crate::terminal::{location_line, markup, word_markup, TerminalReporter};
use parallelizer_common::protocol::Markup;
use parallelizer_common::{Location, Phase, TestReport, WorkerId};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;

#[derive(Debug, Clone)]
struct CachedOutcome {
    word: String,
    markup: Markup,
}

/// Terminal reporter for distributed testing
pub struct DistReporter {
    hooks: Arc<dyn SessionHooks>,
    terminal: TerminalReporter,
    /// Latest printable outcome per displayed location
    outcomes: HashMap<String, CachedOutcome>,
}

impl DistReporter {
    pub fn new(hooks: Arc<dyn SessionHooks>, terminal: TerminalReporter) -> Self {
        Self {
            hooks,
            terminal,
            outcomes: HashMap::new(),
        }
    }

    pub fn hooks(&self) -> &Arc<dyn SessionHooks> {
        &self.hooks
    }

    pub fn terminal(&self) -> &TerminalReporter {
        &self.terminal
    }

    pub fn terminal_mut(&mut self) -> &mut TerminalReporter {
        &mut self.terminal
    }

    pub fn runtest_logstart(&mut self, worker: &WorkerId, nodeid: &str, location: &Location) {
        let test = location_line(nodeid, location);
        self.terminal.write_prefixed(
            worker.as_str(),
            &format!("{} running", test),
            &markup("blue"),
        );
        self.hooks.runtest_logstart(nodeid, location);
    }

    pub fn runtest_logreport(&mut self, worker: &WorkerId, report: &TestReport) {
        self.hooks.runtest_logreport(report);

        let status = self.hooks.report_teststatus(report);
        // Stash stats so the summary is right once the terminal is restored
        self.terminal.record(report, &status);

        let test = location_line(&report.nodeid, &report.location);
        if !status.word.is_empty() {
            self.outcomes.insert(
                test.clone(),
                CachedOutcome {
                    markup: word_markup(&status.word),
                    word: status.word,
                },
            );
        }

        if report.when == Phase::Teardown {
            match self.outcomes.remove(&test) {
                Some(outcome) => self.terminal.write_prefixed(
                    worker.as_str(),
                    &format!("{} {}", test, outcome.word),
                    &outcome.markup,
                ),
                None => warn!("No outcome recorded for {} at teardown", test),
            }
        }
    }

    /// Tests that reported a phase but not their teardown
    pub fn pending(&self) -> usize {
        self.outcomes.len()
    }
}
