//! Inactive session
//!
//! With fewer than two appliances there is nothing to distribute: the
//! master runs the collection itself, one test after the other, with the
//! terminal reporter printing normally.

use crate::hooks::SessionHooks;
use crate::reporter::DistReporter;
use crate::session::{exit_code, SessionOutcome};
use crate::terminal::markup;
use async_trait::async_trait;
use parallelizer_common::{CollectedTest, ReportSink, Result, TestReport, TestRunner};
use std::sync::Arc;
use tracing::{error, info};

/// Sends reports straight to the hooks and the terminal
struct LocalSink<'a> {
    hooks: Arc<dyn SessionHooks>,
    reporter: &'a mut DistReporter,
}

#[async_trait]
impl ReportSink for LocalSink<'_> {
    async fn report(&mut self, report: TestReport) -> Result<()> {
        self.hooks.runtest_logreport(&report);
        let status = self.hooks.report_teststatus(&report);
        self.reporter.terminal_mut().runtest_logreport(&report, &status);
        Ok(())
    }
}

/// Run `tests` in this process without workers
pub async fn run_local(
    runner: &mut dyn TestRunner,
    tests: Vec<CollectedTest>,
    reporter: &mut DistReporter,
    collect_only: bool,
) -> Result<SessionOutcome> {
    let hooks = reporter.hooks().clone();
    hooks.parallel_configured(None);
    info!("Running {} tests without workers", tests.len());

    let mut aborted = None;
    for (idx, test) in tests.iter().enumerate() {
        if collect_only {
            reporter.terminal().write_line(&test.nodeid, &Default::default());
            continue;
        }

        hooks.runtest_logstart(&test.nodeid, &test.location);
        let mut sink = LocalSink {
            hooks: hooks.clone(),
            reporter: &mut *reporter,
        };
        if let Err(e) = runner.run(test, tests.get(idx + 1), &mut sink).await {
            error!("Runner failed on {}: {}", test.nodeid, e);
            aborted = Some(format!("INTERNALERROR> {}", e));
            break;
        }
    }

    let collected = tests.len();
    if collect_only && aborted.is_none() {
        reporter.terminal().write_line(
            &format!("{} tests collected", collected),
            &markup("green"),
        );
    } else {
        reporter.terminal().summary(collected, aborted.as_deref());
    }

    Ok(SessionOutcome {
        exit_code: exit_code(reporter, collected, collect_only, aborted.is_some()),
        collected,
        aborted,
    })
}
