//! Parallelizer
//!
//! Collects the test suite once and runs it across every configured
//! appliance, one worker process each.

use anyhow::Context;
use clap::Parser;
use parallelizer_common::{CommandRunner, TestRunner};
use parallelizer_master::config::ApplianceConfig;
use parallelizer_master::{
    appliance, run_local, CommandLauncher, DistReporter, ParallelSession, ResultsLog,
    SessionConfig, SessionOutcome, TerminalReporter,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "parallelizer")]
#[command(about = "Parallelizer - distributes a test suite across appliances")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "parallelizer.toml")]
    config: PathBuf,

    /// Appliance URL, one worker each (repeatable)
    #[arg(short, long = "appliance")]
    appliances: Vec<String>,

    /// Known provider tag (repeatable)
    #[arg(long = "provider-tag")]
    provider_tags: Vec<String>,

    /// Write JSON results to this file
    #[arg(short, long)]
    results: Option<PathBuf>,

    /// Only report the collected test ids
    #[arg(long)]
    collect_only: bool,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Extra arguments for the test runner
    #[arg(last = true)]
    runner_args: Vec<String>,
}

fn load_config(cli: &Cli) -> anyhow::Result<SessionConfig> {
    let mut config = SessionConfig::load(&cli.config)
        .with_context(|| format!("Failed to load {}", cli.config.display()))?;

    config
        .appliances
        .extend(cli.appliances.iter().map(ApplianceConfig::from_url));
    for tag in &cli.provider_tags {
        if !config.scheduler.provider_tags.contains(tag) {
            config.scheduler.provider_tags.push(tag.clone());
        }
    }
    config.runner.args.extend(cli.runner_args.iter().cloned());
    config.runner.collect_only |= cli.collect_only;

    config.validate()?;
    Ok(config)
}

async fn run(cli: Cli) -> anyhow::Result<i32> {
    let config = load_config(&cli)?;
    let results = Arc::new(ResultsLog::new());
    let mut reporter = DistReporter::new(results.clone(), TerminalReporter::stdout());

    let mut runner = CommandRunner::new(config.runner.clone());
    let tests = runner.collect().await.context("Master collection failed")?;
    info!("Collected {} tests", tests.len());

    let appliances = appliance::from_config(&config.appliances);
    let outcome: SessionOutcome = if appliances.len() > 1 {
        let launcher = Arc::new(CommandLauncher::new(config.worker_binary()));
        let collection = tests.into_iter().map(|t| t.nodeid).collect();
        let mut session =
            ParallelSession::new(&config, collection, appliances, launcher, reporter).await?;
        session.run().await?
    } else {
        run_local(&mut runner, tests, &mut reporter, config.runner.collect_only).await?
    };

    if let Some(path) = &cli.results {
        results.write_results(path)?;
    }
    if let Some(reason) = &outcome.aborted {
        info!("Session aborted: {}", reason);
    }
    Ok(outcome.exit_code)
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    info!("Parallelizer v{}", env!("CARGO_PKG_VERSION"));

    match run(cli).await {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            tracing::error!("{:#}", e);
            std::process::exit(3);
        }
    }
}
