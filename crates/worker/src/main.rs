//! Parallelizer Worker
//!
//! Started by the master, one process per appliance.

use anyhow::Context;
use clap::Parser;
use parallelizer_common::{
    CommandRunner, WorkerId, WorkerSettings, ENV_APPLIANCE_URL, ENV_SESSION_TS, ENV_WORKER_ID,
};
use parallelizer_worker::{install_signal_handlers, WorkerExit, WorkerManager};
use serde_json::Value;
use std::fs::File;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "parallelizer-worker")]
#[command(about = "Parallelizer worker - runs dispatched tests against one appliance")]
#[command(version)]
struct Cli {
    /// Worker id assigned by the master
    #[arg(long)]
    worker: String,

    /// Appliance descriptor as JSON
    #[arg(long)]
    appliance: String,

    /// Session timestamp shared with the master
    #[arg(long)]
    ts: String,

    /// Worker settings as JSON
    #[arg(long)]
    config: String,
}

fn init_logging(id: &WorkerId, settings: &WorkerSettings) -> anyhow::Result<()> {
    let filter = if settings.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    match &settings.log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let path = dir.join(format!("{}.log", id));
            let file = File::create(&path)
                .with_context(|| format!("Failed to create log file {}", path.display()))?;
            tracing_subscriber::registry()
                .with(fmt::layer().with_ansi(false).with_writer(Arc::new(file)))
                .with(filter)
                .init();
        }
        None => {
            tracing_subscriber::registry()
                .with(fmt::layer().with_writer(std::io::stderr))
                .with(filter)
                .init();
        }
    }
    Ok(())
}

fn appliance_url(descriptor: &Value) -> String {
    descriptor
        .get("url")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

async fn run(cli: Cli) -> anyhow::Result<WorkerExit> {
    let id = WorkerId::new(cli.worker);
    let settings = WorkerSettings::from_json(&cli.config)?;
    let appliance: Value =
        serde_json::from_str(&cli.appliance).context("Invalid appliance descriptor")?;

    init_logging(&id, &settings)?;
    let url = appliance_url(&appliance);
    info!("Worker {} v{} starting against {}", id, parallelizer_common::VERSION, url);

    let runner = CommandRunner::new(settings.runner.clone())
        .with_env(ENV_WORKER_ID, id.as_str())
        .with_env(ENV_APPLIANCE_URL, url)
        .with_env(ENV_SESSION_TS, cli.ts);

    let manager = WorkerManager::connect(&settings.endpoint, id, Box::new(runner))
        .await?
        .with_collect_only(settings.runner.collect_only);
    install_signal_handlers(manager.quit_handle())?;

    let exit = manager.run().await?;
    info!("Worker finished: {:?}", exit);
    Ok(exit)
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(_) => std::process::exit(0),
        Err(e) => {
            error!("Worker failed: {:#}", e);
            eprintln!("parallelizer-worker: {:#}", e);
            std::process::exit(1);
        }
    }
}
