use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::Local;
use clap::Parser;
use log::{error, info, LevelFilter};
use log4rs::append::console::{ConsoleAppender, Target};
use log4rs::append::file::FileAppender;
use log4rs::config::{Appender, Config, Root};
use log4rs::encode::pattern::PatternEncoder;

use modelhost::config::load_config;
use modelhost::simulated::{SimulatedRunner, SimulatedSource};
use modelhost::types::{JobRequest, JobStatus};
use modelhost::ModelHost;

/// Run a batch of jobs against simulated models and report the outcome.
#[derive(Parser, Debug)]
#[command(name = "modelhost", version)]
struct Args {
    /// Host configuration (JSON). Defaults apply when the file is missing.
    #[arg(long, default_value = "modelhost.json")]
    config: PathBuf,

    /// JSON array of jobs: `[{"kind": {"operation": .., "model": ..}, "cost": ..}]`.
    #[arg(long)]
    jobs: PathBuf,

    /// Overrides `database_path` from the config.
    #[arg(long)]
    db_path: Option<String>,

    /// Overrides the starting credit balance.
    #[arg(long)]
    balance: Option<u64>,

    /// Simulated latency per load chunk and per operation.
    #[arg(long, default_value_t = 200)]
    latency_ms: u64,
}

fn setup_logging() -> Result<(), Box<dyn std::error::Error>> {
    let log_dir = "logs";
    std::fs::create_dir_all(log_dir)?;
    let timestamp = Local::now().format("%Y-%m-%d-%H_%M").to_string();
    let log_path = format!("{log_dir}/{timestamp}.log");

    let file_appender = FileAppender::builder()
        .encoder(Box::new(PatternEncoder::new(
            "{d(%Y-%m-%d %H:%M:%S)} - {l} - {m}{n}",
        )))
        .build(log_path)?;
    // stdout carries the report; log lines go to stderr.
    let console = ConsoleAppender::builder()
        .target(Target::Stderr)
        .encoder(Box::new(PatternEncoder::new("{l} [{t}] {m}{n}")))
        .build();

    let config = Config::builder()
        .appender(Appender::builder().build("file", Box::new(file_appender)))
        .appender(Appender::builder().build("console", Box::new(console)))
        .build(
            Root::builder()
                .appender("file")
                .appender("console")
                .build(LevelFilter::Info),
        )?;

    log4rs::init_config(config)?;

    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    if let Err(e) = setup_logging() {
        eprintln!("Failed to set up logging: {e}");
    }

    let mut config = load_config(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    if let Some(db_path) = args.db_path {
        config.database_path = db_path;
    }
    if let Some(balance) = args.balance {
        config.ledger.initial_balance = balance;
    }

    let jobs_json = std::fs::read_to_string(&args.jobs)
        .with_context(|| format!("reading {}", args.jobs.display()))?;
    let requests: Vec<JobRequest> = serde_json::from_str(&jobs_json)
        .with_context(|| format!("parsing {}", args.jobs.display()))?;

    let latency = Duration::from_millis(args.latency_ms);
    let host = ModelHost::open(
        &config,
        Arc::new(SimulatedSource::new(latency)),
        Arc::new(SimulatedRunner::new(latency)),
    )?;
    info!("Submitting {} jobs from {}", requests.len(), args.jobs.display());

    let mut submitted = Vec::new();
    for request in requests {
        let kind = request.kind.clone();
        match host.submit_job(request) {
            Ok(id) => submitted.push(id),
            Err(e) => {
                error!("Rejected {kind}: {e}");
                println!("rejected  {kind}: {e}");
            }
        }
    }

    let mut completed = 0;
    for id in &submitted {
        let Some(job) = host.wait_for_job(id).await else {
            continue;
        };
        if job.status == JobStatus::Completed {
            completed += 1;
        }
        match &job.error_message {
            Some(reason) => println!("{:<9} {} {}: {reason}", job.status.as_str(), job.id, job.kind),
            None => println!("{:<9} {} {}", job.status.as_str(), job.id, job.kind),
        }
    }

    println!(
        "{completed}/{} jobs completed, balance {}",
        submitted.len(),
        host.balance()
    );
    println!("{}", serde_json::to_string_pretty(&host.get_memory_status())?);

    Ok(())
}
