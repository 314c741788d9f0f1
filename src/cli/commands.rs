//! CLI command definitions for jobforge.
//!
//! `run` drives a scheduler with the simulated handler end to end;
//! `config` prints the effective configuration.

use crate::handlers::SimulatedHandler;
use crate::metrics::{export_metrics, init_metrics};
use crate::scheduler::{JobManager, JobResult, JobSpec, JobType, SchedulerConfig, SchedulerStats};
use clap::Parser;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Default number of jobs submitted by `jobforge run`.
const DEFAULT_JOB_COUNT: usize = 10;

/// Default job type submitted by `jobforge run`.
const DEFAULT_JOB_TYPE: &str = "quality_scoring";

/// Asynchronous job scheduler with a dynamically sized worker pool.
#[derive(Parser)]
#[command(name = "jobforge")]
#[command(about = "Run jobs across a dynamically sized pool of isolated workers")]
#[command(version)]
#[command(
    long_about = "jobforge schedules long-running jobs across a bounded worker pool with per-job timeouts, retries with priority demotion and graceful shutdown.\n\nExample usage:\n  jobforge run --jobs 20 --job-type quality_scoring --min-workers 2 --max-workers 4"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Submit a batch of simulated jobs and wait for all of them.
    Run(RunArgs),

    /// Print the effective scheduler configuration.
    Config(ConfigArgs),
}

/// Arguments for `jobforge run`.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Number of jobs to submit.
    #[arg(short = 'n', long, default_value_t = DEFAULT_JOB_COUNT)]
    pub jobs: usize,

    /// Job type (session_processing, batch_validation, quality_scoring,
    /// context_enhancement, training_generation).
    #[arg(short = 't', long, default_value = DEFAULT_JOB_TYPE, value_parser = parse_job_type)]
    pub job_type: JobType,

    /// Priority for every job (lower = more urgent).
    #[arg(short = 'p', long)]
    pub priority: Option<u32>,

    /// Override the minimum pool size.
    #[arg(long)]
    pub min_workers: Option<usize>,

    /// Override the maximum pool size.
    #[arg(long)]
    pub max_workers: Option<usize>,

    /// Simulated processing time per attempt in milliseconds.
    #[arg(long, default_value = "100")]
    pub latency_ms: u64,

    /// Fail every N-th attempt (0 disables injected failures).
    #[arg(long, default_value = "0")]
    pub fail_every: u64,

    /// Per-attempt timeout in milliseconds (defaults to the configuration).
    #[arg(long)]
    pub timeout_ms: Option<u64>,

    /// How long to wait for all jobs, in seconds.
    #[arg(long, default_value = "300")]
    pub await_timeout_secs: u64,

    /// YAML configuration file.
    #[arg(short = 'c', long, env = "JOBFORGE_CONFIG")]
    pub config: Option<String>,

    /// Print Prometheus metrics after the run.
    #[arg(long)]
    pub metrics: bool,

    /// Output JSON summary.
    #[arg(short = 'j', long)]
    pub json: bool,
}

/// Arguments for `jobforge config`.
#[derive(Parser, Debug)]
pub struct ConfigArgs {
    /// YAML configuration file.
    #[arg(short = 'c', long, env = "JOBFORGE_CONFIG")]
    pub config: Option<String>,
}

fn parse_job_type(value: &str) -> Result<JobType, String> {
    value.parse::<JobType>().map_err(|e| e.to_string())
}

/// Parse CLI arguments.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
///
/// For more control over logging initialization, use `parse_cli()` and `run_with_cli()`.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Run(args) => run_jobs_command(args).await?,
        Commands::Config(args) => run_config_command(args)?,
    }
    Ok(())
}

/// Resolves configuration: defaults < YAML file < `JOBFORGE_*` environment.
fn load_config(path: Option<&str>) -> anyhow::Result<SchedulerConfig> {
    let mut config = match path {
        Some(path) => SchedulerConfig::from_yaml_file(path)
            .map_err(|e| anyhow::anyhow!("Failed to load config from {}: {}", path, e))?,
        None => SchedulerConfig::default(),
    };
    config.apply_env()?;
    config.validate()?;
    Ok(config)
}

fn run_config_command(args: ConfigArgs) -> anyhow::Result<()> {
    let config = load_config(args.config.as_deref())?;
    let json_output = serde_json::to_string_pretty(&config)
        .map_err(|e| anyhow::anyhow!("Failed to serialize config JSON: {}", e))?;
    println!("{}", json_output);
    Ok(())
}

#[derive(Debug, Serialize)]
struct RunOutput {
    submitted: usize,
    rejected: usize,
    succeeded: usize,
    failed: usize,
    stats: SchedulerStats,
    results: Vec<JobResult>,
}

async fn run_jobs_command(args: RunArgs) -> anyhow::Result<()> {
    if args.metrics {
        init_metrics().map_err(|e| anyhow::anyhow!("Failed to initialize metrics: {}", e))?;
    }

    let mut config = load_config(args.config.as_deref())?;
    if let Some(min) = args.min_workers {
        config.min_workers = min;
    }
    if let Some(max) = args.max_workers {
        config.max_workers = max;
    }

    let handler = Arc::new(
        SimulatedHandler::new(Duration::from_millis(args.latency_ms))
            .with_fail_every(args.fail_every),
    );
    let manager = JobManager::start(config, handler).await?;

    let specs: Vec<JobSpec> = (0..args.jobs)
        .map(|index| {
            let mut spec = JobSpec::new(args.job_type, serde_json::json!({ "echo": index }));
            spec.priority = args.priority;
            spec.timeout_ms = args.timeout_ms;
            spec
        })
        .collect();

    info!(jobs = specs.len(), job_type = %args.job_type, "Submitting jobs");

    let mut job_ids = Vec::with_capacity(specs.len());
    let mut rejected = 0usize;
    for outcome in manager.enqueue_batch(specs).await {
        match outcome {
            Ok(job_id) => job_ids.push(job_id),
            Err(e) => {
                warn!(error = %e, "Job rejected");
                rejected += 1;
            }
        }
    }

    let awaited = manager
        .await_jobs(&job_ids, Duration::from_secs(args.await_timeout_secs))
        .await;
    let stats = manager.get_stats().await?;
    manager.shutdown().await;
    let results = awaited?;

    let succeeded = results.iter().filter(|r| r.is_success()).count();
    let output = RunOutput {
        submitted: job_ids.len(),
        rejected,
        succeeded,
        failed: results.len() - succeeded,
        stats,
        results,
    };

    if args.json {
        let json_output = serde_json::to_string_pretty(&output)
            .map_err(|e| anyhow::anyhow!("Failed to serialize run JSON: {}", e))?;
        println!("{}", json_output);
    } else {
        println!("✓ jobforge run completed");
        println!("  Submitted:      {}", output.submitted);
        println!("  Rejected:       {}", output.rejected);
        println!("  Succeeded:      {}", output.succeeded);
        println!("  Failed:         {}", output.failed);
        println!("  Retried:        {}", output.stats.retried_jobs);
        println!(
            "  Avg time:       {:.1}ms",
            output.stats.average_processing_time_ms
        );
        for result in output.results.iter().filter(|r| !r.is_success()) {
            println!(
                "    {} failed after {} attempt(s): {}",
                result.job_id,
                result.attempts,
                result.error.as_deref().unwrap_or("unknown error")
            );
        }
    }

    if args.metrics {
        print!("{}", export_metrics());
    }

    Ok(())
}
