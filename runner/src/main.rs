mod admission;
mod catalog;
mod command;
mod config;
mod ledger;
mod pipeline;
mod render;
mod scheduler;
mod shutdown;
mod template;

use clap::Parser;
use config::{ConfigErrors, RunnerConfig};
use pipeline::{RunError, RunOptions, RunSummary};
use std::{error::Error, path::PathBuf, process::ExitCode};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Render Slurm job scripts for every work item under a storage prefix and
/// submit them without letting the queue grow past a capacity threshold
#[derive(Parser, Debug)]
#[command(name = "floodbatch", version, about)]
struct Args {
    /// Path to the YAML run configuration
    #[arg(short, long, env = "FLOODBATCH_CONFIG")]
    config: PathBuf,

    /// Override the number of work items to process
    #[arg(long)]
    limit: Option<usize>,

    /// Render scripts without querying or submitting to the scheduler
    #[arg(long)]
    dry_run: bool,

    /// Skip work items the ledger already records as submitted
    #[arg(long)]
    resume: bool,

    /// Log filter, e.g. `info` or `floodbatch=debug`
    #[arg(long, env = "FLOODBATCH_LOG", default_value = "info")]
    log_level: String,
}

fn log_error_chain(error: &dyn Error) {
    error!("{error}");

    let mut source = error.source();
    while let Some(cause) = source {
        error!("  caused by: {cause}");
        source = cause.source();
    }
}

fn run(args: &Args) -> Result<RunSummary, RunError> {
    let mut config = RunnerConfig::load(&args.config)?;

    if let Some(limit) = args.limit {
        config.limit = limit;
    }

    if config.preflight_checks() {
        return Err(ConfigErrors::PreflightFailed.into());
    }

    let token = match shutdown::install_shutdown_handler() {
        Ok(token) => token,
        Err(e) => {
            // still usable, just not interruptible
            error!("Failed to install signal handlers: {e}");
            shutdown::CancellationToken::new()
        }
    };

    pipeline::run(
        &config,
        RunOptions {
            dry_run: args.dry_run,
            resume: args.resume,
        },
        token,
    )
}

fn main() -> ExitCode {
    let args = Args::parse();

    let filter = EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match run(&args) {
        Ok(summary) if summary.report.cancelled => {
            info!(
                "Stopped at job {}, rerun with --resume to continue",
                summary.report.next_index
            );

            ExitCode::from(130)
        }
        Ok(summary) if summary.has_failures() => ExitCode::from(2),
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => {
            log_error_chain(&e);

            ExitCode::FAILURE
        }
    }
}
