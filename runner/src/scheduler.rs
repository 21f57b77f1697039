pub mod dry_run;
pub mod slurm;

use crate::{
    command::CommandError,
    config::{ConfigErrors, RunnerConfig},
};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// raw value reported when the queue could not be observed
pub const QUERY_FAILED: i64 = -1;

#[derive(Debug, Error)]
#[error("Failed to submit {script:?}")]
pub struct SubmissionError {
    pub script: PathBuf,
    #[source]
    pub source: CommandError,
}

/// Number of jobs the user currently has in the scheduler queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueDepth {
    Observed(u64),
    Failed,
}

impl QueueDepth {
    pub fn as_raw(self) -> i64 {
        match self {
            Self::Observed(depth) => i64::try_from(depth).unwrap_or(i64::MAX),
            Self::Failed => QUERY_FAILED,
        }
    }

    /// a failed observation never admits work
    pub fn admits(self, capacity_threshold: u64) -> bool {
        matches!(self, Self::Observed(depth) if depth < capacity_threshold)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubmissionReceipt {
    /// scheduler job id, if it could be read from the submit output
    pub job_id: Option<String>,
}

/// The two scheduler operations the admission loop depends on
pub trait SchedulerClient {
    fn queue_depth(&self) -> QueueDepth;

    fn submit(&self, script: &Path) -> Result<SubmissionReceipt, SubmissionError>;
}

#[derive(Debug, Clone)]
pub enum Schedulers {
    Slurm(slurm::SlurmClient),
    DryRun(dry_run::DryRunClient),
}

impl Schedulers {
    pub fn load(config: &RunnerConfig, dry_run: bool) -> Result<Self, ConfigErrors> {
        if dry_run {
            Ok(Self::DryRun(dry_run::DryRunClient))
        } else {
            let user = config.scheduler.resolve_user()?;

            Ok(Self::Slurm(slurm::SlurmClient::new(&config.scheduler, user)))
        }
    }
}

impl SchedulerClient for Schedulers {
    fn queue_depth(&self) -> QueueDepth {
        match self {
            Self::Slurm(client) => client.queue_depth(),
            Self::DryRun(client) => client.queue_depth(),
        }
    }

    fn submit(&self, script: &Path) -> Result<SubmissionReceipt, SubmissionError> {
        match self {
            Self::Slurm(client) => client.submit(script),
            Self::DryRun(client) => client.submit(script),
        }
    }
}
