use super::{QueueDepth, SchedulerClient, SubmissionError, SubmissionReceipt};
use std::path::Path;
use tracing::info;

/// Reports an empty queue and accepts every script without running anything
#[derive(Debug, Clone, Copy, Default)]
pub struct DryRunClient;

impl SchedulerClient for DryRunClient {
    fn queue_depth(&self) -> QueueDepth {
        QueueDepth::Observed(0)
    }

    fn submit(&self, script: &Path) -> Result<SubmissionReceipt, SubmissionError> {
        info!(script = ?script, "Dry run, skipping sbatch");

        Ok(SubmissionReceipt::default())
    }
}
