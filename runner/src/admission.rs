//! Queue-depth aware pacing of job submissions
//!
//! Jobs are submitted in fixed-size chunks, each chunk only after a queue poll
//! observed fewer jobs than the capacity threshold. Otherwise the controller
//! backs off for a fixed interval and polls again. A failed poll counts as a
//! full queue. The queue can overshoot the threshold by at most `chunk_size - 1`
//! jobs between two polls.
//!
//! There is no deadline: a queue stuck above the threshold keeps the loop
//! backing off until it drains or the run is cancelled.

use crate::{
    config::{AdmissionConfig, SubmitErrorPolicy},
    render::RenderedJob,
    scheduler::{QueueDepth, SchedulerClient, SubmissionError, SubmissionReceipt},
};
use std::{cmp::min, path::PathBuf, time::Duration};
use thiserror::Error;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Elapsed,
    Cancelled,
}

/// How the controller waits between polls of a saturated queue
pub trait Backoff {
    fn wait(&mut self, interval: Duration) -> WaitOutcome;

    fn is_cancelled(&self) -> bool;
}

#[derive(Debug, Error)]
pub enum AdmissionError {
    #[error("Submission of {name} failed, aborting after {submitted} submitted jobs")]
    Aborted {
        name: String,
        submitted: usize,
        #[source]
        source: SubmissionError,
    },
}

/// Cursor over the rendered jobs, only ever moves forward
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AdmissionState {
    next_index: usize,
}

impl AdmissionState {
    pub fn next_index(&self) -> usize {
        self.next_index
    }

    pub fn is_done(&self, total: usize) -> bool {
        self.next_index >= total
    }

    /// bounds of the next chunk, the last one may be shorter
    fn chunk(&self, chunk_size: usize, total: usize) -> (usize, usize) {
        (self.next_index, min(self.next_index + chunk_size, total))
    }

    fn advance_to(&mut self, index: usize) {
        debug_assert!(index >= self.next_index);
        self.next_index = index;
    }
}

#[derive(Debug)]
pub struct FailedSubmission {
    pub name: String,
    pub script_path: PathBuf,
    pub error: SubmissionError,
}

#[derive(Debug, Default)]
pub struct AdmissionReport {
    pub polls: usize,
    pub backoffs: usize,
    /// cursor position after every admitted chunk
    pub progress: Vec<usize>,
    pub submitted: Vec<(String, SubmissionReceipt)>,
    pub failed: Vec<FailedSubmission>,
    pub next_index: usize,
    pub cancelled: bool,
}

pub struct AdmissionController<'a, S, B> {
    scheduler: &'a S,
    backoff: B,
    chunk_size: usize,
    capacity_threshold: u64,
    interval: Duration,
    on_submit_error: SubmitErrorPolicy,
}

impl<'a, S: SchedulerClient, B: Backoff> AdmissionController<'a, S, B> {
    pub fn new(config: &AdmissionConfig, scheduler: &'a S, backoff: B) -> Self {
        Self {
            scheduler,
            backoff,
            // a zero chunk would never make progress
            chunk_size: config.chunk_size.max(1),
            capacity_threshold: config.capacity_threshold,
            interval: config.backoff_interval(),
            on_submit_error: config.on_submit_error,
        }
    }

    /// Submit every job, pacing against the observed queue depth
    ///
    /// `on_result` sees every submission attempt as it happens.
    pub fn run<F>(
        &mut self,
        jobs: &[RenderedJob],
        mut on_result: F,
    ) -> Result<AdmissionReport, AdmissionError>
    where
        F: FnMut(&RenderedJob, &Result<SubmissionReceipt, SubmissionError>),
    {
        let mut state = AdmissionState::default();
        let mut report = AdmissionReport::default();

        info!(
            "Job submission started: {} jobs, chunks of {}, threshold {}",
            jobs.len(),
            self.chunk_size,
            self.capacity_threshold
        );

        while !state.is_done(jobs.len()) {
            if self.backoff.is_cancelled() {
                report.cancelled = true;
                break;
            }

            let depth = self.scheduler.queue_depth();
            report.polls += 1;

            if depth.admits(self.capacity_threshold) {
                let (start, end) = state.chunk(self.chunk_size, jobs.len());
                info!(
                    depth = depth.as_raw(),
                    "Green light! Submitting jobs {start}..{end} of {}",
                    jobs.len()
                );

                for job in &jobs[start..end] {
                    let result = self.scheduler.submit(&job.script_path);
                    on_result(job, &result);

                    match result {
                        Ok(receipt) => {
                            debug!(name = %job.name, job_id = ?receipt.job_id, "Submitted");
                            report.submitted.push((job.name.clone(), receipt));
                        }
                        Err(error) => {
                            error!(
                                name = %job.name,
                                script = ?job.script_path,
                                "Submission failed: {}",
                                error.source
                            );

                            if self.on_submit_error == SubmitErrorPolicy::Abort {
                                return Err(AdmissionError::Aborted {
                                    name: job.name.clone(),
                                    submitted: report.submitted.len(),
                                    source: error,
                                });
                            }

                            report.failed.push(FailedSubmission {
                                name: job.name.clone(),
                                script_path: job.script_path.clone(),
                                error,
                            });
                        }
                    }
                }

                state.advance_to(end);
                report.progress.push(state.next_index());
            } else {
                match depth {
                    QueueDepth::Failed => warn!(
                        "Queue depth is unknown. Sleeping for {:?}",
                        self.interval
                    ),
                    QueueDepth::Observed(observed) => info!(
                        depth = observed,
                        "The queue is too crowded. Sleeping for {:?}", self.interval
                    ),
                }

                report.backoffs += 1;
                if self.backoff.wait(self.interval) == WaitOutcome::Cancelled {
                    report.cancelled = true;
                    break;
                }
            }
        }

        report.next_index = state.next_index();
        if report.cancelled {
            warn!(
                "Submission cancelled with {} of {} jobs dispatched",
                report.next_index,
                jobs.len()
            );
        }

        Ok(report)
    }
}
