use crate::{
    admission::{AdmissionController, AdmissionError, AdmissionReport, Backoff},
    catalog::{select_work, Catalog, CatalogError, WorkDescriptor},
    config::{ConfigErrors, RenderErrorPolicy, RunnerConfig},
    ledger::{Ledger, LedgerError},
    render::{RenderError, RenderedJob, Renderer},
    scheduler::{SchedulerClient, Schedulers},
    shutdown::{CancellableSleep, CancellationToken},
};
use std::collections::BTreeSet;
use thiserror::Error;
use tracing::{error, info, warn};

#[derive(Debug, Error)]
pub enum RunError {
    #[error(transparent)]
    Config(#[from] ConfigErrors),
    #[error(transparent)]
    Catalog(#[from] CatalogError),
    #[error(transparent)]
    Render(#[from] RenderError),
    #[error(transparent)]
    Admission(#[from] AdmissionError),
    #[error("Submission ledger is unavailable")]
    Ledger(#[from] LedgerError),
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RunOptions {
    /// render scripts but never call the scheduler, nothing is recorded
    pub dry_run: bool,
    /// skip work items the ledger already records as submitted
    pub resume: bool,
}

#[derive(Debug, Default)]
pub struct RunSummary {
    pub cataloged: usize,
    pub selected: usize,
    pub render_failures: Vec<String>,
    // work items whose submission outcome is missing from the ledger
    pub ledger_failures: Vec<String>,
    pub report: AdmissionReport,
}

impl RunSummary {
    /// true if any work item failed to render, submit or reach the ledger
    pub fn has_failures(&self) -> bool {
        !self.render_failures.is_empty()
            || !self.report.failed.is_empty()
            || !self.ledger_failures.is_empty()
    }
}

/// Render every descriptor, skipping or aborting on failures as configured
pub fn render_all(
    renderer: &Renderer,
    descriptors: &[WorkDescriptor],
    policy: RenderErrorPolicy,
) -> Result<(Vec<RenderedJob>, Vec<String>), RenderError> {
    let mut jobs = Vec::with_capacity(descriptors.len());
    let mut failures = Vec::new();

    for descriptor in descriptors {
        match renderer.render(descriptor) {
            Ok(job) => jobs.push(job),
            Err(e) => match policy {
                RenderErrorPolicy::Skip => {
                    error!(name = %descriptor.name, "Skipping work item: {e}: {}", source_chain(&e));
                    failures.push(descriptor.name.clone());
                }
                RenderErrorPolicy::Abort => return Err(e),
            },
        }
    }

    Ok((jobs, failures))
}

fn source_chain(error: &dyn std::error::Error) -> String {
    let mut causes = Vec::new();
    let mut current = error.source();

    while let Some(cause) = current {
        causes.push(cause.to_string());
        current = cause.source();
    }

    causes.join(": ")
}

/// Catalog, render and submit with the given scheduler and backoff
pub fn submit_all<S, B>(
    config: &RunnerConfig,
    options: RunOptions,
    catalog: &Catalog,
    scheduler: &S,
    backoff: B,
    ledger: Option<&Ledger>,
) -> Result<RunSummary, RunError>
where
    S: SchedulerClient,
    B: Backoff,
{
    info!("Creating batch objects from {}", catalog.prefix());
    let descriptors = catalog.list_work()?;
    let cataloged = descriptors.len();

    let exclude = match (options.resume, ledger) {
        (true, Some(ledger)) => ledger.submitted_names()?,
        (true, None) => {
            warn!("Resume requested without a ledger, nothing is skipped");
            BTreeSet::new()
        }
        (false, _) => BTreeSet::new(),
    };
    let include = config.include_matcher()?;
    let selected = select_work(descriptors, include.as_ref(), &exclude, config.limit);

    info!("Creating slurm_runner.sh files for {} work items", selected.len());
    let renderer = Renderer::load(config)?;
    let (jobs, render_failures) = render_all(&renderer, &selected, config.render.on_error)?;

    let mut ledger_failures = Vec::new();
    let mut controller = AdmissionController::new(&config.admission, scheduler, backoff);
    let report = controller.run(&jobs, |job, result| {
        if let Some(ledger) = ledger {
            if let Err(e) = ledger.record(job, result) {
                error!(name = %job.name, "Failed to record submission in the ledger: {e}: {}", source_chain(&e));
                ledger_failures.push(job.name.clone());
            }
        }
    })?;

    let summary = RunSummary {
        cataloged,
        selected: selected.len(),
        render_failures,
        ledger_failures,
        report,
    };

    info!(
        cataloged = summary.cataloged,
        selected = summary.selected,
        rendered = jobs.len(),
        render_failures = summary.render_failures.len(),
        submitted = summary.report.submitted.len(),
        failed = summary.report.failed.len(),
        unrecorded = summary.ledger_failures.len(),
        polls = summary.report.polls,
        backoffs = summary.report.backoffs,
        "Job submission finished"
    );
    for failure in &summary.report.failed {
        warn!(
            name = %failure.name,
            script = ?failure.script_path,
            "Not submitted: {}",
            failure.error.source
        );
    }

    if !summary.ledger_failures.is_empty() {
        error!(
            "Outcome of {} work items is missing from the ledger, check the scheduler before resuming: {}",
            summary.ledger_failures.len(),
            summary.ledger_failures.join(", ")
        );
    }

    if let Some(ledger) = ledger {
        match ledger.failed_names() {
            Ok(failures) if !failures.is_empty() => warn!(
                "{} work items have no successful submission in the ledger, rerun with --resume to retry them",
                failures.len()
            ),
            Ok(_) => {}
            Err(e) => error!("Failed to read failures from the ledger: {e}"),
        }
    }

    Ok(summary)
}

/// Run against the configured storage and scheduler
pub fn run(
    config: &RunnerConfig,
    options: RunOptions,
    token: CancellationToken,
) -> Result<RunSummary, RunError> {
    let catalog = Catalog::load(config);
    let scheduler = Schedulers::load(config, options.dry_run)?;
    let ledger = if options.dry_run {
        None
    } else {
        Some(Ledger::open(&config.ledger.path)?)
    };

    submit_all(
        config,
        options,
        &catalog,
        &scheduler,
        CancellableSleep::new(token),
        ledger.as_ref(),
    )
}
