use super::{QueueDepth, SchedulerClient, SubmissionError, SubmissionReceipt};
use crate::{command::run_command, config::SchedulerConfig};
use std::{
    path::{Path, PathBuf},
    time::Duration,
};
use tracing::{debug, error, warn};

/// Queue queries through `squeue`, submissions through `sbatch`
#[derive(Debug, Clone)]
pub struct SlurmClient {
    query: PathBuf,
    submit: PathBuf,
    user: String,
    timeout: Duration,
}

impl SlurmClient {
    pub fn new(config: &SchedulerConfig, user: String) -> Self {
        Self {
            query: config.query.clone(),
            submit: config.submit.clone(),
            user,
            timeout: config.command_timeout(),
        }
    }
}

/// one non-empty line per job, `squeue -h` prints no header
pub fn count_jobs(output: &str) -> u64 {
    output.lines().filter(|line| !line.trim().is_empty()).count() as u64
}

/// job id from `Submitted batch job <id>`
pub fn parse_job_id(output: &str) -> Option<String> {
    output
        .lines()
        .map(str::trim)
        .find(|line| line.to_lowercase().starts_with("submitted batch job"))
        .and_then(|line| line.split_whitespace().nth(3))
        .map(str::to_owned)
}

impl SchedulerClient for SlurmClient {
    fn queue_depth(&self) -> QueueDepth {
        match run_command(&self.query, &["-u", self.user.as_str(), "-h"], self.timeout) {
            Ok(output) => {
                let depth = count_jobs(&output.stdout);
                debug!(user = %self.user, depth = depth, "Observed queue depth");

                QueueDepth::Observed(depth)
            }
            Err(e) => {
                error!(user = %self.user, "Error executing squeue: {e}");

                QueueDepth::Failed
            }
        }
    }

    fn submit(&self, script: &Path) -> Result<SubmissionReceipt, SubmissionError> {
        let output = run_command(&self.submit, &[script.as_os_str()], self.timeout).map_err(
            |source| SubmissionError {
                script: script.to_path_buf(),
                source,
            },
        )?;
        let job_id = parse_job_id(&output.stdout);

        if job_id.is_none() {
            warn!(
                script = ?script,
                stdout = output.stdout.trim(),
                "sbatch succeeded but printed no job id"
            );
        }

        Ok(SubmissionReceipt { job_id })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::CommandError;
    use std::{fs, os::unix::fs::PermissionsExt};

    // stand-in for a scheduler binary
    fn fake_command(directory: &Path, name: &str, body: &str) -> PathBuf {
        let path = directory.join(name);
        fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();

        path
    }

    fn client(query: PathBuf, submit: PathBuf) -> SlurmClient {
        SlurmClient {
            query,
            submit,
            user: String::from("hydro"),
            timeout: Duration::from_secs(10),
        }
    }

    #[test]
    fn counts_non_empty_lines() {
        assert_eq!(count_jobs(""), 0);
        assert_eq!(count_jobs("\n"), 0);
        assert_eq!(count_jobs("  \n \n"), 0);
        assert_eq!(count_jobs("101 compute basin_1 hydro R 0:01 1 node1\n"), 1);
        assert_eq!(
            count_jobs("101 compute a hydro R\n102 compute b hydro PD\n\n103 compute c hydro PD"),
            3
        );
    }

    #[test]
    fn parses_sbatch_output() {
        assert_eq!(
            parse_job_id("Submitted batch job 4242\n"),
            Some(String::from("4242"))
        );
        assert_eq!(
            parse_job_id("sbatch: warning: memory limit\nSubmitted batch job 17"),
            Some(String::from("17"))
        );
        assert_eq!(parse_job_id(""), None);
        assert_eq!(parse_job_id("4242;cluster"), None);
    }

    #[test]
    fn queue_depth_from_squeue() {
        let directory = tempfile::tempdir().unwrap();
        // echo the arguments back so they can be checked as the first "job"
        let query = fake_command(
            directory.path(),
            "squeue",
            "echo \"$@\"\necho '102 compute b hydro PD'\necho",
        );
        let client = client(query, PathBuf::from("sbatch"));

        assert_eq!(client.queue_depth(), QueueDepth::Observed(2));
    }

    #[test]
    fn empty_queue_is_zero() {
        let directory = tempfile::tempdir().unwrap();
        let query = fake_command(directory.path(), "squeue", "exit 0");

        assert_eq!(
            client(query, PathBuf::from("sbatch")).queue_depth(),
            QueueDepth::Observed(0)
        );
    }

    #[test]
    fn failing_squeue_is_failed_depth() {
        let directory = tempfile::tempdir().unwrap();
        let query = fake_command(
            directory.path(),
            "squeue",
            "echo 'slurm_load_jobs error: Socket timed out' >&2\nexit 1",
        );

        assert_eq!(
            client(query, PathBuf::from("sbatch")).queue_depth(),
            QueueDepth::Failed
        );
        assert_eq!(
            client(PathBuf::from("/nonexistent/squeue"), PathBuf::from("sbatch")).queue_depth(),
            QueueDepth::Failed
        );
    }

    #[test]
    fn submit_returns_job_id() {
        let directory = tempfile::tempdir().unwrap();
        let submit = fake_command(
            directory.path(),
            "sbatch",
            "test -f \"$1\" || exit 2\necho 'Submitted batch job 900'",
        );
        let script = directory.path().join("slurm_runner_a.sh");
        fs::write(&script, "#!/bin/bash\n").unwrap();

        let receipt = client(PathBuf::from("squeue"), submit)
            .submit(&script)
            .unwrap();

        assert_eq!(receipt.job_id, Some(String::from("900")));
    }

    #[test]
    fn failed_submit_carries_stderr() {
        let directory = tempfile::tempdir().unwrap();
        let submit = fake_command(
            directory.path(),
            "sbatch",
            "echo 'sbatch: error: invalid partition specified: compute' >&2\nexit 1",
        );
        let script = directory.path().join("slurm_runner_a.sh");

        let error = client(PathBuf::from("squeue"), submit)
            .submit(&script)
            .unwrap_err();

        assert_eq!(error.script, script);
        match error.source {
            CommandError::Failed { code, stderr, .. } => {
                assert_eq!(code, Some(1));
                assert_eq!(stderr, "sbatch: error: invalid partition specified: compute");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
