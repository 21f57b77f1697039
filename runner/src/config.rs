use crate::{
    render::PLACEHOLDERS,
    template::{Template, TemplateError, DEFAULT_TEMPLATE},
};
use globset::{Glob, GlobMatcher};
use serde::{Deserialize, Serialize};
use std::{
    env, fs, io,
    path::{Path, PathBuf},
    time::Duration,
};
use thiserror::Error;
use tracing::{debug, error, warn};

#[derive(Error, Debug)]
pub enum ConfigErrors {
    #[error("Failed to read {path:?}")]
    ReadFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Config is not valid")]
    InvalidYaml(#[from] serde_yaml::Error),
    #[error("Include glob was invalid")]
    InvalidGlob(#[from] globset::Error),
    #[error("Template was invalid")]
    InvalidTemplate(#[from] TemplateError),
    #[error("Unable to determine the user owning the scheduler queue")]
    UnknownUser,
    #[error("Config failed preflight checks")]
    PreflightFailed,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct RunnerConfig {
    // number of work items to render and submit, applied after filtering
    pub limit: usize,
    pub storage: StorageConfig,
    #[serde(default)]
    pub template: TemplateConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub admission: AdmissionConfig,
    #[serde(default)]
    pub render: RenderConfig,
    #[serde(default)]
    pub output: OutputConfig,
    #[serde(default)]
    pub ledger: LedgerConfig,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct StorageConfig {
    // collection root, e.g. `bucket/path/to/watersheds`
    pub prefix: String,
    #[serde(default)]
    pub backend: StorageBackend,
    #[serde(default = "default_scheme")]
    pub scheme: String,
    // optional glob over work item names
    pub include: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum StorageBackend {
    /// list the prefix with `gsutil ls`
    Gsutil {
        #[serde(default = "default_gsutil")]
        exec: PathBuf,
        #[serde(default = "default_timeout")]
        timeout: u64,
    },
    /// list a mounted directory, `prefix` is resolved relative to `root`
    Local { root: PathBuf },
}

impl Default for StorageBackend {
    fn default() -> Self {
        Self::Gsutil {
            exec: default_gsutil(),
            timeout: default_timeout(),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct TemplateConfig {
    // falls back to the built-in flood model script
    pub path: Option<PathBuf>,
    #[serde(default = "default_project_prefix")]
    pub project_prefix: String,
    #[serde(default = "default_scenario_suffix")]
    pub scenario_suffix: String,
    #[serde(default = "default_parameter_extension")]
    pub parameter_extension: String,
}

impl Default for TemplateConfig {
    fn default() -> Self {
        Self {
            path: None,
            project_prefix: default_project_prefix(),
            scenario_suffix: default_scenario_suffix(),
            parameter_extension: default_parameter_extension(),
        }
    }
}

impl TemplateConfig {
    /// read and parse the configured template
    pub fn load_template(&self) -> Result<Template, ConfigErrors> {
        match &self.path {
            Some(path) => {
                let source = fs::read_to_string(path).map_err(|source| {
                    ConfigErrors::ReadFailed {
                        path: path.clone(),
                        source,
                    }
                })?;

                Ok(Template::parse(&source)?)
            }
            None => Ok(Template::parse(DEFAULT_TEMPLATE)?),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct SchedulerConfig {
    #[serde(default = "default_partition")]
    pub partition: String,
    pub user: Option<String>,
    #[serde(default = "default_query")]
    pub query: PathBuf,
    #[serde(default = "default_submit")]
    pub submit: PathBuf,
    // timeout for a single scheduler command in milliseconds
    #[serde(default = "default_timeout")]
    pub timeout: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            partition: default_partition(),
            user: None,
            query: default_query(),
            submit: default_submit(),
            timeout: default_timeout(),
        }
    }
}

impl SchedulerConfig {
    /// user whose jobs count towards the queue depth
    pub fn resolve_user(&self) -> Result<String, ConfigErrors> {
        if let Some(user) = &self.user {
            return Ok(user.clone());
        }

        if let Ok(user) = env::var("USER") {
            if !user.is_empty() {
                return Ok(user);
            }
        }

        match nix::unistd::User::from_uid(nix::unistd::getuid()) {
            Ok(Some(user)) => {
                debug!(user = %user.name, "USER is not set, using passwd entry");

                Ok(user.name)
            }
            Ok(None) => Err(ConfigErrors::UnknownUser),
            Err(error) => {
                error!(error = ?error, "Failed to look up the current user");

                Err(ConfigErrors::UnknownUser)
            }
        }
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.timeout)
    }
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SubmitErrorPolicy {
    /// record the failure and keep submitting the rest of the chunk
    #[default]
    Continue,
    /// stop the run at the first failed submission
    Abort,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct AdmissionConfig {
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_capacity_threshold")]
    pub capacity_threshold: u64,
    // seconds to wait while the queue is saturated
    #[serde(default = "default_backoff")]
    pub backoff: u64,
    #[serde(default)]
    pub on_submit_error: SubmitErrorPolicy,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            capacity_threshold: default_capacity_threshold(),
            backoff: default_backoff(),
            on_submit_error: SubmitErrorPolicy::default(),
        }
    }
}

impl AdmissionConfig {
    pub fn backoff_interval(&self) -> Duration {
        Duration::from_secs(self.backoff)
    }
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RenderErrorPolicy {
    #[default]
    Skip,
    Abort,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default)]
#[serde(deny_unknown_fields)]
pub struct RenderConfig {
    #[serde(default)]
    pub on_error: RenderErrorPolicy,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct OutputConfig {
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    #[serde(default = "default_scripts_dir")]
    pub scripts_dir: PathBuf,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            log_dir: default_log_dir(),
            scripts_dir: default_scripts_dir(),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct LedgerConfig {
    #[serde(default = "default_ledger_path")]
    pub path: PathBuf,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            path: default_ledger_path(),
        }
    }
}

impl RunnerConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigErrors> {
        let source = fs::read_to_string(path).map_err(|source| ConfigErrors::ReadFailed {
            path: path.to_path_buf(),
            source,
        })?;

        Self::from_yaml(&source)
    }

    pub fn from_yaml(source: &str) -> Result<Self, ConfigErrors> {
        Ok(serde_yaml::from_str(source)?)
    }

    /// compile the include glob, if any
    pub fn include_matcher(&self) -> Result<Option<GlobMatcher>, ConfigErrors> {
        match &self.storage.include {
            Some(pattern) => Ok(Some(Glob::new(pattern)?.compile_matcher())),
            None => Ok(None),
        }
    }

    /// returns true if the config contains errors
    pub fn preflight_checks(&self) -> bool {
        // report every problem instead of stopping at the first one
        let mut contains_error = false;

        if self.limit == 0 {
            error!("limit is 0, no work item would be processed");
            contains_error = true;
        }

        if self.storage.prefix.trim_matches('/').is_empty() {
            error!("storage.prefix must not be empty");
            contains_error = true;
        }

        if self.storage.scheme.is_empty() {
            error!("storage.scheme must not be empty");
            contains_error = true;
        }

        if let StorageBackend::Local { root } = &self.storage.backend {
            if !root.is_dir() {
                error!(
                    "storage.backend.root ({}) is not a directory",
                    root.to_string_lossy()
                );
                contains_error = true;
            }
        }

        if let Err(e) = self.include_matcher() {
            error!("storage.include is not a valid glob: {e}");
            contains_error = true;
        }

        match self.template.load_template() {
            Ok(template) => {
                for placeholder in template.placeholders() {
                    if !PLACEHOLDERS.contains(&placeholder) {
                        error!(
                            "Template uses `{placeholder}` which has no value, supported placeholders are {}",
                            PLACEHOLDERS.join(", ")
                        );
                        contains_error = true;
                    }
                }
            }
            Err(e) => {
                match &self.template.path {
                    Some(path) => error!(
                        "template.path ({}) could not be loaded: {e}",
                        path.to_string_lossy()
                    ),
                    None => error!("The built-in template could not be loaded: {e}"),
                }
                contains_error = true;
            }
        }

        if self.scheduler.partition.trim().is_empty() {
            error!("scheduler.partition must not be empty");
            contains_error = true;
        }

        if self.scheduler.timeout == 0 {
            error!("scheduler.timeout cannot be 0");
            contains_error = true;
        }

        if self.admission.chunk_size == 0 {
            error!("admission.chunk_size cannot be 0, no job would ever be submitted");
            contains_error = true;
        }

        if self.admission.capacity_threshold == 0 {
            error!("admission.capacity_threshold cannot be 0, the queue would never admit a job");
            contains_error = true;
        }

        if self.admission.backoff == 0 {
            error!("admission.backoff cannot be 0, this would poll the scheduler in a hot loop");
            contains_error = true;
        }

        if self.admission.chunk_size as u64 > self.admission.capacity_threshold {
            warn!(
                "admission.chunk_size ({}) exceeds admission.capacity_threshold ({}), a single chunk may overshoot the queue by more than its capacity",
                self.admission.chunk_size, self.admission.capacity_threshold
            );
        }

        contains_error
    }
}

fn home_dir() -> PathBuf {
    env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
}

fn default_scheme() -> String {
    String::from("gs")
}

fn default_gsutil() -> PathBuf {
    PathBuf::from("gsutil")
}

fn default_timeout() -> u64 {
    60_000
}

fn default_project_prefix() -> String {
    String::from("Ethiopia")
}

fn default_scenario_suffix() -> String {
    String::from("100yr")
}

fn default_parameter_extension() -> String {
    String::from("par")
}

fn default_partition() -> String {
    String::from("compute")
}

fn default_query() -> PathBuf {
    PathBuf::from("squeue")
}

fn default_submit() -> PathBuf {
    PathBuf::from("sbatch")
}

fn default_chunk_size() -> usize {
    100
}

fn default_capacity_threshold() -> u64 {
    2000
}

fn default_backoff() -> u64 {
    7 * 60
}

fn default_log_dir() -> PathBuf {
    home_dir().join("logs")
}

fn default_scripts_dir() -> PathBuf {
    home_dir().join("scripts")
}

fn default_ledger_path() -> PathBuf {
    PathBuf::from("floodbatch.db")
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = "
limit: 10
storage:
  prefix: mizuroute_streamflow/ethiopia_flood
";

    #[test]
    fn minimal_config_uses_defaults() {
        let config = RunnerConfig::from_yaml(MINIMAL).unwrap();

        assert_eq!(config.limit, 10);
        assert_eq!(config.storage.scheme, "gs");
        assert_eq!(config.storage.backend, StorageBackend::default());
        assert_eq!(config.scheduler.partition, "compute");
        assert_eq!(config.scheduler.query, PathBuf::from("squeue"));
        assert_eq!(config.scheduler.submit, PathBuf::from("sbatch"));
        assert_eq!(config.admission.chunk_size, 100);
        assert_eq!(config.admission.capacity_threshold, 2000);
        assert_eq!(config.admission.backoff_interval(), Duration::from_secs(420));
        assert_eq!(
            config.admission.on_submit_error,
            SubmitErrorPolicy::Continue
        );
        assert_eq!(config.render.on_error, RenderErrorPolicy::Skip);
        assert_eq!(config.template.project_prefix, "Ethiopia");
        assert!(!config.preflight_checks());
    }

    #[test]
    fn limit_is_required() {
        let result = RunnerConfig::from_yaml("storage:\n  prefix: bucket/path\n");

        assert!(matches!(result, Err(ConfigErrors::InvalidYaml(_))));
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let source = format!("{MINIMAL}admission:\n  chunk: 5\n");

        assert!(RunnerConfig::from_yaml(&source).is_err());
    }

    #[test]
    fn full_config() {
        let source = "
limit: 50000
storage:
  prefix: bucket/watersheds
  include: 'basin_*'
  backend:
    kind: local
    root: /tmp
template:
  project_prefix: Kenya
  scenario_suffix: 50yr
scheduler:
  partition: long
  user: hydro
  timeout: 1000
admission:
  chunk_size: 25
  capacity_threshold: 500
  backoff: 60
  on_submit_error: abort
render:
  on_error: abort
output:
  log_dir: /scratch/logs
  scripts_dir: /scratch/scripts
ledger:
  path: /scratch/ledger.db
";
        let config = RunnerConfig::from_yaml(source).unwrap();

        assert_eq!(
            config.storage.backend,
            StorageBackend::Local {
                root: PathBuf::from("/tmp")
            }
        );
        assert_eq!(config.scheduler.resolve_user().unwrap(), "hydro");
        assert_eq!(config.scheduler.command_timeout(), Duration::from_secs(1));
        assert_eq!(config.admission.on_submit_error, SubmitErrorPolicy::Abort);
        assert_eq!(config.render.on_error, RenderErrorPolicy::Abort);
        assert_eq!(config.output.log_dir, PathBuf::from("/scratch/logs"));

        let matcher = config.include_matcher().unwrap().unwrap();
        assert!(matcher.is_match("basin_17"));
        assert!(!matcher.is_match("lake_3"));
        assert!(!config.preflight_checks());
    }

    #[test]
    fn preflight_reports_invalid_values() {
        let mut config = RunnerConfig::from_yaml(MINIMAL).unwrap();
        config.admission.chunk_size = 0;

        assert!(config.preflight_checks());

        let mut config = RunnerConfig::from_yaml(MINIMAL).unwrap();
        config.admission.backoff = 0;

        assert!(config.preflight_checks());

        let mut config = RunnerConfig::from_yaml(MINIMAL).unwrap();
        config.storage.include = Some(String::from("basin_["));

        assert!(config.preflight_checks());

        let mut config = RunnerConfig::from_yaml(MINIMAL).unwrap();
        config.template.path = Some(PathBuf::from("/nonexistent/template.sh"));

        assert!(config.preflight_checks());
    }

    #[test]
    fn preflight_rejects_unknown_placeholders() {
        let directory = tempfile::tempdir().unwrap();
        let path = directory.path().join("template.sh");
        let mut config = RunnerConfig::from_yaml(MINIMAL).unwrap();
        config.template.path = Some(path.clone());

        fs::write(&path, "#!/bin/bash\nrun $job_name --seed $seed\n").unwrap();
        assert!(config.preflight_checks());

        fs::write(&path, "#!/bin/bash\nrun $job_name $$HOME ${parameter_file}\n").unwrap();
        assert!(!config.preflight_checks());
    }
}
