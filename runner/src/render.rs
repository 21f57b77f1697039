use crate::{
    catalog::WorkDescriptor,
    config::{ConfigErrors, RunnerConfig},
    template::{Template, TemplateError},
};
use std::{
    collections::BTreeMap,
    fs::{self, Permissions},
    io::{self, Write},
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("Failed to render the job script for {name}")]
    Template {
        name: String,
        #[source]
        source: TemplateError,
    },
    #[error("Failed to create directory {path:?}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Failed to write the job script for {name} to {path:?}")]
    Write {
        name: String,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// every placeholder a template may use
pub const PLACEHOLDERS: [&str; 7] = [
    "job_name",
    "partition",
    "log_file_path",
    "gcs_path",
    "folder_name",
    "parameter_file",
    "project_prefix",
];

/// A job script with every placeholder resolved, persisted at `script_path`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedJob {
    pub name: String,
    pub script_text: String,
    pub script_path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct Renderer {
    template: Template,
    partition: String,
    scheme: String,
    project_prefix: String,
    scenario_suffix: String,
    parameter_extension: String,
    log_dir: PathBuf,
    scripts_dir: PathBuf,
}

impl Renderer {
    pub fn new(template: Template, config: &RunnerConfig) -> Self {
        Self {
            template,
            partition: config.scheduler.partition.clone(),
            scheme: config.storage.scheme.clone(),
            project_prefix: config.template.project_prefix.clone(),
            scenario_suffix: config.template.scenario_suffix.clone(),
            parameter_extension: config.template.parameter_extension.clone(),
            log_dir: config.output.log_dir.clone(),
            scripts_dir: config.output.scripts_dir.clone(),
        }
    }

    pub fn load(config: &RunnerConfig) -> Result<Self, ConfigErrors> {
        Ok(Self::new(config.template.load_template()?, config))
    }

    /// `<project_prefix>_<name>_<scenario_suffix>.<extension>`
    pub fn parameter_file(&self, name: &str) -> String {
        let stem = format!("{}_{name}_{}", self.project_prefix, self.scenario_suffix);

        if self.parameter_extension.is_empty() {
            stem
        } else {
            format!("{stem}.{}", self.parameter_extension)
        }
    }

    pub fn script_path(&self, name: &str) -> PathBuf {
        self.scripts_dir.join(format!("slurm_runner_{name}.sh"))
    }

    /// substitution values for a single work item
    pub fn values(&self, descriptor: &WorkDescriptor) -> BTreeMap<&'static str, String> {
        let name = &descriptor.name;

        BTreeMap::from([
            ("job_name", name.clone()),
            ("folder_name", name.clone()),
            ("partition", self.partition.clone()),
            (
                "log_file_path",
                self.log_dir
                    .join(format!("{name}.out"))
                    .to_string_lossy()
                    .into_owned(),
            ),
            (
                "gcs_path",
                format!("{}://{}", self.scheme, descriptor.remote_path),
            ),
            ("parameter_file", self.parameter_file(name)),
            ("project_prefix", self.project_prefix.clone()),
        ])
    }

    pub fn render_text(&self, descriptor: &WorkDescriptor) -> Result<String, RenderError> {
        self.template
            .substitute(&self.values(descriptor))
            .map_err(|source| RenderError::Template {
                name: descriptor.name.clone(),
                source,
            })
    }

    /// Render the script for `descriptor` and write it to the scripts directory
    pub fn render(&self, descriptor: &WorkDescriptor) -> Result<RenderedJob, RenderError> {
        // render before touching the filesystem, a template error leaves nothing behind
        let script_text = self.render_text(descriptor)?;

        for directory in [&self.log_dir, &self.scripts_dir] {
            fs::create_dir_all(directory).map_err(|source| RenderError::CreateDir {
                path: directory.clone(),
                source,
            })?;
        }

        let script_path = self.script_path(&descriptor.name);
        persist(&script_path, &script_text).map_err(|source| RenderError::Write {
            name: descriptor.name.clone(),
            path: script_path.clone(),
            source,
        })?;
        debug!(name = %descriptor.name, path = ?script_path, "Wrote job script");

        Ok(RenderedJob {
            name: descriptor.name.clone(),
            script_text,
            script_path,
        })
    }
}

/// write `text` to a hidden temporary file next to `path`, then rename it into place
fn persist(path: &Path, text: &str) -> io::Result<()> {
    let directory = path.parent().unwrap_or_else(|| Path::new("."));
    let mut file = tempfile::Builder::new()
        .prefix(".slurm_runner_")
        .suffix(".partial")
        .tempfile_in(directory)?;

    file.write_all(text.as_bytes())?;
    file.as_file().set_permissions(Permissions::from_mode(0o755))?;
    file.as_file().sync_all()?;
    file.persist(path).map_err(|error| error.error)?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(root: &Path) -> RunnerConfig {
        let mut config = RunnerConfig::from_yaml(
            "limit: 10\nstorage:\n  prefix: mizuroute_streamflow/ethiopia_flood\n",
        )
        .unwrap();
        config.output.log_dir = root.join("logs");
        config.output.scripts_dir = root.join("scripts");

        config
    }

    fn descriptor(name: &str) -> WorkDescriptor {
        WorkDescriptor {
            name: name.to_owned(),
            remote_path: format!("mizuroute_streamflow/ethiopia_flood/{name}"),
        }
    }

    #[test]
    fn derives_all_values() {
        let root = tempfile::tempdir().unwrap();
        let renderer = Renderer::load(&config(root.path())).unwrap();
        let values = renderer.values(&descriptor("basin_7"));

        assert_eq!(values["job_name"], "basin_7");
        assert_eq!(values["folder_name"], "basin_7");
        assert_eq!(values["partition"], "compute");
        assert_eq!(
            values["log_file_path"],
            root.path().join("logs/basin_7.out").to_string_lossy()
        );
        assert_eq!(
            values["gcs_path"],
            "gs://mizuroute_streamflow/ethiopia_flood/basin_7"
        );
        assert_eq!(values["parameter_file"], "Ethiopia_basin_7_100yr.par");

        let mut keys: Vec<_> = values.keys().copied().collect();
        let mut known = PLACEHOLDERS.to_vec();
        keys.sort_unstable();
        known.sort_unstable();
        assert_eq!(keys, known);
    }

    #[test]
    fn renders_default_template_without_leftover_placeholders() {
        let root = tempfile::tempdir().unwrap();
        let renderer = Renderer::load(&config(root.path())).unwrap();
        let job = renderer.render(&descriptor("basin_7")).unwrap();

        assert_eq!(job.script_path, root.path().join("scripts/slurm_runner_basin_7.sh"));
        assert_eq!(fs::read_to_string(&job.script_path).unwrap(), job.script_text);
        assert!(job.script_text.contains("#SBATCH --job-name basin_7\n"));
        assert!(job.script_text.contains("#SBATCH --partition compute\n"));
        assert!(job
            .script_text
            .contains("export GCS_PATH=gs://mizuroute_streamflow/ethiopia_flood/basin_7\n"));
        assert!(job.script_text.contains("echo \"Copying remote data from $GCS_PATH\""));
        assert!(job.script_text.contains("lisflood Ethiopia_basin_7_100yr.par\n"));
        assert!(job
            .script_text
            .contains("cp -r Ethiopia_results_basin_7 $GCS_PATH\n"));
        for placeholder in [
            "$job_name",
            "$partition",
            "$log_file_path",
            "$gcs_path",
            "$folder_name",
            "$parameter_file",
            "${project_prefix}",
        ] {
            assert!(!job.script_text.contains(placeholder), "{placeholder} left");
        }

        let mode = fs::metadata(&job.script_path).unwrap().permissions().mode();
        assert_eq!(mode & 0o111, 0o111);
        assert!(root.path().join("logs").is_dir());
    }

    #[test]
    fn rendering_is_deterministic() {
        let root = tempfile::tempdir().unwrap();
        let renderer = Renderer::load(&config(root.path())).unwrap();

        let first = renderer.render(&descriptor("basin_1")).unwrap();
        let second = renderer.render(&descriptor("basin_1")).unwrap();

        assert_eq!(first, second);
    }

    #[test]
    fn unknown_placeholder_writes_nothing() {
        let root = tempfile::tempdir().unwrap();
        let template = Template::parse("#!/bin/bash\nrun $job_name --seed $seed\n").unwrap();
        let renderer = Renderer::new(template, &config(root.path()));

        match renderer.render(&descriptor("basin_1")) {
            Err(RenderError::Template { name, source }) => {
                assert_eq!(name, "basin_1");
                assert_eq!(
                    source,
                    TemplateError::Unresolved {
                        placeholder: String::from("seed")
                    }
                );
            }
            other => panic!("unexpected result: {other:?}"),
        }
        assert!(!renderer.script_path("basin_1").exists());
    }

    #[test]
    fn failed_write_leaves_no_script() {
        let root = tempfile::tempdir().unwrap();
        let renderer = Renderer::load(&config(root.path())).unwrap();
        // a directory in place of the script makes the final rename fail
        fs::create_dir_all(renderer.script_path("basin_1").join("occupied")).unwrap();

        assert!(matches!(
            renderer.render(&descriptor("basin_1")),
            Err(RenderError::Write { .. })
        ));
        assert!(renderer.script_path("basin_1").is_dir());

        let leftovers: Vec<_> = fs::read_dir(root.path().join("scripts"))
            .unwrap()
            .map(|entry| entry.unwrap().file_name())
            .collect();
        assert_eq!(leftovers, vec![std::ffi::OsString::from("slurm_runner_basin_1.sh")]);
    }

    #[test]
    fn rerender_replaces_existing_script() {
        let root = tempfile::tempdir().unwrap();
        let renderer = Renderer::load(&config(root.path())).unwrap();
        fs::create_dir_all(root.path().join("scripts")).unwrap();
        fs::write(renderer.script_path("basin_1"), "stale").unwrap();

        let job = renderer.render(&descriptor("basin_1")).unwrap();

        assert_eq!(fs::read_to_string(&job.script_path).unwrap(), job.script_text);
        assert_eq!(fs::read_dir(root.path().join("scripts")).unwrap().count(), 1);
    }
}
