use crate::{
    command::{run_command, CommandError},
    config::{RunnerConfig, StorageBackend},
};
use globset::GlobMatcher;
use ignore::WalkBuilder;
use std::{collections::BTreeSet, error::Error as StdError, path::PathBuf, time::Duration};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("Storage listing of {prefix} failed")]
    StorageUnavailable {
        prefix: String,
        #[source]
        source: Box<dyn StdError + Send + Sync>,
    },
}

/// One watershed folder to simulate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkDescriptor {
    pub name: String,
    /// storage path without scheme, always ends with `name`
    pub remote_path: String,
}

/// Source of the storage listing
/// (an enum over the supported backends, mirroring the config)
#[derive(Debug, Clone)]
pub enum Catalog {
    Gsutil {
        exec: PathBuf,
        scheme: String,
        prefix: String,
        timeout: Duration,
    },
    Local {
        root: PathBuf,
        scheme: String,
        prefix: String,
    },
}

impl Catalog {
    pub fn load(config: &RunnerConfig) -> Self {
        let storage = &config.storage;

        match &storage.backend {
            StorageBackend::Gsutil { exec, timeout } => Self::Gsutil {
                exec: exec.clone(),
                scheme: storage.scheme.clone(),
                prefix: storage.prefix.clone(),
                timeout: Duration::from_millis(*timeout),
            },
            StorageBackend::Local { root } => Self::Local {
                root: root.clone(),
                scheme: storage.scheme.clone(),
                prefix: storage.prefix.clone(),
            },
        }
    }

    pub fn prefix(&self) -> &str {
        match self {
            Self::Gsutil { prefix, .. } | Self::Local { prefix, .. } => prefix,
        }
    }

    fn scheme(&self) -> &str {
        match self {
            Self::Gsutil { scheme, .. } | Self::Local { scheme, .. } => scheme,
        }
    }

    fn unavailable<E>(&self, source: E) -> CatalogError
    where
        E: Into<Box<dyn StdError + Send + Sync>>,
    {
        CatalogError::StorageUnavailable {
            prefix: self.prefix().to_owned(),
            source: source.into(),
        }
    }

    /// raw entries directly under the prefix, in listing order
    pub fn list_entries(&self) -> Result<Vec<String>, CatalogError> {
        match self {
            Self::Gsutil {
                exec,
                scheme,
                prefix,
                timeout,
            } => {
                let url = format!("{scheme}://{}", prefix.trim_end_matches('/'));
                let output = run_command(exec, &["ls", url.as_str()], *timeout)
                    .map_err(|error: CommandError| self.unavailable(error))?;

                Ok(output
                    .stdout
                    .lines()
                    .map(str::trim)
                    .filter(|line| !line.is_empty())
                    .map(str::to_owned)
                    .collect())
            }
            Self::Local { root, prefix, .. } => {
                let directory = root.join(prefix.trim_matches('/'));
                let mut entries = Vec::new();

                // depth 0 is the prefix itself, which yields an empty name later on
                for entry in WalkBuilder::new(&directory)
                    .standard_filters(false)
                    .hidden(true)
                    .max_depth(Some(1))
                    .sort_by_file_name(|a, b| a.cmp(b))
                    .build()
                {
                    let entry = entry.map_err(|error| self.unavailable(error))?;
                    let relative = entry
                        .path()
                        .strip_prefix(root)
                        .unwrap_or_else(|_| entry.path());

                    entries.push(relative.to_string_lossy().into_owned());
                }

                Ok(entries)
            }
        }
    }

    /// list all work items under the prefix
    pub fn list_work(&self) -> Result<Vec<WorkDescriptor>, CatalogError> {
        let entries = self.list_entries()?;
        debug!("Storage listing returned {} entries", entries.len());

        Ok(descriptors_from_listing(self.prefix(), self.scheme(), entries))
    }
}

/// Turn storage entries into work descriptors
///
/// The name is the last path segment after stripping `prefix`. Entries outside
/// the prefix, with an empty name (the listing of the prefix itself) and
/// repeated names are dropped.
pub fn descriptors_from_listing<I, S>(prefix: &str, scheme: &str, entries: I) -> Vec<WorkDescriptor>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let prefix = prefix.trim_matches('/');
    let scheme_prefix = format!("{scheme}://");
    let mut seen = BTreeSet::new();
    let mut descriptors = Vec::new();

    for entry in entries {
        let entry = entry.as_ref().trim();
        let remote_path = entry
            .strip_prefix(scheme_prefix.as_str())
            .unwrap_or(entry)
            .trim_end_matches('/');
        let relative = match remote_path.trim_start_matches('/').strip_prefix(prefix) {
            Some(rest) if rest.is_empty() || rest.starts_with('/') => rest.trim_matches('/'),
            _ => {
                warn!(entry = entry, prefix = prefix, "Skipped entry outside the prefix");
                continue;
            }
        };
        let name = relative.rsplit('/').next().unwrap_or(relative);

        if name.is_empty() {
            debug!(entry = entry, "Skipped entry without a work item name");
            continue;
        }

        if !seen.insert(name.to_owned()) {
            warn!(entry = entry, name = name, "Skipped duplicate work item");
            continue;
        }

        descriptors.push(WorkDescriptor {
            name: name.to_owned(),
            remote_path: remote_path.to_owned(),
        });
    }

    descriptors
}

/// Apply the include glob, drop excluded names and cap at `limit`
pub fn select_work(
    descriptors: Vec<WorkDescriptor>,
    include: Option<&GlobMatcher>,
    exclude: &BTreeSet<String>,
    limit: usize,
) -> Vec<WorkDescriptor> {
    let available = descriptors.len();
    let selected: Vec<_> = descriptors
        .into_iter()
        .filter(|descriptor| include.map_or(true, |glob| glob.is_match(&descriptor.name)))
        .filter(|descriptor| !exclude.contains(&descriptor.name))
        .take(limit)
        .collect();

    info!(
        "Selected {} of {available} work items (limit {limit}, {} excluded)",
        selected.len(),
        exclude.len()
    );

    selected
}
