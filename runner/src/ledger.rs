use crate::{
    render::RenderedJob,
    scheduler::{SubmissionError, SubmissionReceipt},
};
use rusqlite::{params, Connection};
use std::{collections::BTreeSet, path::Path};
use thiserror::Error;
use tracing::{debug, error, info};

pub const SQL_SCHEMA: [&str; 2] = [
    "create table if not exists submissions (
    id integer primary key autoincrement,
    name text not null,
    script text not null,
    status text not null check (status in ('submitted', 'failed')),
    job_id text,
    error text,
    recorded_at text not null default (datetime('now'))
);",
    "create index if not exists submissions_name on submissions (name, status);",
];
pub const SQL_SCHEMA_NUMBER: usize = SQL_SCHEMA.len();

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("SQLite operation failed")]
    SQLite(#[from] rusqlite::Error),
}

/// Record of every submission attempt, used to resume interrupted runs
#[derive(Debug)]
pub struct Ledger {
    connection: Connection,
}

impl Ledger {
    pub fn open(path: &Path) -> Result<Self, LedgerError> {
        let ledger = Self {
            connection: Connection::open(path)?,
        };
        ledger.init()?;
        info!(path = ?path, "Opened submission ledger");

        Ok(ledger)
    }

    #[cfg(test)]
    pub fn in_memory() -> Result<Self, LedgerError> {
        let ledger = Self {
            connection: Connection::open_in_memory()?,
        };
        ledger.init()?;

        Ok(ledger)
    }

    fn init(&self) -> Result<(), LedgerError> {
        for (counter, table) in SQL_SCHEMA.iter().enumerate() {
            if let Err(error) = self.connection.execute(table, []) {
                error!(error = ?error, table = table, "Failed to apply SQL schema ({}/{SQL_SCHEMA_NUMBER}): {error}", counter + 1);

                return Err(error.into());
            }

            debug!("Applied SQL schema ({}/{SQL_SCHEMA_NUMBER})", counter + 1);
        }

        Ok(())
    }

    /// store the outcome of one submission attempt
    pub fn record(
        &self,
        job: &RenderedJob,
        result: &Result<SubmissionReceipt, SubmissionError>,
    ) -> Result<(), LedgerError> {
        let (status, job_id, error) = match result {
            Ok(receipt) => ("submitted", receipt.job_id.clone(), None),
            Err(error) => ("failed", None, Some(format!("{error}: {}", error.source))),
        };

        self.connection
            .prepare_cached(
                "insert into submissions (name, script, status, job_id, error)
                 values (?, ?, ?, ?, ?)",
            )?
            .execute(params![
                job.name,
                job.script_path.to_string_lossy().into_owned(),
                status,
                job_id,
                error
            ])?;

        Ok(())
    }

    /// work items with at least one successful submission
    pub fn submitted_names(&self) -> Result<BTreeSet<String>, LedgerError> {
        self.connection
            .prepare_cached("select distinct name from submissions where status = 'submitted'")?
            .query_map([], |row| row.get::<_, String>(0))?
            .try_fold(BTreeSet::new(), |mut names, name| {
                names.insert(name?);

                Ok::<BTreeSet<String>, LedgerError>(names)
            })
    }

    /// work items whose every attempt failed, with the latest error
    pub fn failed_names(&self) -> Result<Vec<(String, String)>, LedgerError> {
        self.connection
            .prepare_cached(
                "select name, error from submissions
                 where status = 'failed'
                   and name not in (select name from submissions where status = 'submitted')
                   and id in (select max(id) from submissions group by name)
                 order by name",
            )?
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, Option<String>>(1)?.unwrap_or_default(),
                ))
            })?
            .try_fold(Vec::new(), |mut failures, failure| {
                failures.push(failure?);

                Ok::<Vec<(String, String)>, LedgerError>(failures)
            })
    }
}
