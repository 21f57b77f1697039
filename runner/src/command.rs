use itertools::Itertools;
use std::{
    ffi::OsStr,
    io::{self, Read},
    path::Path,
    process::{Command, Stdio},
    thread::{self, JoinHandle},
    time::Duration,
};
use thiserror::Error;
use tracing::{debug, warn};
use wait_timeout::ChildExt;

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("Failed to spawn `{command}`")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },
    #[error("Failed to wait for `{command}`")]
    Wait {
        command: String,
        #[source]
        source: io::Error,
    },
    #[error("`{command}` did not finish within {timeout:?}")]
    Timeout { command: String, timeout: Duration },
    #[error("`{command}` exited with code {}: {stderr}", exit_code(.code))]
    Failed {
        command: String,
        code: Option<i32>,
        stderr: String,
    },
}

fn exit_code(code: &Option<i32>) -> String {
    match code {
        Some(code) => code.to_string(),
        // terminated by a signal
        None => String::from("none"),
    }
}

#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
}

/// render a command line for logs and error messages
pub fn describe<S: AsRef<OsStr>>(program: &Path, args: &[S]) -> String {
    std::iter::once(program.as_os_str())
        .chain(args.iter().map(|arg| arg.as_ref()))
        .map(OsStr::to_string_lossy)
        .join(" ")
}

// pipes are drained on their own threads, otherwise a chatty child blocks on a full pipe
fn drain<R: Read + Send + 'static>(mut reader: R) -> JoinHandle<String> {
    thread::spawn(move || {
        let mut buffer = Vec::new();

        if let Err(error) = reader.read_to_end(&mut buffer) {
            debug!(error = ?error, "Failed to read child output");
        }

        String::from_utf8_lossy(&buffer).into_owned()
    })
}

fn collect(handle: Option<JoinHandle<String>>) -> String {
    handle
        .and_then(|handle| handle.join().ok())
        .unwrap_or_default()
}

/// Run `program` to completion and capture its output
///
/// A non-zero exit status is an error carrying the exit code and stderr.
pub fn run_command<S: AsRef<OsStr>>(
    program: &Path,
    args: &[S],
    timeout: Duration,
) -> Result<CommandOutput, CommandError> {
    let command = describe(program, args);
    debug!("Running command `{command}`");

    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|source| CommandError::Spawn {
            command: command.clone(),
            source,
        })?;

    let stdout = child.stdout.take().map(drain);
    let stderr = child.stderr.take().map(drain);

    let status = match child.wait_timeout(timeout) {
        Ok(Some(status)) => status,
        Ok(None) => {
            if let Err(error) = child.kill() {
                warn!(error = ?error, "Failed to kill `{command}` after timeout");
            }
            // reap the child, the drain threads finish once the pipes close
            if let Err(error) = child.wait() {
                warn!(error = ?error, "Failed to reap `{command}`");
            }

            return Err(CommandError::Timeout { command, timeout });
        }
        Err(source) => return Err(CommandError::Wait { command, source }),
    };

    let output = CommandOutput {
        stdout: collect(stdout),
        stderr: collect(stderr),
    };

    if status.success() {
        Ok(output)
    } else {
        Err(CommandError::Failed {
            command,
            code: status.code(),
            stderr: output.stderr.trim().to_owned(),
        })
    }
}
