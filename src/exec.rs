//! Running external collaborators (git, merge scripts, test scripts) under
//! a wall-clock limit and a shared cancellation flag.

use std::fs::File;
use std::path::Path;
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Failure to run an external collaborator at all. A collaborator that runs
/// and reports failure is an [`Outcome`], not an error.
#[derive(Debug, Error)]
pub enum CollaboratorError {
    /// The process could not be started.
    #[error("failed to spawn `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// Waiting on or killing the process failed.
    #[error("failed to wait for `{program}`: {source}")]
    Wait {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// The log file could not be opened or duplicated for the child.
    #[error("log file {path}: {source}")]
    Log {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Preparing a directory for the collaborator failed.
    #[error("{path}: {source}")]
    Fs {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The collaborator ran and reported failure where success was required.
    #[error("`{program}` failed: {detail}")]
    Failed { program: String, detail: String },

    /// Cancellation was requested while the collaborator ran.
    #[error("`{program}` cancelled")]
    Cancelled { program: String },
}

/// How a collaborator process ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Ending {
    /// Exited on its own. `None` means killed by a signal.
    Exited(Option<i32>),
    /// Killed after exceeding its time limit.
    TimedOut,
    /// Killed because cancellation was requested.
    Cancelled,
}

/// The result of one collaborator invocation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Outcome {
    pub ending: Ending,
    pub elapsed: Duration,
}

impl Outcome {
    /// The exit code, if the process exited normally.
    #[must_use]
    pub const fn exit_code(&self) -> Option<i32> {
        match self.ending {
            Ending::Exited(code) => code,
            Ending::TimedOut | Ending::Cancelled => None,
        }
    }

    /// `true` if the process exited with status 0.
    #[must_use]
    pub const fn succeeded(&self) -> bool {
        matches!(self.ending, Ending::Exited(Some(0)))
    }
}

/// Where a collaborator's stdout and stderr go.
#[derive(Debug, Clone, Copy)]
pub enum Output<'a> {
    /// Appended to a log file.
    Log(&'a Path),
    /// Discarded.
    Null,
}

/// Run `program args...` in `cwd`, killing it once `timeout` elapses or
/// `cancel` is set.
///
/// # Errors
/// Returns [`CollaboratorError`] only when the process cannot be started or
/// waited on.
pub fn run(
    program: &str,
    args: &[&str],
    cwd: &Path,
    timeout: Duration,
    output: Output<'_>,
    cancel: &AtomicBool,
) -> Result<Outcome, CollaboratorError> {
    let mut command = Command::new(program);
    command.args(args).current_dir(cwd).stdin(Stdio::null());
    match output {
        Output::Log(path) => {
            let open = || {
                File::options()
                    .create(true)
                    .append(true)
                    .open(path)
                    .map_err(|source| CollaboratorError::Log {
                        path: path.to_owned(),
                        source,
                    })
            };
            command.stdout(open()?).stderr(open()?);
        }
        Output::Null => {
            command.stdout(Stdio::null()).stderr(Stdio::null());
        }
    }

    debug!(program, ?args, cwd = %cwd.display(), "spawning collaborator");
    let start = Instant::now();
    let mut child = command.spawn().map_err(|source| CollaboratorError::Spawn {
        program: program.to_owned(),
        source,
    })?;

    let ending = loop {
        match child.try_wait() {
            Ok(Some(status)) => break Ending::Exited(status.code()),
            Ok(None) => {
                let ending = if cancel.load(Ordering::SeqCst) {
                    Ending::Cancelled
                } else if start.elapsed() >= timeout {
                    Ending::TimedOut
                } else {
                    std::thread::sleep(POLL_INTERVAL);
                    continue;
                };
                warn!(program, ?ending, elapsed = ?start.elapsed(), "killing collaborator");
                let _ = child.kill();
                child.wait().map_err(|source| CollaboratorError::Wait {
                    program: program.to_owned(),
                    source,
                })?;
                break ending;
            }
            Err(source) => {
                let _ = child.kill();
                return Err(CollaboratorError::Wait {
                    program: program.to_owned(),
                    source,
                });
            }
        }
    };

    Ok(Outcome {
        ending,
        elapsed: start.elapsed(),
    })
}

/// Run a command that must succeed, such as a git plumbing step.
///
/// # Errors
/// Returns [`CollaboratorError::Failed`] on a non-zero exit or timeout and
/// [`CollaboratorError::Cancelled`] on cancellation.
pub fn run_checked(
    program: &str,
    args: &[&str],
    cwd: &Path,
    timeout: Duration,
    output: Output<'_>,
    cancel: &AtomicBool,
) -> Result<Duration, CollaboratorError> {
    let outcome = run(program, args, cwd, timeout, output, cancel)?;
    match outcome.ending {
        Ending::Exited(Some(0)) => Ok(outcome.elapsed),
        Ending::Exited(code) => Err(CollaboratorError::Failed {
            program: format!("{program} {}", args.join(" ")),
            detail: code.map_or_else(
                || "killed by signal".to_owned(),
                |c| format!("exit code {c}"),
            ),
        }),
        Ending::TimedOut => Err(CollaboratorError::Failed {
            program: format!("{program} {}", args.join(" ")),
            detail: format!("timed out after {}s", timeout.as_secs()),
        }),
        Ending::Cancelled => Err(CollaboratorError::Cancelled {
            program: program.to_owned(),
        }),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
