//! The merge tools and test runner an evaluation drives.

use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::time::Duration;

use serde::Serialize;

use crate::config::{EvaluationConfig, ToolConfig};
use crate::exec::{self, CollaboratorError, Ending, Output};

/// What a merge attempt produced.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeVerdict {
    Merged,
    Conflict,
    Failed,
    TimedOut,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MergeOutcome {
    pub verdict: MergeVerdict,
    pub exit_code: Option<i32>,
    pub elapsed: Duration,
}

/// A merge implementation under evaluation.
pub trait MergeTool: Send + Sync {
    /// Name recorded in cache keys.
    fn name(&self) -> &str;

    /// Configuration string recorded in cache keys.
    fn config(&self) -> &str;

    /// Merge `right` into the checked-out `left` inside `workdir`. On
    /// conflict the tool leaves the workdir clean.
    ///
    /// # Errors
    /// The tool could not be run at all, or cancellation.
    fn merge(
        &self,
        workdir: &Path,
        left: &str,
        right: &str,
        log: &Path,
        cancel: &AtomicBool,
    ) -> Result<MergeOutcome, CollaboratorError>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TestVerdict {
    Passed,
    Failed,
    TimedOut,
}

/// One run of the test suite.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TestAttempt {
    pub verdict: TestVerdict,
    pub elapsed: Duration,
}

/// Runs a project's tests against the merged workdir.
pub trait TestRunner: Send + Sync {
    /// # Errors
    /// The runner could not be started, or cancellation.
    fn run(&self, workdir: &Path, log: &Path, cancel: &AtomicBool) -> Result<TestAttempt, CollaboratorError>;
}

/// Run tests up to `attempts` times, stopping at the first pass or timeout.
///
/// # Errors
/// Propagates the first runner error.
pub fn run_tests(
    runner: &dyn TestRunner,
    attempts: u32,
    workdir: &Path,
    log: &Path,
    cancel: &AtomicBool,
) -> Result<Vec<TestAttempt>, CollaboratorError> {
    let mut out = Vec::new();
    for _ in 0..attempts.max(1) {
        let attempt = runner.run(workdir, log, cancel)?;
        out.push(attempt);
        if attempt.verdict != TestVerdict::Failed {
            break;
        }
    }
    Ok(out)
}

/// Relative commands with a path separator are resolved against the current
/// directory, since collaborators run inside the workdir.
fn resolve_command(command: &str) -> PathBuf {
    let path = Path::new(command);
    if path.is_relative() && path.components().count() > 1 {
        std::path::absolute(path).unwrap_or_else(|_| path.to_owned())
    } else {
        path.to_owned()
    }
}

/// A merge tool run as `<command> <workdir> <left> <right>`.
/// Exit 0 is a merge, 1 a conflict, anything else a failure.
#[derive(Clone, Debug)]
pub struct ScriptMergeTool {
    name: String,
    config: String,
    command: PathBuf,
    timeout: Duration,
}

impl ScriptMergeTool {
    #[must_use]
    pub fn new(tool: &ToolConfig, timeout: Duration) -> Self {
        Self {
            name: tool.name.clone(),
            config: tool.config.clone(),
            command: resolve_command(&tool.command),
            timeout,
        }
    }
}

impl MergeTool for ScriptMergeTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn config(&self) -> &str {
        &self.config
    }

    fn merge(
        &self,
        workdir: &Path,
        left: &str,
        right: &str,
        log: &Path,
        cancel: &AtomicBool,
    ) -> Result<MergeOutcome, CollaboratorError> {
        let program = self.command.to_string_lossy();
        let dir = workdir.to_string_lossy();
        let outcome = exec::run(&program, &[&*dir, left, right], workdir, self.timeout, Output::Log(log), cancel)?;
        let verdict = match outcome.ending {
            Ending::Cancelled => {
                return Err(CollaboratorError::Cancelled {
                    program: program.into_owned(),
                });
            }
            Ending::TimedOut => MergeVerdict::TimedOut,
            Ending::Exited(Some(0)) => MergeVerdict::Merged,
            Ending::Exited(Some(1)) => MergeVerdict::Conflict,
            Ending::Exited(_) => MergeVerdict::Failed,
        };
        Ok(MergeOutcome {
            verdict,
            exit_code: outcome.exit_code(),
            elapsed: outcome.elapsed,
        })
    }
}

/// A test runner run as `<command> <workdir>`; exit 0 passes.
#[derive(Clone, Debug)]
pub struct ScriptTestRunner {
    command: PathBuf,
    timeout: Duration,
}

impl ScriptTestRunner {
    #[must_use]
    pub fn new(config: &EvaluationConfig) -> Self {
        Self {
            command: resolve_command(&config.test_command),
            timeout: config.test_timeout(),
        }
    }
}

impl TestRunner for ScriptTestRunner {
    fn run(&self, workdir: &Path, log: &Path, cancel: &AtomicBool) -> Result<TestAttempt, CollaboratorError> {
        let program = self.command.to_string_lossy();
        let dir = workdir.to_string_lossy();
        let outcome = exec::run(&program, &[&*dir], workdir, self.timeout, Output::Log(log), cancel)?;
        let verdict = match outcome.ending {
            Ending::Cancelled => {
                return Err(CollaboratorError::Cancelled {
                    program: program.into_owned(),
                });
            }
            Ending::TimedOut => TestVerdict::TimedOut,
            Ending::Exited(Some(0)) => TestVerdict::Passed,
            Ending::Exited(_) => TestVerdict::Failed,
        };
        Ok(TestAttempt {
            verdict,
            elapsed: outcome.elapsed,
        })
    }
}
