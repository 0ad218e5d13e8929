//! Isolated working copies for one evaluation.
//!
//! Each work item gets a throwaway clone sharing objects with the
//! repository's discovery clone, with the two merge parents checked out as
//! dedicated branches. The directory is removed when the [`Workdir`] drops.

use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::time::Duration;

use mergebench_git::GitOid;
use tempfile::TempDir;
use tracing::debug;

use crate::exec::{self, CollaboratorError, Output};

/// Branch holding the first parent.
pub const LEFT_BRANCH: &str = "___MERGE_TESTER_LEFT";
/// Branch holding the second parent.
pub const RIGHT_BRANCH: &str = "___MERGE_TESTER_RIGHT";

const GIT_TIMEOUT: Duration = Duration::from_secs(30 * 60);

#[derive(Debug)]
pub struct Workdir {
    dir: TempDir,
}

impl Workdir {
    /// Clone `source` under `root` and check out `LEFT_BRANCH` at `parent_1`
    /// with `RIGHT_BRANCH` at `parent_2`. Git output is appended to `log`.
    ///
    /// # Errors
    /// Filesystem failures and failing git commands.
    pub fn prepare(
        source: &Path,
        root: &Path,
        parent_1: GitOid,
        parent_2: GitOid,
        log: &Path,
        cancel: &AtomicBool,
    ) -> Result<Self, CollaboratorError> {
        let fs_err = |source| CollaboratorError::Fs {
            path: root.to_owned(),
            source,
        };
        std::fs::create_dir_all(root).map_err(fs_err)?;
        let dir = tempfile::Builder::new()
            .prefix("merge-")
            .tempdir_in(root)
            .map_err(fs_err)?;
        let source = std::path::absolute(source).map_err(|source_err| CollaboratorError::Fs {
            path: source.to_owned(),
            source: source_err,
        })?;
        let git = |args: &[&str], cwd: &Path| {
            exec::run_checked("git", args, cwd, GIT_TIMEOUT, Output::Log(log), cancel)
        };

        let src = source.to_string_lossy();
        git(&["clone", "--quiet", "--shared", "--no-checkout", &*src, "."], dir.path())?;
        let (p1, p2) = (parent_1.to_string(), parent_2.to_string());
        git(&["branch", "--force", LEFT_BRANCH, p1.as_str()], dir.path())?;
        git(&["branch", "--force", RIGHT_BRANCH, p2.as_str()], dir.path())?;
        git(&["checkout", "--quiet", LEFT_BRANCH], dir.path())?;
        debug!(path = %dir.path().display(), %parent_1, %parent_2, "workdir ready");
        Ok(Self { dir })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Remove the directory now, reporting failure.
    ///
    /// # Errors
    /// The directory could not be fully removed.
    pub fn remove(self) -> Result<(), CollaboratorError> {
        let path: PathBuf = self.dir.path().to_owned();
        self.dir
            .close()
            .map_err(|source| CollaboratorError::Fs { path, source })
    }
}
