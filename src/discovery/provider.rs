//! Repository provider: turns an `owner/name` into a local clone with every
//! branch and pull-request head present as a ref.

use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::time::Duration;

use tracing::{info, instrument};

use crate::exec::{self, CollaboratorError, Output};
use crate::model::RepoSlug;

const CLONE_TIMEOUT: Duration = Duration::from_secs(60 * 60);

/// Pull-request heads fetched as first-class refs.
pub const PULL_REFSPEC: &str = "+refs/pull/*/head:refs/pull/*/head";

/// Supplies local clones to discovery and evaluation.
pub trait RepoProvider {
    /// Return a local clone of `repo`, creating or refreshing it as needed.
    ///
    /// # Errors
    /// Any failure means the repository is skipped for this pass; a failed
    /// clone leaves nothing behind.
    fn prepare(&self, repo: &RepoSlug, cancel: &AtomicBool) -> Result<PathBuf, CollaboratorError>;

    /// Where the clone of `repo` lives, whether or not it exists yet.
    fn clone_path(&self, repo: &RepoSlug) -> PathBuf;
}

/// Clones with the `git` CLI. Credentials come from the user's git
/// credential helper.
#[derive(Clone, Debug)]
pub struct GitCliProvider {
    repos_dir: PathBuf,
    url_template: String,
}

impl GitCliProvider {
    #[must_use]
    pub fn new(repos_dir: impl Into<PathBuf>, url_template: impl Into<String>) -> Self {
        Self {
            repos_dir: repos_dir.into(),
            url_template: url_template.into(),
        }
    }

    /// The clone URL for `repo`.
    #[must_use]
    pub fn url(&self, repo: &RepoSlug) -> String {
        self.url_template
            .replace("{owner}", repo.owner())
            .replace("{name}", repo.name())
    }

    fn clone_fresh(&self, repo: &RepoSlug, dest: &Path, cancel: &AtomicBool) -> Result<(), CollaboratorError> {
        let fs_err = |source| CollaboratorError::Fs {
            path: self.repos_dir.clone(),
            source,
        };
        std::fs::create_dir_all(&self.repos_dir).map_err(fs_err)?;
        let staging = tempfile::Builder::new()
            .prefix(&format!(".clone-{}-", repo.file_stem()))
            .tempdir_in(&self.repos_dir)
            .map_err(fs_err)?;
        let target = staging.path().join("repo");
        let target_str = target.to_string_lossy();
        let url = self.url(repo);
        exec::run_checked(
            "git",
            &["clone", "--quiet", "--no-checkout", &url, &*target_str],
            &self.repos_dir,
            CLONE_TIMEOUT,
            Output::Null,
            cancel,
        )?;
        std::fs::rename(&target, dest).map_err(|source| CollaboratorError::Fs {
            path: dest.to_owned(),
            source,
        })?;
        Ok(())
    }
}

impl RepoProvider for GitCliProvider {
    #[instrument(skip(self, cancel), fields(repo = %repo))]
    fn prepare(&self, repo: &RepoSlug, cancel: &AtomicBool) -> Result<PathBuf, CollaboratorError> {
        let dest = self.clone_path(repo);
        if dest.join(".git").is_dir() {
            info!(path = %dest.display(), "refreshing existing clone");
        } else {
            info!(url = %self.url(repo), "cloning");
            self.clone_fresh(repo, &dest, cancel)?;
        }
        exec::run_checked(
            "git",
            &[
                "fetch",
                "--quiet",
                "--prune",
                "origin",
                "+refs/heads/*:refs/remotes/origin/*",
                PULL_REFSPEC,
            ],
            &dest,
            CLONE_TIMEOUT,
            Output::Null,
            cancel,
        )?;
        Ok(dest)
    }

    fn clone_path(&self, repo: &RepoSlug) -> PathBuf {
        self.repos_dir.join(repo.file_stem())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_template_substitution() {
        let provider = GitCliProvider::new("repos", "https://github.com/{owner}/{name}.git");
        let slug = RepoSlug::new("rust-lang/cargo").unwrap();
        assert_eq!(provider.url(&slug), "https://github.com/rust-lang/cargo.git");
        assert_eq!(provider.clone_path(&slug), PathBuf::from("repos/rust-lang__cargo"));
    }

    #[test]
    fn clone_failure_leaves_nothing_behind() {
        let dir = tempfile::TempDir::new().unwrap();
        let provider = GitCliProvider::new(dir.path(), format!("{}/{{owner}}/{{name}}", dir.path().display()));
        let slug = RepoSlug::new("nobody/nothing").unwrap();
        let cancel = AtomicBool::new(false);
        assert!(provider.prepare(&slug, &cancel).is_err());
        let leftovers: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert!(leftovers.is_empty(), "{leftovers:?}");
    }
}
