//! Merge-candidate discovery.
//!
//! For each repository: enumerate refs, drop refs that point at an
//! already-listed commit, walk every remaining ref for two-parent merges,
//! resolve each merge base, and write the ledger. A repository with a
//! ledger is skipped, so an interrupted run resumes where it stopped.

pub mod extract;
pub mod ledger;
pub mod merge_base;
pub mod provider;
pub mod refs;
pub mod repos;

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

use mergebench_git::{GitError, GitOid, GitRepo, GixRepo, RefName};
use thiserror::Error;
use tracing::{error, info, info_span, warn};

use crate::exec::CollaboratorError;
use crate::model::{MergeCandidate, RepoSlug};

pub use extract::extract_candidates;
pub use ledger::Ledger;
pub use provider::{GitCliProvider, RepoProvider};
pub use refs::{dedup_refs, enumerate_refs};
pub use repos::read_repo_list;

/// Errors that abort discovery of one repository. None of them stops a run.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    /// A ref's history could not be walked.
    #[error("ref '{ref_name}' cannot be walked: {source}")]
    UnresolvableRef {
        ref_name: RefName,
        #[source]
        source: GitError,
    },

    /// A merge whose parents are the same commit, or which lists itself as
    /// a parent.
    #[error("merge parents collapse onto a single commit {commit}")]
    SelfMerge { commit: GitOid },

    /// Two distinct parents produced indistinguishable histories.
    #[error("parents {parent_1} and {parent_2} have identical histories")]
    IdenticalHistories { parent_1: GitOid, parent_2: GitOid },

    /// Any other git backend failure.
    #[error(transparent)]
    Git(#[from] GitError),

    /// The ledger could not be read or written.
    #[error("ledger {path}: {source}")]
    Ledger {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A ledger row is malformed.
    #[error("ledger {path} line {line}: {message}")]
    LedgerFormat {
        path: PathBuf,
        line: usize,
        message: String,
    },

    /// The repository list could not be read.
    #[error("repository list {path}: {message}")]
    RepoList { path: PathBuf, message: String },
}

/// Discover every merge candidate in one repository.
///
/// The seen-set is local to this call, so repositories can be processed
/// independently and in parallel.
///
/// # Errors
/// See [`DiscoveryError`]; any error means no ledger should be written.
pub fn discover_repository(repo: &dyn GitRepo) -> Result<Vec<MergeCandidate>, DiscoveryError> {
    let refs = dedup_refs(enumerate_refs(repo)?);
    let mut seen = HashSet::new();
    extract_candidates(repo, &refs, &mut seen)
}

/// What one discovery run did.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DiscoveryReport {
    /// Repositories discovered and written this run.
    pub processed: usize,
    /// Repositories skipped because a ledger already existed.
    pub skipped: usize,
    /// Repositories that failed (clone or discovery) and have no ledger.
    pub failed: usize,
    /// Candidates written across all processed repositories.
    pub candidates: usize,
    /// `true` if the run stopped early on cancellation.
    pub cancelled: bool,
}

/// Runs discovery over a repository list.
pub struct Discovery<'a> {
    ledger: Ledger,
    provider: &'a dyn RepoProvider,
}

impl<'a> Discovery<'a> {
    #[must_use]
    pub fn new(ledger: Ledger, provider: &'a dyn RepoProvider) -> Self {
        Self { ledger, provider }
    }

    /// Process every repository in order. Per-repository failures are
    /// logged and counted; the run continues.
    pub fn run(&self, repos: &[RepoSlug], cancel: &AtomicBool) -> DiscoveryReport {
        let mut report = DiscoveryReport::default();
        for slug in repos {
            if cancel.load(Ordering::SeqCst) {
                warn!("discovery cancelled");
                report.cancelled = true;
                break;
            }
            let _span = info_span!("discover", repo = %slug).entered();
            if self.ledger.exists(slug) {
                info!("ledger exists, skipping");
                report.skipped += 1;
                continue;
            }
            match self.discover_one(slug, cancel) {
                Ok(n) => {
                    info!(candidates = n, "repository done");
                    report.processed += 1;
                    report.candidates += n;
                }
                Err(e) => {
                    error!(error = %format!("{e:#}"), "repository failed, skipping");
                    report.failed += 1;
                }
            }
        }
        report
    }

    fn discover_one(&self, slug: &RepoSlug, cancel: &AtomicBool) -> anyhow::Result<usize> {
        use anyhow::Context as _;

        let path = self.provider.prepare(slug, cancel).context("clone failed")?;
        let repo = GixRepo::open_at(&path).context("opening clone")?;
        let candidates = discover_repository(&repo)?;
        self.ledger.write(slug, &candidates)?;
        Ok(candidates.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mergebench_git::MemoryRepo;

    #[test]
    fn duplicate_ref_credits_first_name() {
        let mut repo = MemoryRepo::new();
        let a = repo.commit("a", &[]);
        let b = repo.commit("b", &[a]);
        let c = repo.commit("c", &[a]);
        let m = repo.commit("m", &[b, c]);
        repo.set_ref("refs/heads/main", m);
        repo.set_ref("refs/remotes/origin/main", m);
        repo.set_ref("refs/pull/1/head", m);

        let found = discover_repository(&repo).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].ref_name.as_str(), "refs/heads/main");
        assert_eq!(found[0].merge_base, Some(a));
    }

    #[test]
    fn pull_request_only_merges_are_found() {
        let mut repo = MemoryRepo::new();
        let a = repo.commit("a", &[]);
        let b = repo.commit("b", &[a]);
        let c = repo.commit("c", &[a]);
        let m = repo.commit("m", &[b, c]);
        repo.set_ref("refs/heads/main", a);
        repo.set_ref("refs/pull/9/head", m);

        let found = discover_repository(&repo).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].ref_name.as_str(), "refs/pull/9/head");
    }

    struct NoClone;

    impl RepoProvider for NoClone {
        fn prepare(&self, repo: &RepoSlug, _: &AtomicBool) -> Result<PathBuf, CollaboratorError> {
            Err(CollaboratorError::Failed {
                program: "clone".to_owned(),
                detail: repo.to_string(),
            })
        }

        fn clone_path(&self, repo: &RepoSlug) -> PathBuf {
            PathBuf::from(repo.file_stem())
        }
    }

    #[test]
    fn run_counts_skips_and_failures() {
        let dir = tempfile::TempDir::new().unwrap();
        let ledger = Ledger::new(dir.path());
        let done = RepoSlug::new("a/done").unwrap();
        let broken = RepoSlug::new("a/broken").unwrap();
        ledger.write(&done, &[]).unwrap();

        let report = Discovery::new(ledger.clone(), &NoClone)
            .run(&[done, broken.clone()], &AtomicBool::new(false));
        assert_eq!(report.skipped, 1);
        assert_eq!(report.failed, 1);
        assert_eq!(report.processed, 0);
        assert!(!ledger.exists(&broken));
    }

    #[test]
    fn run_stops_when_cancelled() {
        let dir = tempfile::TempDir::new().unwrap();
        let report = Discovery::new(Ledger::new(dir.path()), &NoClone)
            .run(&[RepoSlug::new("a/b").unwrap()], &AtomicBool::new(true));
        assert!(report.cancelled);
        assert_eq!(report.failed, 0);
    }
}
