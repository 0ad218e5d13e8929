//! The evaluation worker: turns ledger candidates into cached results.
//!
//! Work items are every ledger candidate of every repository in this
//! worker's [`Shard`], crossed with every configured merge tool. Each item is
//! claimed through the [`Coordinator`], evaluated in a fresh [`Workdir`], and
//! recorded as a final entry. Collaborator failures become final statuses;
//! only cancellation leaves a key untouched.

pub mod collab;
pub mod partition;
pub mod workdir;

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use serde_json::json;
use tracing::{error, info, info_span, warn};

pub use collab::{MergeTool, MergeVerdict, ScriptMergeTool, ScriptTestRunner, TestRunner, TestVerdict};
pub use partition::{Shard, TrivialFilter};
pub use workdir::{LEFT_BRANCH, RIGHT_BRANCH, Workdir};

use crate::cache::{CacheKey, ClaimOutcome, Coordinator, FinalEntry, Status, StoreError};
use crate::discovery::{DiscoveryError, Ledger, RepoProvider};
use crate::exec::CollaboratorError;
use crate::model::{MergeCandidate, RepoSlug};

/// One candidate evaluated by one tool.
#[derive(Clone, Copy)]
pub struct WorkItem<'t> {
    pub repository: &'t RepoSlug,
    pub candidate: &'t MergeCandidate,
    pub tool: &'t dyn MergeTool,
}

impl WorkItem<'_> {
    #[must_use]
    pub fn key(&self) -> CacheKey {
        CacheKey::for_candidate(self.repository, self.candidate, self.tool.name(), self.tool.config())
    }
}

impl std::fmt::Debug for WorkItem<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkItem")
            .field("repository", self.repository)
            .field("merge_commit", &self.candidate.merge_commit)
            .field("tool", &self.tool.name())
            .finish()
    }
}

/// Candidates selected for evaluation, grouped by repository.
#[derive(Debug, Default)]
pub struct WorkList {
    repos: Vec<(RepoSlug, Vec<MergeCandidate>)>,
}

impl WorkList {
    /// Read every ledger in this shard and keep the candidates `filter`
    /// accepts.
    ///
    /// # Errors
    /// Unreadable ledger directory or a malformed ledger file.
    pub fn load(ledger: &Ledger, shard: Shard, filter: TrivialFilter) -> Result<Self, DiscoveryError> {
        let mut repos = Vec::new();
        for repo in ledger.repositories()? {
            if !shard.owns(&repo) {
                continue;
            }
            let candidates: Vec<MergeCandidate> = ledger
                .read(&repo)?
                .into_iter()
                .filter(|c| filter.accepts(c.classification))
                .collect();
            if !candidates.is_empty() {
                repos.push((repo, candidates));
            }
        }
        Ok(Self { repos })
    }

    #[must_use]
    pub fn repositories(&self) -> impl Iterator<Item = &RepoSlug> {
        self.repos.iter().map(|(r, _)| r)
    }

    #[must_use]
    pub fn candidate_count(&self) -> usize {
        self.repos.iter().map(|(_, c)| c.len()).sum()
    }

    /// Items for `tools`, repository by repository, candidates in ledger
    /// order, tools in the given order.
    pub fn items<'t>(&'t self, tools: &'t [Box<dyn MergeTool>]) -> impl Iterator<Item = WorkItem<'t>> + 't {
        self.repos.iter().flat_map(move |(repository, candidates)| {
            candidates.iter().flat_map(move |candidate| {
                tools.iter().map(move |tool| WorkItem {
                    repository,
                    candidate,
                    tool: tool.as_ref(),
                })
            })
        })
    }
}

/// Counts from one worker pass.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RunReport {
    /// Items evaluated and recorded by this worker.
    pub completed: usize,
    /// Items already final in the store.
    pub cached: usize,
    /// Items another worker held.
    pub busy: usize,
    /// Items that could not be attempted: clone unavailable or store error.
    pub failed: usize,
    pub by_status: BTreeMap<Status, usize>,
    pub cancelled: bool,
}

/// Knobs for [`Worker`].
#[derive(Clone, Debug)]
pub struct WorkerOptions {
    /// Directory that holds per-item workdirs.
    pub workdir_root: PathBuf,
    pub test_attempts: u32,
}

pub struct Worker<'a> {
    coordinator: &'a Coordinator<'a>,
    provider: &'a dyn RepoProvider,
    tests: &'a dyn TestRunner,
    options: WorkerOptions,
}

impl<'a> Worker<'a> {
    #[must_use]
    pub fn new(
        coordinator: &'a Coordinator<'a>,
        provider: &'a dyn RepoProvider,
        tests: &'a dyn TestRunner,
        options: WorkerOptions,
    ) -> Self {
        Self {
            coordinator,
            provider,
            tests,
            options,
        }
    }

    /// Evaluate every item, stopping early once `cancel` is set.
    pub fn run<'t>(&self, items: impl IntoIterator<Item = WorkItem<'t>>, cancel: &AtomicBool) -> RunReport {
        let mut report = RunReport::default();
        let mut clones: HashMap<&RepoSlug, Option<PathBuf>> = HashMap::new();

        for item in items {
            if cancel.load(Ordering::SeqCst) {
                report.cancelled = true;
                break;
            }
            let span = info_span!("item", repo = %item.repository, merge = %item.candidate.merge_commit.short(), tool = item.tool.name());
            let _enter = span.enter();

            let clone = clones
                .entry(item.repository)
                .or_insert_with(|| match self.provider.prepare(item.repository, cancel) {
                    Ok(path) => Some(path),
                    Err(e) => {
                        error!(error = %e, "repository unavailable, skipping its items");
                        None
                    }
                })
                .clone();
            let Some(clone) = clone else {
                report.failed += 1;
                continue;
            };

            match self.process(&item, &clone, cancel) {
                Ok(Processed::Recorded(status)) => {
                    report.completed += 1;
                    *report.by_status.entry(status).or_default() += 1;
                }
                Ok(Processed::Cached) => report.cached += 1,
                Ok(Processed::Busy) => report.busy += 1,
                Ok(Processed::Cancelled) => {
                    report.cancelled = true;
                    break;
                }
                Err(e) => {
                    error!(error = %e, "store failure");
                    report.failed += 1;
                }
            }
        }
        info!(
            completed = report.completed,
            cached = report.cached,
            busy = report.busy,
            failed = report.failed,
            cancelled = report.cancelled,
            "worker pass finished"
        );
        report
    }

    fn process(&self, item: &WorkItem<'_>, clone: &Path, cancel: &AtomicBool) -> Result<Processed, StoreError> {
        let key = item.key();
        let claim = match self.coordinator.claim(&key, cancel)? {
            ClaimOutcome::AlreadyDone(_) => return Ok(Processed::Cached),
            ClaimOutcome::Busy if cancel.load(Ordering::SeqCst) => return Ok(Processed::Cancelled),
            ClaimOutcome::Busy => return Ok(Processed::Busy),
            ClaimOutcome::Acquired(claim) => claim,
        };

        let log = claim.log_path();
        // A log left by an abandoned attempt would be misleading.
        if let Err(e) = crate::fsutil::remove_if_exists(&log) {
            warn!(path = %log.display(), error = %e, "failed to remove previous log");
        }
        let evaluated = claim.keep_alive(|| self.evaluate(item, clone, &log, cancel));
        let (status, mut payload) = match evaluated {
            Ok(result) => result,
            Err(CollaboratorError::Cancelled { .. }) => {
                warn!("cancelled mid-evaluation, releasing key");
                return Ok(Processed::Cancelled);
            }
            Err(e) => {
                warn!(error = %e, "collaborator failure recorded as error");
                (Status::Error, json!({ "error": e.to_string() }))
            }
        };
        if let Some(obj) = payload.as_object_mut() {
            obj.insert("log".to_owned(), json!(log.to_string_lossy()));
        }
        let entry = FinalEntry::new(key, status, Some(item.candidate.classification), payload);
        claim.complete(&entry)?;
        Ok(Processed::Recorded(status))
    }

    /// Merge, then test if the merge succeeded.
    fn evaluate(
        &self,
        item: &WorkItem<'_>,
        clone: &Path,
        log: &Path,
        cancel: &AtomicBool,
    ) -> Result<(Status, serde_json::Value), CollaboratorError> {
        let c = item.candidate;
        let workdir = Workdir::prepare(clone, &self.options.workdir_root, c.parent_1, c.parent_2, log, cancel)?;
        let result = self.evaluate_in(item.tool, workdir.path(), log, cancel);
        if let Err(e) = workdir.remove() {
            warn!(error = %e, "failed to remove workdir");
        }
        result
    }

    fn evaluate_in(
        &self,
        tool: &dyn MergeTool,
        workdir: &Path,
        log: &Path,
        cancel: &AtomicBool,
    ) -> Result<(Status, serde_json::Value), CollaboratorError> {
        let merge = tool.merge(workdir, LEFT_BRANCH, RIGHT_BRANCH, log, cancel)?;
        let merge_json = json!({
            "verdict": merge.verdict,
            "exit_code": merge.exit_code,
            "secs": merge.elapsed.as_secs_f64(),
        });
        let status = match merge.verdict {
            MergeVerdict::Conflict => Status::Conflict,
            MergeVerdict::Failed => Status::Error,
            MergeVerdict::TimedOut => Status::Timeout,
            MergeVerdict::Merged => {
                let attempts = collab::run_tests(self.tests, self.options.test_attempts, workdir, log, cancel)?;
                let status = match attempts.last().map(|a| a.verdict) {
                    Some(TestVerdict::Passed) => Status::Success,
                    Some(TestVerdict::TimedOut) => Status::Timeout,
                    Some(TestVerdict::Failed) | None => Status::TestFailed,
                };
                let tests: Vec<_> = attempts
                    .iter()
                    .map(|a| json!({ "verdict": a.verdict, "secs": a.elapsed.as_secs_f64() }))
                    .collect();
                return Ok((status, json!({ "merge": merge_json, "tests": tests })));
            }
        };
        Ok((status, json!({ "merge": merge_json, "tests": [] })))
    }
}

enum Processed {
    Recorded(Status),
    Cached,
    Busy,
    Cancelled,
}
