//! gix-backed object reads.

use gix::revision::walk::Sorting;
use gix::traverse::commit::simple::CommitTimeOrder;
use tracing::trace;

use crate::error::GitError;
use crate::gix_repo::{GixRepo, from_gix_oid, to_gix_oid};
use crate::types::{CommitInfo, GitOid, HistoryEntry};

pub fn read_commit(repo: &GixRepo, oid: GitOid) -> Result<CommitInfo, GitError> {
    let commit = repo
        .repo
        .find_commit(to_gix_oid(oid))
        .map_err(|e| GitError::NotFound {
            message: format!("commit {oid}: {e}"),
        })?;

    let commit_time = commit
        .time()
        .map_err(|e| GitError::Backend {
            message: format!("failed to read commit time of {oid}: {e}"),
        })?
        .seconds;

    let decoded = commit.decode().map_err(|e| GitError::Backend {
        message: format!("failed to decode commit {oid}: {e}"),
    })?;

    let parents = decoded
        .parents()
        .map(|p| from_gix_oid(&p))
        .collect::<Result<Vec<_>, _>>()?;
    let summary = decoded.message_summary().to_string();

    Ok(CommitInfo {
        parents,
        commit_time,
        summary,
    })
}

/// Every ancestor of `tip` (inclusive), newest committer time first, as
/// `git log <tip>` lists them. Parent ids and times come from the walk
/// itself (and the commit-graph file when present), so no commit is read
/// twice.
pub fn history(repo: &GixRepo, tip: GitOid) -> Result<Vec<HistoryEntry>, GitError> {
    let walk = repo
        .repo
        .rev_walk([to_gix_oid(tip)])
        .sorting(Sorting::ByCommitTime(CommitTimeOrder::NewestFirst))
        .all()
        .map_err(|e| GitError::NotFound {
            message: format!("history of {tip}: {e}"),
        })?;

    let mut out = Vec::new();
    for info in walk {
        let info = info.map_err(|e| GitError::NotFound {
            message: format!("history of {tip}: {e}"),
        })?;
        let parents = info
            .parent_ids
            .iter()
            .map(|p| from_gix_oid(p))
            .collect::<Result<Vec<_>, _>>()?;
        out.push(HistoryEntry {
            oid: from_gix_oid(&info.id)?,
            parents,
            commit_time: info.commit_time.unwrap_or_default(),
        });
    }

    trace!(%tip, commits = out.len(), "history walk complete");
    Ok(out)
}
