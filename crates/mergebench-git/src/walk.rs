//! Date-ordered history walk over any [`GitRepo`].
//!
//! This is the default [`GitRepo::history`] and the path taken by
//! [`MemoryRepo`](crate::memory::MemoryRepo). [`GixRepo`](crate::GixRepo)
//! overrides it with gix's own revision walk.
//!
//! Produces the same order as plain `git log <tip>`: a priority queue keyed on
//! committer time, newest first, with ties broken by discovery order. A
//! commit is emitted exactly once even when reachable through several
//! parents.

use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashSet};

use tracing::trace;

use crate::error::GitError;
use crate::repo::GitRepo;
use crate::types::{CommitInfo, GitOid, HistoryEntry};

/// A queued commit. Heap order is time (newest first), then insertion
/// sequence (earliest first); the payload does not take part in ordering.
struct Pending {
    time: i64,
    seq: Reverse<u64>,
    oid: GitOid,
    info: CommitInfo,
}

impl PartialEq for Pending {
    fn eq(&self, other: &Self) -> bool {
        self.time == other.time && self.seq == other.seq
    }
}

impl Eq for Pending {}

impl Ord for Pending {
    fn cmp(&self, other: &Self) -> Ordering {
        self.time
            .cmp(&other.time)
            .then_with(|| self.seq.cmp(&other.seq))
    }
}

impl PartialOrd for Pending {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Walk every ancestor of `tip` (inclusive), newest first.
///
/// # Errors
/// Returns [`GitError::NotFound`] if `tip` or any ancestor cannot be read.
pub fn date_ordered<R: GitRepo + ?Sized>(
    repo: &R,
    tip: GitOid,
) -> Result<Vec<HistoryEntry>, GitError> {
    let mut out = Vec::new();
    let mut queued: HashSet<GitOid> = HashSet::new();
    let mut heap = BinaryHeap::new();
    let mut seq = 0u64;

    let info = repo.read_commit(tip)?;
    queued.insert(tip);
    heap.push(Pending {
        time: info.commit_time,
        seq: Reverse(seq),
        oid: tip,
        info,
    });

    while let Some(Pending { oid, info, .. }) = heap.pop() {
        for &parent in &info.parents {
            if queued.insert(parent) {
                seq += 1;
                let parent_info = repo.read_commit(parent)?;
                heap.push(Pending {
                    time: parent_info.commit_time,
                    seq: Reverse(seq),
                    oid: parent,
                    info: parent_info,
                });
            }
        }
        out.push(HistoryEntry {
            oid,
            parents: info.parents,
            commit_time: info.commit_time,
        });
    }

    trace!(%tip, commits = out.len(), "history walk complete");
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryRepo;

    #[test]
    fn linear_history_is_newest_first() {
        let mut repo = MemoryRepo::new();
        let a = repo.commit("a", &[]);
        let b = repo.commit("b", &[a]);
        let c = repo.commit("c", &[b]);

        let oids: Vec<_> = date_ordered(&repo, c).unwrap().iter().map(|e| e.oid).collect();
        assert_eq!(oids, vec![c, b, a]);
    }

    #[test]
    fn shared_ancestor_emitted_once() {
        let mut repo = MemoryRepo::new();
        let a = repo.commit("a", &[]);
        let b = repo.commit("b", &[a]);
        let c = repo.commit("c", &[a]);
        let m = repo.commit("m", &[b, c]);

        let history = date_ordered(&repo, m).unwrap();
        assert_eq!(history.len(), 4);
        assert_eq!(history[0].oid, m);
        assert_eq!(history[3].oid, a);
        assert!(history[0].is_two_parent_merge());
    }

    #[test]
    fn unknown_tip_is_not_found() {
        let repo = MemoryRepo::new();
        let err = date_ordered(&repo, GitOid::from_bytes([9; 20])).unwrap_err();
        assert!(matches!(err, GitError::NotFound { .. }));
    }
}
