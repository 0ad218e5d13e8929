//! Nearest-common-ancestor resolution for the two parents of a merge.
//!
//! The base is found by comparing the two parents' date-ordered histories
//! from the oldest end. When a criss-cross history has several best merge
//! bases, whichever one the shared prefix ends on is returned; no virtual
//! base is synthesised.

use std::collections::HashSet;

use mergebench_git::{GitOid, GitRepo};

use super::DiscoveryError;

/// Resolve the merge base of `parent_1` and `parent_2`.
///
/// Returns `Ok(None)` when the parents share no history (for example a
/// repository with two initial commits).
///
/// # Errors
/// [`DiscoveryError::SelfMerge`] if the parents are the same commit,
/// [`DiscoveryError::IdenticalHistories`] if the walks cannot be told apart,
/// and [`DiscoveryError::Git`] if either history cannot be read.
pub fn resolve(
    repo: &dyn GitRepo,
    parent_1: GitOid,
    parent_2: GitOid,
) -> Result<Option<GitOid>, DiscoveryError> {
    if parent_1 == parent_2 {
        return Err(DiscoveryError::SelfMerge { commit: parent_1 });
    }
    let history_1: Vec<GitOid> = repo.history(parent_1)?.into_iter().map(|e| e.oid).collect();
    let history_2: Vec<GitOid> = repo.history(parent_2)?.into_iter().map(|e| e.oid).collect();
    from_histories(&history_1, &history_2)
}

/// Resolve the merge base from two newest-first histories, each starting
/// with its parent.
///
/// # Errors
/// See [`resolve`].
pub fn from_histories(
    history_1: &[GitOid],
    history_2: &[GitOid],
) -> Result<Option<GitOid>, DiscoveryError> {
    let (Some(&parent_1), Some(&parent_2)) = (history_1.first(), history_2.first()) else {
        return Ok(None);
    };
    if parent_1 == parent_2 {
        return Err(DiscoveryError::SelfMerge { commit: parent_1 });
    }

    // Fast-forward: one parent is an ancestor of the other.
    if history_1.iter().collect::<HashSet<_>>().contains(&parent_2) {
        return Ok(Some(parent_2));
    }
    if history_2.iter().collect::<HashSet<_>>().contains(&parent_1) {
        return Ok(Some(parent_1));
    }

    let shared = history_1
        .iter()
        .rev()
        .zip(history_2.iter().rev())
        .take_while(|(a, b)| a == b)
        .count();

    if shared == 0 {
        return Ok(None);
    }
    if shared == history_1.len() || shared == history_2.len() {
        return Err(DiscoveryError::IdenticalHistories {
            parent_1,
            parent_2,
        });
    }
    Ok(Some(history_1[history_1.len() - shared]))
}
