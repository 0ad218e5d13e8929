//! Ref enumeration and deduplication.

use std::collections::HashSet;

use mergebench_git::{GitError, GitOid, GitRepo, RefName};
use tracing::debug;

/// Ref namespaces walked by discovery, in priority order. Within a group
/// refs are sorted by name; the first group to expose a commit wins
/// deduplication.
const REF_GROUPS: &[&str] = &["refs/heads/", "refs/remotes/", "refs/pull/"];

/// Every branch, remote-tracking branch, and pull-request head in discovery
/// order. Symbolic `*/HEAD` pointers are excluded; under `refs/pull/` only
/// `refs/pull/<n>/head` refs are kept.
///
/// # Errors
/// Propagates [`GitError`] from the backend, including refs that do not
/// resolve to a commit.
pub fn enumerate_refs(repo: &dyn GitRepo) -> Result<Vec<(RefName, GitOid)>, GitError> {
    let mut refs = Vec::new();
    for prefix in REF_GROUPS {
        let mut group = repo.list_refs(prefix)?;
        group.retain(|(name, _)| keep_ref(name));
        group.sort_by(|a, b| a.0.cmp(&b.0));
        refs.extend(group);
    }
    Ok(refs)
}

fn keep_ref(name: &RefName) -> bool {
    if name.is_symbolic_head() {
        return false;
    }
    match name.as_str().strip_prefix("refs/pull/") {
        Some(rest) => rest.ends_with("/head"),
        None => true,
    }
}

/// Drop refs whose target commit was already seen, keeping the first ref
/// for each commit and the input order of the survivors.
#[must_use]
pub fn dedup_refs(refs: Vec<(RefName, GitOid)>) -> Vec<(RefName, GitOid)> {
    let mut seen = HashSet::with_capacity(refs.len());
    refs.into_iter()
        .filter(|(name, oid)| {
            let fresh = seen.insert(*oid);
            if !fresh {
                debug!(%name, %oid, "skipping duplicate ref");
            }
            fresh
        })
        .collect()
}
