//! Merge-candidate extraction from a repository's refs.

use std::collections::HashSet;

use mergebench_git::{GitOid, GitRepo, RefName};
use tracing::{debug, instrument};

use super::{DiscoveryError, merge_base};
use crate::model::MergeCandidate;

/// Walk each ref's history and emit every two-parent merge not already in
/// `seen`.
///
/// `seen` is keyed by merge commit alone and spans all refs of one
/// repository. A merge seen on an earlier ref says nothing about the older
/// commits below it on the current ref, so the walk never stops early; each
/// commit is checked individually.
///
/// # Errors
/// Any [`DiscoveryError`] aborts the repository: an unwalkable ref, a merge
/// whose parents coincide, or identical parent histories.
#[instrument(skip_all, fields(refs = refs.len()))]
pub fn extract_candidates(
    repo: &dyn GitRepo,
    refs: &[(RefName, GitOid)],
    seen: &mut HashSet<GitOid>,
) -> Result<Vec<MergeCandidate>, DiscoveryError> {
    let mut candidates = Vec::new();
    for (ref_name, tip) in refs {
        let history = repo
            .history(*tip)
            .map_err(|source| DiscoveryError::UnresolvableRef {
                ref_name: ref_name.clone(),
                source,
            })?;
        let before = candidates.len();
        for entry in history.into_iter().filter(|e| e.is_two_parent_merge()) {
            if seen.contains(&entry.oid) {
                continue;
            }
            let (parent_1, parent_2) = (entry.parents[0], entry.parents[1]);
            if entry.oid == parent_1 || entry.oid == parent_2 {
                return Err(DiscoveryError::SelfMerge { commit: entry.oid });
            }
            let base = merge_base::resolve(repo, parent_1, parent_2)?;
            let candidate =
                MergeCandidate::new(ref_name.clone(), entry.oid, parent_1, parent_2, base);
            debug!(
                merge = %candidate.merge_commit,
                classification = %candidate.classification,
                "merge candidate"
            );
            seen.insert(entry.oid);
            candidates.push(candidate);
        }
        debug!(%ref_name, found = candidates.len() - before, "ref walked");
    }
    Ok(candidates)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Classification;
    use mergebench_git::MemoryRepo;

    fn name(s: &str) -> RefName {
        RefName::new(s).unwrap()
    }

    /// main: a - b - m1(c, d); feature: m1 - e - m2(e, f); f forks from a.
    fn two_merges() -> (MemoryRepo, GitOid, GitOid, GitOid, GitOid) {
        let mut repo = MemoryRepo::new();
        let a = repo.commit("a", &[]);
        let b = repo.commit("b", &[a]);
        let c = repo.commit("c", &[b]);
        let d = repo.commit("d", &[b]);
        let m1 = repo.commit("m1", &[c, d]);
        let e = repo.commit("e", &[m1]);
        let f = repo.commit("f", &[a]);
        let m2 = repo.commit("m2", &[e, f]);
        repo.set_ref("refs/heads/main", m1);
        repo.set_ref("refs/heads/feature", m2);
        (repo, b, m1, m2, a)
    }

    #[test]
    fn emits_each_merge_once_across_refs() {
        let (repo, b, m1, m2, a) = two_merges();
        let refs = vec![
            (name("refs/heads/main"), m1),
            (name("refs/heads/feature"), m2),
        ];
        let mut seen = HashSet::new();
        let found = extract_candidates(&repo, &refs, &mut seen).unwrap();

        assert_eq!(found.len(), 2);
        assert_eq!(found[0].merge_commit, m1);
        assert_eq!(found[0].ref_name, name("refs/heads/main"));
        assert_eq!(found[0].merge_base, Some(b));
        assert_eq!(found[0].classification, Classification::Normal);
        assert_eq!(found[1].merge_commit, m2);
        assert_eq!(found[1].ref_name, name("refs/heads/feature"));
        assert_eq!(found[1].merge_base, Some(a));
        assert_eq!(seen.len(), 2);
    }

    #[test]
    fn seen_merge_does_not_hide_older_commits() {
        let (repo, _, m1, m2, _) = two_merges();
        // m2 is already recorded; m1 sits below it on the same ref.
        let mut seen = HashSet::from([m2]);
        let found =
            extract_candidates(&repo, &[(name("refs/heads/feature"), m2)], &mut seen).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].merge_commit, m1);
    }

    #[test]
    fn fast_forward_merge_is_trivial() {
        let mut repo = MemoryRepo::new();
        let a = repo.commit("a", &[]);
        let b = repo.commit("b", &[a]);
        let m = repo.commit("m", &[a, b]);
        let found = extract_candidates(
            &repo,
            &[(name("refs/heads/main"), m)],
            &mut HashSet::new(),
        )
        .unwrap();
        assert_eq!(found[0].merge_base, Some(a));
        assert_eq!(found[0].classification, Classification::Trivial);
    }

    #[test]
    fn unrelated_parents_are_two_initial_commits() {
        let mut repo = MemoryRepo::new();
        let a = repo.commit("a", &[]);
        let b = repo.commit("b", &[]);
        let m = repo.commit("m", &[a, b]);
        let found = extract_candidates(
            &repo,
            &[(name("refs/heads/main"), m)],
            &mut HashSet::new(),
        )
        .unwrap();
        assert_eq!(found[0].merge_base, None);
        assert_eq!(found[0].classification, Classification::TwoInitialCommits);
    }

    #[test]
    fn duplicate_parents_abort() {
        let mut repo = MemoryRepo::new();
        let a = repo.commit("a", &[]);
        let m = repo.commit("m", &[a, a]);
        let err = extract_candidates(
            &repo,
            &[(name("refs/heads/main"), m)],
            &mut HashSet::new(),
        )
        .unwrap_err();
        assert!(matches!(err, DiscoveryError::SelfMerge { .. }));
    }

    #[test]
    fn unknown_tip_is_unresolvable_ref() {
        let repo = MemoryRepo::new();
        let err = extract_candidates(
            &repo,
            &[(name("refs/heads/gone"), GitOid::from_bytes([7; 20]))],
            &mut HashSet::new(),
        )
        .unwrap_err();
        assert!(matches!(err, DiscoveryError::UnresolvableRef { .. }), "{err}");
    }

    #[test]
    fn octopus_merges_ignored() {
        let mut repo = MemoryRepo::new();
        let a = repo.commit("a", &[]);
        let b = repo.commit("b", &[a]);
        let c = repo.commit("c", &[a]);
        let d = repo.commit("d", &[a]);
        let m = repo.commit("m", &[b, c, d]);
        let found = extract_candidates(
            &repo,
            &[(name("refs/heads/main"), m)],
            &mut HashSet::new(),
        )
        .unwrap();
        assert!(found.is_empty());
    }
}
