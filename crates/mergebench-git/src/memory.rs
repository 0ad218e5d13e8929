//! In-memory commit graph.
//!
//! [`MemoryRepo`] implements [`GitRepo`] over a `HashMap` of commits so the
//! discovery engine can be exercised against hand-built graphs (criss-cross
//! merges, disjoint roots, duplicate refs) without touching the filesystem.

use std::collections::{BTreeMap, HashMap};

use crate::error::GitError;
use crate::repo::GitRepo;
use crate::types::{CommitInfo, GitOid, RefName};

/// An in-memory repository. Commit OIDs are synthetic but unique.
#[derive(Clone, Debug, Default)]
pub struct MemoryRepo {
    commits: HashMap<GitOid, CommitInfo>,
    refs: BTreeMap<RefName, GitOid>,
    clock: i64,
}

impl MemoryRepo {
    /// Create an empty repository.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a commit one tick after the previous one and return its OID.
    pub fn commit(&mut self, summary: &str, parents: &[GitOid]) -> GitOid {
        self.clock += 1;
        let time = self.clock;
        self.commit_at(summary, parents, time)
    }

    /// Add a commit with an explicit committer timestamp.
    pub fn commit_at(&mut self, summary: &str, parents: &[GitOid], commit_time: i64) -> GitOid {
        let n = self.commits.len() as u64 + 1;
        let mut bytes = [0u8; 20];
        bytes[..8].copy_from_slice(&n.to_be_bytes());
        bytes[19] = 0xc0;
        let oid = GitOid::from_bytes(bytes);
        self.commits.insert(
            oid,
            CommitInfo {
                parents: parents.to_vec(),
                commit_time,
                summary: summary.to_owned(),
            },
        );
        oid
    }

    /// Point `name` at `oid`, creating or overwriting the ref.
    ///
    /// # Panics
    /// Panics if `name` is not a valid ref name; intended for test setup.
    pub fn set_ref(&mut self, name: &str, oid: GitOid) {
        let name = RefName::new(name).unwrap_or_else(|e| panic!("{e}"));
        self.refs.insert(name, oid);
    }

    /// Number of commits in the graph.
    #[must_use]
    pub fn len(&self) -> usize {
        self.commits.len()
    }

    /// `true` if no commit has been added.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.commits.is_empty()
    }
}

impl GitRepo for MemoryRepo {
    fn list_refs(&self, prefix: &str) -> Result<Vec<(RefName, GitOid)>, GitError> {
        Ok(self
            .refs
            .iter()
            .filter(|(name, _)| name.as_str().starts_with(prefix))
            .map(|(name, oid)| (name.clone(), *oid))
            .collect())
    }

    fn rev_parse(&self, rev: &str) -> Result<GitOid, GitError> {
        if let Ok(name) = RefName::new(rev)
            && let Some(oid) = self.refs.get(&name)
        {
            return Ok(*oid);
        }
        match rev.parse::<GitOid>() {
            Ok(oid) if self.commits.contains_key(&oid) => Ok(oid),
            _ => Err(GitError::NotFound {
                message: format!("rev-parse '{rev}'"),
            }),
        }
    }

    fn read_commit(&self, oid: GitOid) -> Result<CommitInfo, GitError> {
        self.commits.get(&oid).cloned().ok_or_else(|| GitError::NotFound {
            message: format!("commit {oid}"),
        })
    }
}
