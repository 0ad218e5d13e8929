//! The gix-backed implementation of [`GitRepo`].

use std::path::{Path, PathBuf};

use crate::error::GitError;
use crate::repo::GitRepo;
use crate::types::{CommitInfo, GitOid, HistoryEntry, RefName};

/// A [`GitRepo`] implementation backed by [gix](https://github.com/GitoxideLabs/gitoxide).
///
/// Construct via [`GixRepo::open`] or [`GixRepo::open_at`].
pub struct GixRepo {
    pub(crate) repo: gix::Repository,
    pub(crate) path: PathBuf,
}

impl GixRepo {
    /// Open the git repository at or above `path`.
    ///
    /// # Errors
    /// Returns [`GitError::Backend`] if no repository is found.
    pub fn open(path: &Path) -> Result<Self, GitError> {
        let repo = gix::open(path).map_err(|e| GitError::Backend { message: e.to_string() })?;
        Ok(Self {
            repo,
            path: path.to_path_buf(),
        })
    }

    /// Open a git repository at exactly `path` (no parent discovery, no
    /// global configuration).
    ///
    /// # Errors
    /// Returns [`GitError::Backend`] if `path` is not a repository.
    pub fn open_at(path: &Path) -> Result<Self, GitError> {
        let repo = gix::open_opts(path, gix::open::Options::isolated())
            .map_err(|e| GitError::Backend { message: e.to_string() })?;
        Ok(Self {
            repo,
            path: path.to_path_buf(),
        })
    }

    /// The path this repository was opened from.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl std::fmt::Debug for GixRepo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GixRepo").field("path", &self.path).finish()
    }
}

impl GitRepo for GixRepo {
    // === Refs ===
    fn list_refs(&self, prefix: &str) -> Result<Vec<(RefName, GitOid)>, GitError> {
        crate::refs_impl::list_refs(self, prefix)
    }

    fn rev_parse(&self, rev: &str) -> Result<GitOid, GitError> {
        crate::refs_impl::rev_parse(self, rev)
    }

    // === Objects ===
    fn read_commit(&self, oid: GitOid) -> Result<CommitInfo, GitError> {
        crate::objects_impl::read_commit(self, oid)
    }

    // === Ancestry ===
    fn history(&self, tip: GitOid) -> Result<Vec<HistoryEntry>, GitError> {
        crate::objects_impl::history(self, tip)
    }
}

/// Convert a `GitOid` to a `gix::ObjectId`.
pub(crate) const fn to_gix_oid(oid: GitOid) -> gix::ObjectId {
    gix::ObjectId::Sha1(*oid.as_bytes())
}

/// Convert a `gix::ObjectId` (or `&gix::oid`) to a `GitOid`.
///
/// Only SHA-1 object stores are supported.
pub(crate) fn from_gix_oid(oid: &gix::oid) -> Result<GitOid, GitError> {
    let bytes: [u8; 20] = oid
        .as_bytes()
        .try_into()
        .map_err(|_| GitError::InvalidOid {
            value: oid.to_string(),
            reason: "only SHA-1 object ids are supported".to_owned(),
        })?;
    Ok(GitOid::from_bytes(bytes))
}
