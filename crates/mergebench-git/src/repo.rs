//! The [`GitRepo`] trait - the single abstraction boundary between the
//! discovery engine and git.
//!
//! Discovery only ever *reads* a repository, so the trait is deliberately
//! narrow:
//!
//! | Group     | Methods                      |
//! |-----------|------------------------------|
//! | Refs      | `list_refs`, `rev_parse`     |
//! | Objects   | `read_commit`                |
//! | Ancestry  | `history`                    |

use crate::error::GitError;
use crate::types::{CommitInfo, GitOid, HistoryEntry, RefName};

/// The git abstraction trait used by the discovery engine.
///
/// Implementations may be backed by gix (the production backend) or by the
/// in-memory [`MemoryRepo`](crate::MemoryRepo) test double.
///
/// # Object safety
///
/// This trait is object-safe: no generic methods, no `Self` in return position
/// outside of `Result`. Callers may use `&dyn GitRepo` or `Box<dyn GitRepo>`.
pub trait GitRepo {
    // -----------------------------------------------------------------------
    // Refs
    //
    // Replaces: git for-each-ref, git rev-parse
    // -----------------------------------------------------------------------

    /// List refs matching a prefix (e.g., `"refs/heads/"`, `"refs/pull/"`).
    ///
    /// Returns `(ref_name, oid)` pairs sorted by ref name, each ref peeled to
    /// the commit it ultimately points at. The prefix is matched literally.
    ///
    /// Replaces: `git for-each-ref --format=... refs/some/prefix/`.
    fn list_refs(&self, prefix: &str) -> Result<Vec<(RefName, GitOid)>, GitError>;

    /// Resolve a revision specification to an OID.
    ///
    /// Returns [`GitError::NotFound`] if the revision cannot be resolved.
    ///
    /// Replaces: `git rev-parse <rev>`.
    fn rev_parse(&self, rev: &str) -> Result<GitOid, GitError>;

    // -----------------------------------------------------------------------
    // Objects
    // -----------------------------------------------------------------------

    /// Read a commit object's parents, timestamp, and summary line.
    ///
    /// Returns [`GitError::NotFound`] if `oid` is not a commit in this
    /// repository.
    ///
    /// Replaces: `git cat-file commit <oid>` / `git log -1 --format=...`.
    fn read_commit(&self, oid: GitOid) -> Result<CommitInfo, GitError>;

    // -----------------------------------------------------------------------
    // Ancestry
    // -----------------------------------------------------------------------

    /// Every commit reachable from `tip` (including `tip`), most recent
    /// first.
    ///
    /// The default implementation performs the date-ordered walk in
    /// [`walk::date_ordered`](crate::walk::date_ordered) on top of
    /// [`read_commit`](Self::read_commit). Backends with a native walker
    /// override it, keeping newest-first committer-time order.
    ///
    /// Replaces: `git log <tip>`.
    fn history(&self, tip: GitOid) -> Result<Vec<HistoryEntry>, GitError> {
        crate::walk::date_ordered(self, tip)
    }
}
