//! gix-backed ref listing and rev-parse.

use crate::error::GitError;
use crate::gix_repo::{GixRepo, from_gix_oid};
use crate::types::{GitOid, RefName};

pub fn list_refs(repo: &GixRepo, prefix: &str) -> Result<Vec<(RefName, GitOid)>, GitError> {
    let platform = repo
        .repo
        .references()
        .map_err(|e| GitError::Backend {
            message: e.to_string(),
        })?;
    let refs_iter = platform
        .prefixed(prefix)
        .map_err(|e| GitError::Backend {
            message: e.to_string(),
        })?;

    let mut result = Vec::new();
    for r in refs_iter {
        let mut r = r.map_err(|e| GitError::Backend {
            message: e.to_string(),
        })?;
        let name_str = r.name().as_bstr().to_string();
        // An unresolvable ref is surfaced rather than skipped: the caller
        // decides whether that aborts the repository.
        let id = r.peel_to_id_in_place().map_err(|e| GitError::NotFound {
            message: format!("ref '{name_str}' does not resolve: {e}"),
        })?;
        let oid = from_gix_oid(id.as_ref())?;
        if let Ok(ref_name) = RefName::new(&name_str) {
            result.push((ref_name, oid));
        }
    }
    result.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(result)
}

pub fn rev_parse(repo: &GixRepo, rev: &str) -> Result<GitOid, GitError> {
    let id = repo
        .repo
        .rev_parse_single(rev)
        .map_err(|e| GitError::NotFound {
            message: format!("rev-parse '{rev}': {e}"),
        })?;
    from_gix_oid(id.as_ref())
}
