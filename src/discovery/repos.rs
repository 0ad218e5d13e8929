//! The input repository list.
//!
//! A CSV file with a header row containing a `repository` column of
//! `owner/name` values. Other columns are ignored.

use std::path::Path;

use tracing::warn;

use super::DiscoveryError;
use super::ledger::parse_record;
use crate::model::RepoSlug;

/// Column holding the repository identifier.
pub const REPOSITORY_COLUMN: &str = "repository";

/// Read the repository list at `path`. Rows whose value is not a valid
/// `owner/name` are skipped with a warning; duplicates keep their first
/// position.
///
/// # Errors
/// [`DiscoveryError::RepoList`] if the file cannot be read or has no
/// `repository` column.
pub fn read_repo_list(path: &Path) -> Result<Vec<RepoSlug>, DiscoveryError> {
    let text = std::fs::read_to_string(path).map_err(|e| DiscoveryError::RepoList {
        path: path.to_owned(),
        message: e.to_string(),
    })?;
    parse_repo_list(&text).map_err(|message| DiscoveryError::RepoList {
        path: path.to_owned(),
        message,
    })
}

fn parse_repo_list(text: &str) -> Result<Vec<RepoSlug>, String> {
    let mut lines = text.lines().enumerate().filter(|(_, l)| !l.trim().is_empty());
    let Some((_, header)) = lines.next() else {
        return Ok(Vec::new());
    };
    let column = parse_record(header)
        .iter()
        .position(|h| h.trim() == REPOSITORY_COLUMN)
        .ok_or_else(|| format!("no '{REPOSITORY_COLUMN}' column in header"))?;

    let mut repos: Vec<RepoSlug> = Vec::new();
    for (i, line) in lines {
        let fields = parse_record(line);
        let Some(value) = fields.get(column) else {
            warn!(line = i + 1, "repository list row too short, skipping");
            continue;
        };
        match RepoSlug::new(value.trim()) {
            Ok(slug) if !repos.contains(&slug) => repos.push(slug),
            Ok(_) => {}
            Err(e) => warn!(line = i + 1, error = %e, "skipping repository list row"),
        }
    }
    Ok(repos)
}
