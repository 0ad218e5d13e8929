//! The per-repository candidate ledger.
//!
//! One CSV file per repository at `<ledger_dir>/<owner>__<name>.csv`:
//!
//! ```text
//! ref_name,merge_commit,parent_1,parent_2,merge_base,classification
//! refs/heads/main,3f2a…,9c1d…,77be…,0a41…,normal
//! refs/pull/12/head,e0c3…,5d2f…,b81a…,,two-initial-commits
//! ```
//!
//! An absent merge base is an empty field. The file is written once, whole,
//! and atomically; its existence means the repository is done. Row order is
//! discovery order and carries no meaning.

use std::path::{Path, PathBuf};

use mergebench_git::{GitOid, RefName};

use super::DiscoveryError;
use crate::fsutil::write_atomic;
use crate::model::{Classification, MergeCandidate, RepoSlug};

/// The header row, a compatibility contract with downstream readers.
pub const HEADER: [&str; 6] = [
    "ref_name",
    "merge_commit",
    "parent_1",
    "parent_2",
    "merge_base",
    "classification",
];

/// Ledger files under one directory.
#[derive(Clone, Debug)]
pub struct Ledger {
    dir: PathBuf,
}

impl Ledger {
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// The ledger file for `repo`.
    #[must_use]
    pub fn path(&self, repo: &RepoSlug) -> PathBuf {
        self.dir.join(format!("{}.csv", repo.file_stem()))
    }

    /// `true` if `repo` already has a ledger and discovery should skip it.
    #[must_use]
    pub fn exists(&self, repo: &RepoSlug) -> bool {
        self.path(repo).is_file()
    }

    /// Write the complete candidate list for `repo`.
    ///
    /// # Errors
    /// [`DiscoveryError::Ledger`] on I/O failure; no partial file is left.
    pub fn write(&self, repo: &RepoSlug, candidates: &[MergeCandidate]) -> Result<(), DiscoveryError> {
        let path = self.path(repo);
        let mut out = format_record(&HEADER);
        for c in candidates {
            let base = c.merge_base.map(|b| b.to_string()).unwrap_or_default();
            out.push_str(&format_record(&[
                c.ref_name.as_str(),
                &c.merge_commit.to_string(),
                &c.parent_1.to_string(),
                &c.parent_2.to_string(),
                &base,
                c.classification.as_str(),
            ]));
        }
        write_atomic(&path, out.as_bytes()).map_err(|source| DiscoveryError::Ledger { path, source })
    }

    /// Read the ledger for `repo`.
    ///
    /// # Errors
    /// [`DiscoveryError::Ledger`] if the file cannot be read and
    /// [`DiscoveryError::LedgerFormat`] for a malformed row.
    pub fn read(&self, repo: &RepoSlug) -> Result<Vec<MergeCandidate>, DiscoveryError> {
        read_file(&self.path(repo))
    }

    /// Every repository with a ledger in this directory, sorted.
    ///
    /// # Errors
    /// [`DiscoveryError::Ledger`] if the directory cannot be listed. A
    /// missing directory is an empty ledger set.
    pub fn repositories(&self) -> Result<Vec<RepoSlug>, DiscoveryError> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(DiscoveryError::Ledger {
                    path: self.dir.clone(),
                    source,
                });
            }
        };
        let mut repos: Vec<RepoSlug> = entries
            .filter_map(Result::ok)
            .filter_map(|e| {
                let name = e.file_name().into_string().ok()?;
                let stem = name.strip_suffix(".csv")?;
                let (owner, repo) = stem.split_once("__")?;
                RepoSlug::new(&format!("{owner}/{repo}")).ok()
            })
            .collect();
        repos.sort();
        Ok(repos)
    }
}

fn read_file(path: &Path) -> Result<Vec<MergeCandidate>, DiscoveryError> {
    let text = std::fs::read_to_string(path).map_err(|source| DiscoveryError::Ledger {
        path: path.to_owned(),
        source,
    })?;
    let bad = |line: usize, message: String| DiscoveryError::LedgerFormat {
        path: path.to_owned(),
        line,
        message,
    };

    let mut rows = text.lines().enumerate().filter(|(_, l)| !l.is_empty());
    match rows.next() {
        Some((_, header)) if parse_record(header) == HEADER => {}
        Some((i, _)) => return Err(bad(i + 1, "unexpected header".to_owned())),
        None => return Ok(Vec::new()),
    }

    let mut out = Vec::new();
    for (i, line) in rows {
        let fields = parse_record(line);
        let [ref_name, merge, p1, p2, base, classification] = fields.as_slice() else {
            return Err(bad(i + 1, format!("expected 6 fields, got {}", fields.len())));
        };
        let oid = |s: &String| s.parse::<GitOid>().map_err(|e| bad(i + 1, e.to_string()));
        let ref_name = RefName::new(ref_name).map_err(|e| bad(i + 1, e.to_string()))?;
        let merge_base = if base.is_empty() { None } else { Some(oid(base)?) };
        let candidate = MergeCandidate::new(ref_name, oid(merge)?, oid(p1)?, oid(p2)?, merge_base);
        let recorded = classification
            .parse::<Classification>()
            .map_err(|e| bad(i + 1, e.to_string()))?;
        if candidate.classification != recorded {
            return Err(bad(
                i + 1,
                format!(
                    "classification '{recorded}' does not match parents and base ('{}')",
                    candidate.classification
                ),
            ));
        }
        out.push(candidate);
    }
    Ok(out)
}

// ---------------------------------------------------------------------------
// CSV records
// ---------------------------------------------------------------------------

/// Format one CSV record terminated by `\n`, quoting fields that contain a
/// comma, a double quote, or a line break.
pub(crate) fn format_record(fields: &[&str]) -> String {
    let mut out = String::new();
    for (i, field) in fields.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        if field.contains([',', '"', '\n', '\r']) {
            out.push('"');
            out.push_str(&field.replace('"', "\"\""));
            out.push('"');
        } else {
            out.push_str(field);
        }
    }
    out.push('\n');
    out
}

/// Split one CSV line into fields, honouring double-quoted fields.
pub(crate) fn parse_record(line: &str) -> Vec<String> {
    let line = line.strip_suffix('\r').unwrap_or(line);
    let mut fields = Vec::new();
    let mut field = String::new();
    let mut quoted = false;
    let mut chars = line.chars().peekable();
    while let Some(c) = chars.next() {
        match (c, quoted) {
            ('"', true) if chars.peek() == Some(&'"') => {
                chars.next();
                field.push('"');
            }
            ('"', true) => quoted = false,
            ('"', false) if field.is_empty() => quoted = true,
            (',', false) => fields.push(std::mem::take(&mut field)),
            _ => field.push(c),
        }
    }
    fields.push(field);
    fields
}
