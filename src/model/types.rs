//! Core mergebench types.
//!
//! Repository identifiers, merge-candidate classification, and the
//! [`MergeCandidate`] record produced by discovery and consumed by the
//! evaluation worker.

use std::fmt;
use std::str::FromStr;

use mergebench_git::{GitOid, RefName};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// RepoSlug
// ---------------------------------------------------------------------------

/// A hosted repository identifier of the form `owner/name`.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RepoSlug {
    owner: String,
    name: String,
}

impl RepoSlug {
    /// Parse `owner/name`.
    ///
    /// # Errors
    /// Returns an error unless the value contains exactly one `/` with a
    /// non-empty segment on each side, made of characters a hosting platform
    /// allows in owner and repository names.
    pub fn new(s: &str) -> Result<Self, ValidationError> {
        let invalid = |reason: &str| ValidationError {
            kind: ErrorKind::RepoSlug,
            value: s.to_owned(),
            reason: reason.to_owned(),
        };
        let mut parts = s.split('/');
        let (Some(owner), Some(name), None) = (parts.next(), parts.next(), parts.next()) else {
            return Err(invalid("expected exactly one '/' (owner/name)"));
        };
        if owner.is_empty() || name.is_empty() {
            return Err(invalid("owner and name must not be empty"));
        }
        if !owner.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
            return Err(invalid("owner may contain only ASCII letters, digits and '-'"));
        }
        if !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        {
            return Err(invalid(
                "name may contain only ASCII letters, digits, '-', '_' and '.'",
            ));
        }
        if name == "." || name == ".." {
            return Err(invalid("name must not be '.' or '..'"));
        }
        Ok(Self {
            owner: owner.to_owned(),
            name: name.to_owned(),
        })
    }

    /// The owning user or organisation.
    #[must_use]
    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// The repository name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// A single path component naming this repository on disk
    /// (`owner__name`). Owners never contain `_`, so distinct slugs never
    /// share a stem.
    #[must_use]
    pub fn file_stem(&self) -> String {
        format!("{}__{}", self.owner, self.name)
    }
}

impl fmt::Display for RepoSlug {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.name)
    }
}

impl FromStr for RepoSlug {
    type Err = ValidationError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for RepoSlug {
    type Error = ValidationError;
    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::new(&s)
    }
}

impl From<RepoSlug> for String {
    fn from(slug: RepoSlug) -> Self {
        slug.to_string()
    }
}

// ---------------------------------------------------------------------------
// Classification
// ---------------------------------------------------------------------------

/// How a merge relates to its merge base.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Classification {
    /// The merge base is one of the parents: a merge in name only.
    Trivial,
    /// The parents share no ancestor.
    TwoInitialCommits,
    /// A genuine three-way merge.
    Normal,
}

impl Classification {
    /// Classify a merge of `parent_1` and `parent_2` with the given base.
    #[must_use]
    pub fn of(parent_1: GitOid, parent_2: GitOid, merge_base: Option<GitOid>) -> Self {
        match merge_base {
            None => Self::TwoInitialCommits,
            Some(base) if base == parent_1 || base == parent_2 => Self::Trivial,
            Some(_) => Self::Normal,
        }
    }

    /// The ledger spelling.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Trivial => "trivial",
            Self::TwoInitialCommits => "two-initial-commits",
            Self::Normal => "normal",
        }
    }
}

impl fmt::Display for Classification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Classification {
    type Err = ValidationError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "trivial" => Ok(Self::Trivial),
            "two-initial-commits" => Ok(Self::TwoInitialCommits),
            "normal" => Ok(Self::Normal),
            _ => Err(ValidationError {
                kind: ErrorKind::Classification,
                value: s.to_owned(),
                reason: "expected 'trivial', 'two-initial-commits' or 'normal'".to_owned(),
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// MergeCandidate
// ---------------------------------------------------------------------------

/// A two-parent merge commit selected for evaluation.
///
/// `parent_1` and `parent_2` keep the merge commit's own parent order.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct MergeCandidate {
    /// The ref under which the merge was first discovered.
    pub ref_name: RefName,
    /// The merge commit.
    pub merge_commit: GitOid,
    /// First parent.
    pub parent_1: GitOid,
    /// Second parent.
    pub parent_2: GitOid,
    /// Nearest common ancestor, absent for unrelated histories.
    pub merge_base: Option<GitOid>,
    /// Derived from the parents and the base.
    pub classification: Classification,
}

impl MergeCandidate {
    /// Build a candidate, deriving its classification.
    #[must_use]
    pub fn new(
        ref_name: RefName,
        merge_commit: GitOid,
        parent_1: GitOid,
        parent_2: GitOid,
        merge_base: Option<GitOid>,
    ) -> Self {
        Self {
            ref_name,
            merge_commit,
            parent_1,
            parent_2,
            merge_base,
            classification: Classification::of(parent_1, parent_2, merge_base),
        }
    }
}

// ---------------------------------------------------------------------------
// ValidationError
// ---------------------------------------------------------------------------

/// Which type failed validation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// A [`RepoSlug`].
    RepoSlug,
    /// A [`Classification`].
    Classification,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RepoSlug => write!(f, "repository"),
            Self::Classification => write!(f, "classification"),
        }
    }
}

/// A value failed validation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ValidationError {
    /// Which type rejected the value.
    pub kind: ErrorKind,
    /// The raw value.
    pub value: String,
    /// Why it was rejected.
    pub reason: String,
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid {} {:?}: {}", self.kind, self.value, self.reason)
    }
}

impl std::error::Error for ValidationError {}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn oid(b: u8) -> GitOid {
        GitOid::from_bytes([b; 20])
    }

    #[test]
    fn slug_parses_owner_and_name() {
        let slug: RepoSlug = "apache/commons-lang".parse().unwrap();
        assert_eq!(slug.owner(), "apache");
        assert_eq!(slug.name(), "commons-lang");
        assert_eq!(slug.to_string(), "apache/commons-lang");
        assert_eq!(slug.file_stem(), "apache__commons-lang");
    }

    #[test]
    fn slug_rejects_wrong_shape() {
        for bad in ["", "nouser", "a/b/c", "/name", "owner/", "a b/c", "a_b/c", "a/.."] {
            let err = RepoSlug::new(bad).unwrap_err();
            assert_eq!(err.kind, ErrorKind::RepoSlug, "{bad}");
        }
    }

    #[test]
    fn slug_serde_as_string() {
        let slug = RepoSlug::new("o/n").unwrap();
        let json = serde_json::to_string(&slug).unwrap();
        assert_eq!(json, "\"o/n\"");
        assert!(serde_json::from_str::<RepoSlug>("\"bad\"").is_err());
    }

    #[test]
    fn classification_rules() {
        let (p1, p2, b) = (oid(1), oid(2), oid(3));
        assert_eq!(Classification::of(p1, p2, Some(p1)), Classification::Trivial);
        assert_eq!(Classification::of(p1, p2, Some(p2)), Classification::Trivial);
        assert_eq!(Classification::of(p1, p2, None), Classification::TwoInitialCommits);
        assert_eq!(Classification::of(p1, p2, Some(b)), Classification::Normal);
    }

    #[test]
    fn classification_string_roundtrip() {
        for c in [
            Classification::Trivial,
            Classification::TwoInitialCommits,
            Classification::Normal,
        ] {
            assert_eq!(c.as_str().parse::<Classification>().unwrap(), c);
            assert_eq!(
                serde_json::to_string(&c).unwrap(),
                format!("\"{}\"", c.as_str())
            );
        }
        assert!("weird".parse::<Classification>().is_err());
    }

    #[test]
    fn candidate_derives_classification() {
        let c = MergeCandidate::new(
            RefName::new("refs/heads/main").unwrap(),
            oid(9),
            oid(1),
            oid(2),
            Some(oid(1)),
        );
        assert_eq!(c.classification, Classification::Trivial);
    }
}
