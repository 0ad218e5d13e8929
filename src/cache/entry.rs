//! Cache entries.
//!
//! A key moves `absent -> in progress -> final`. Curation may move a final
//! key back to absent; nothing else is legal. An in-progress marker is a
//! distinct variant so it can never be mistaken for a result.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::key::CacheKey;
use crate::model::Classification;

/// Final outcome of one evaluation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    /// Merged cleanly and the tests passed.
    Success,
    /// The tool reported a merge conflict.
    Conflict,
    /// Merged cleanly but every test attempt failed.
    TestFailed,
    /// The merge or a test attempt hit its time limit.
    Timeout,
    /// The tool or the harness failed.
    Error,
}

impl Status {
    pub const ALL: [Self; 5] = [
        Self::Success,
        Self::Conflict,
        Self::TestFailed,
        Self::Timeout,
        Self::Error,
    ];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Conflict => "conflict",
            Self::TestFailed => "test_failed",
            Self::Timeout => "timeout",
            Self::Error => "error",
        }
    }

    /// Anything but [`Status::Success`].
    #[must_use]
    pub const fn is_failure(self) -> bool {
        !matches!(self, Self::Success)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Status {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| {
                format!(
                    "unknown status '{s}' (expected one of: success, conflict, test_failed, timeout, error)"
                )
            })
    }
}

/// Marks a key whose computation is running.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Placeholder {
    pub key: CacheKey,
    /// Token of the lock held while computing.
    pub owner: String,
    pub host: String,
    pub pid: u32,
    pub started_at_ms: u64,
}

/// A completed evaluation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalEntry {
    pub key: CacheKey,
    pub status: Status,
    /// Classification of the merge, used by curation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub classification: Option<Classification>,
    pub created_at_ms: u64,
    /// Tool-specific detail: timings, exit codes, log reference.
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl FinalEntry {
    #[must_use]
    pub fn new(key: CacheKey, status: Status, classification: Option<Classification>, payload: serde_json::Value) -> Self {
        Self {
            key,
            status,
            classification,
            created_at_ms: super::now_ms(),
            payload,
        }
    }
}

/// What a reader sees for a key.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum CacheEntry {
    InProgress(Placeholder),
    Final(FinalEntry),
}

impl CacheEntry {
    /// The final result, if there is one.
    #[must_use]
    pub const fn as_final(&self) -> Option<&FinalEntry> {
        match self {
            Self::Final(entry) => Some(entry),
            Self::InProgress(_) => None,
        }
    }

    #[must_use]
    pub const fn is_in_progress(&self) -> bool {
        matches!(self, Self::InProgress(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::RepoSlug;
    use mergebench_git::GitOid;

    fn key() -> CacheKey {
        CacheKey {
            repository: RepoSlug::new("a/b").unwrap(),
            merge_commit: GitOid::from_bytes([3; 20]),
            parent_1: GitOid::from_bytes([1; 20]),
            parent_2: GitOid::from_bytes([2; 20]),
            tool: "git".to_owned(),
            config: String::new(),
        }
    }

    #[test]
    fn status_strings() {
        for s in Status::ALL {
            assert_eq!(s.as_str().parse::<Status>().unwrap(), s);
            assert_eq!(serde_json::to_string(&s).unwrap(), format!("\"{s}\""));
        }
        assert!("placeholder".parse::<Status>().is_err());
        assert!(!Status::Success.is_failure());
        assert!(Status::Timeout.is_failure());
    }

    #[test]
    fn entry_tags_state() {
        let entry = CacheEntry::Final(FinalEntry::new(
            key(),
            Status::Conflict,
            Some(Classification::Normal),
            serde_json::json!({"merge_secs": 1.5}),
        ));
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["state"], "final");
        assert_eq!(json["status"], "conflict");
        let back: CacheEntry = serde_json::from_value(json).unwrap();
        assert_eq!(back, entry);
        assert!(back.as_final().is_some());
    }

    #[test]
    fn placeholder_is_never_final() {
        let entry = CacheEntry::InProgress(Placeholder {
            key: key(),
            owner: "t".to_owned(),
            host: "h".to_owned(),
            pid: 1,
            started_at_ms: 0,
        });
        assert!(entry.as_final().is_none());
        assert!(entry.is_in_progress());
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["state"], "in_progress");
    }
}
