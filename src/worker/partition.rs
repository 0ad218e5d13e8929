//! Static partitioning of the work list across machines.

use std::fmt;
use std::str::FromStr;

use sha2::{Digest as _, Sha256};

use crate::model::{Classification, RepoSlug};

/// One of `count` disjoint slices of the repository list.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Shard {
    index: u64,
    count: u64,
}

impl Shard {
    /// The whole work list.
    pub const ALL: Self = Self { index: 0, count: 1 };

    /// # Errors
    /// `count` is zero or `index` is not below it.
    pub fn new(index: u64, count: u64) -> Result<Self, ShardParseError> {
        if count == 0 || index >= count {
            return Err(ShardParseError(format!("{index}/{count}")));
        }
        Ok(Self { index, count })
    }

    #[must_use]
    pub const fn index(&self) -> u64 {
        self.index
    }

    #[must_use]
    pub const fn count(&self) -> u64 {
        self.count
    }

    /// `true` if `repo` belongs to this shard. The assignment depends only
    /// on the repository name, so every machine agrees on it.
    #[must_use]
    pub fn owns(&self, repo: &RepoSlug) -> bool {
        stable_hash(repo) % self.count == self.index
    }
}

impl Default for Shard {
    fn default() -> Self {
        Self::ALL
    }
}

impl fmt::Display for Shard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.index, self.count)
    }
}

impl FromStr for Shard {
    type Err = ShardParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || ShardParseError(s.to_owned());
        let (index, count) = s.split_once('/').ok_or_else(err)?;
        let index = index.trim().parse().map_err(|_| err())?;
        let count = count.trim().parse().map_err(|_| err())?;
        Self::new(index, count).map_err(|_| err())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("invalid shard {0:?}: expected i/n with 0 <= i < n")]
pub struct ShardParseError(String);

/// sha256 of `owner/name`, first 8 bytes read big-endian.
fn stable_hash(repo: &RepoSlug) -> u64 {
    let digest = Sha256::digest(repo.to_string().as_bytes());
    let mut head = [0u8; 8];
    head.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(head)
}

/// Which candidates to evaluate by classification.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum TrivialFilter {
    /// Skip trivial merges.
    #[default]
    Exclude,
    Include,
    /// Trivial merges and unrelated-history merges only.
    Only,
}

impl TrivialFilter {
    /// Merges with unrelated histories pass every filter.
    #[must_use]
    pub const fn accepts(self, classification: Classification) -> bool {
        match (self, classification) {
            (_, Classification::TwoInitialCommits) | (Self::Include, _) => true,
            (Self::Exclude, c) => !matches!(c, Classification::Trivial),
            (Self::Only, c) => matches!(c, Classification::Trivial),
        }
    }
}
