//! Cache keys and their content digests.

use std::fmt;
use std::str::FromStr;

use mergebench_git::GitOid;
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};

use crate::model::{MergeCandidate, RepoSlug};

/// Identifies one evaluation: a merge scenario run through one tool
/// configuration.
///
/// Parent order is significant: swapping the parents is a different key.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CacheKey {
    pub repository: RepoSlug,
    pub merge_commit: GitOid,
    pub parent_1: GitOid,
    pub parent_2: GitOid,
    pub tool: String,
    pub config: String,
}

/// Domain separator so digests never collide with other sha256 users of
/// the same store.
const KEY_DOMAIN: &[u8] = b"mergebench-cache-key-v1";

impl CacheKey {
    /// The key for evaluating `candidate` in `repository` with `tool`.
    #[must_use]
    pub fn for_candidate(repository: &RepoSlug, candidate: &MergeCandidate, tool: &str, config: &str) -> Self {
        Self {
            repository: repository.clone(),
            merge_commit: candidate.merge_commit,
            parent_1: candidate.parent_1,
            parent_2: candidate.parent_2,
            tool: tool.to_owned(),
            config: config.to_owned(),
        }
    }

    /// The stable content digest addressing this key in a store.
    ///
    /// Every field is length-prefixed, so no two distinct keys share an
    /// encoding.
    #[must_use]
    pub fn digest(&self) -> Digest {
        let mut hasher = Sha256::new();
        let mut field = |bytes: &[u8]| {
            hasher.update((bytes.len() as u64).to_be_bytes());
            hasher.update(bytes);
        };
        field(KEY_DOMAIN);
        field(self.repository.to_string().as_bytes());
        field(self.merge_commit.as_bytes());
        field(self.parent_1.as_bytes());
        field(self.parent_2.as_bytes());
        field(self.tool.as_bytes());
        field(self.config.as_bytes());
        Digest(format!("{:x}", hasher.finalize()))
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}@{} ({}+{}) {}[{}]",
            self.repository,
            self.merge_commit.short(),
            self.parent_1.short(),
            self.parent_2.short(),
            self.tool,
            self.config
        )
    }
}

/// A 64-character lowercase hex sha256 digest of a [`CacheKey`].
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Digest(String);

impl Digest {
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The two-character shard directory for this digest.
    #[must_use]
    pub fn shard(&self) -> &str {
        &self.0[..2]
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A string that is not a valid [`Digest`].
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("invalid digest {0:?}: expected 64 lowercase hex characters")]
pub struct DigestParseError(pub String);

impl FromStr for Digest {
    type Err = DigestParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() == 64 && s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f')) {
            Ok(Self(s.to_owned()))
        } else {
            Err(DigestParseError(s.to_owned()))
        }
    }
}

impl TryFrom<String> for Digest {
    type Error = DigestParseError;
    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<Digest> for String {
    fn from(d: Digest) -> Self {
        d.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(tool: &str) -> CacheKey {
        CacheKey {
            repository: RepoSlug::new("octo/widgets").unwrap(),
            merge_commit: GitOid::from_bytes([3; 20]),
            parent_1: GitOid::from_bytes([1; 20]),
            parent_2: GitOid::from_bytes([2; 20]),
            tool: tool.to_owned(),
            config: String::new(),
        }
    }

    #[test]
    fn digest_is_deterministic_hex() {
        let d = key("git").digest();
        assert_eq!(d, key("git").digest());
        assert_eq!(d.as_str().len(), 64);
        assert_eq!(d.shard(), &d.as_str()[..2]);
        assert_eq!(d.as_str().parse::<Digest>().unwrap(), d);
    }

    #[test]
    fn digest_is_stable_across_releases() {
        // Changing this value orphans every existing store.
        assert_eq!(
            key("git").digest().as_str(),
            "6f5b5c0ad0d1d7584393d0916cba17b421af4f2316f1fac9300b547450217c94"
        );
    }

    #[test]
    fn parent_order_matters() {
        let a = key("git");
        let mut b = a.clone();
        std::mem::swap(&mut b.parent_1, &mut b.parent_2);
        assert_ne!(a.digest(), b.digest());
    }

    #[test]
    fn fields_do_not_bleed_into_each_other() {
        let mut a = key("ab");
        a.config = "c".to_owned();
        let mut b = key("a");
        b.config = "bc".to_owned();
        assert_ne!(a.digest(), b.digest());
    }

    #[test]
    fn digest_parse_rejects_garbage() {
        assert!("xyz".parse::<Digest>().is_err());
        assert!("A".repeat(64).parse::<Digest>().is_err());
    }

    #[test]
    fn key_serde_roundtrip() {
        let k = key("spork");
        let json = serde_json::to_string(&k).unwrap();
        assert_eq!(serde_json::from_str::<CacheKey>(&json).unwrap(), k);
    }
}
