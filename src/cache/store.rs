//! The on-disk result store.
//!
//! ```text
//! <root>/
//!   entries/<hh>/<digest>.json    final results, sharded by digest prefix
//!   placeholders/<digest>.json    in-progress markers
//!   locks/<digest>.lock           lock markers (see `lock`)
//!   inconsistent/<digest>.json    keys whose copies disagreed
//!   logs/<digest>.log             collaborator output
//!   maintenance.lock              held by curation and consolidation
//! ```
//!
//! Results, placeholders and locks live in separate namespaces, so sweeping
//! one never touches another.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use super::entry::{CacheEntry, FinalEntry, Placeholder, Status};
use super::key::{CacheKey, Digest};
use super::lock::{FsLockManager, LockError, LockGuard};
use crate::fsutil::{remove_if_exists, write_atomic};

/// Store failures.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{path}: malformed entry: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// A write was attempted with a guard for a different key.
    #[error("lock for {held} does not cover key {wanted}")]
    WrongLock { held: Digest, wanted: Digest },

    /// The guard's lock was reclaimed by another worker.
    #[error("lock for {0} was lost before the write")]
    LockLost(Digest),

    /// A final entry already exists; writing again is a logic error.
    #[error("entry {0} is already final")]
    AlreadyFinal(Digest),

    /// A replacement would change the status of a final entry.
    #[error("entry {digest} is {existing}, refusing to replace with {replacement}")]
    StatusChange {
        digest: Digest,
        existing: Status,
        replacement: Status,
    },

    #[error(transparent)]
    Lock(#[from] LockError),
}

impl StoreError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_owned(),
            source,
        }
    }
}

/// Record of a key whose copies disagreed during consolidation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InconsistencyFlag {
    pub key: CacheKey,
    /// The distinct statuses seen, sorted.
    pub statuses: BTreeSet<Status>,
    pub flagged_at_ms: u64,
}

/// A placeholder and the digest it is stored under.
#[derive(Clone, Debug)]
pub struct PlaceholderRecord {
    pub digest: Digest,
    pub placeholder: Placeholder,
}

/// A content-addressed result store rooted at one directory.
#[derive(Clone, Debug)]
pub struct Store {
    root: PathBuf,
}

impl Store {
    /// Open (creating if needed) the store at `root`.
    ///
    /// # Errors
    /// [`StoreError::Io`] if the directory layout cannot be created.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let store = Self { root: root.into() };
        for dir in [
            store.entries_dir(),
            store.placeholders_dir(),
            store.locks_dir(),
            store.inconsistent_dir(),
            store.logs_dir(),
        ] {
            fs::create_dir_all(&dir).map_err(|e| StoreError::io(&dir, e))?;
        }
        Ok(store)
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// A file-backed lock manager over this store's `locks/` namespace.
    #[must_use]
    pub fn lock_manager(&self, stale_after: Duration) -> FsLockManager {
        FsLockManager::new(self.locks_dir(), stale_after)
    }

    // -- layout --

    fn entries_dir(&self) -> PathBuf {
        self.root.join("entries")
    }

    fn placeholders_dir(&self) -> PathBuf {
        self.root.join("placeholders")
    }

    fn locks_dir(&self) -> PathBuf {
        self.root.join("locks")
    }

    fn inconsistent_dir(&self) -> PathBuf {
        self.root.join("inconsistent")
    }

    fn logs_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    fn entry_path(&self, digest: &Digest) -> PathBuf {
        self.entries_dir()
            .join(digest.shard())
            .join(format!("{digest}.json"))
    }

    fn placeholder_path(&self, digest: &Digest) -> PathBuf {
        self.placeholders_dir().join(format!("{digest}.json"))
    }

    fn flag_path(&self, digest: &Digest) -> PathBuf {
        self.inconsistent_dir().join(format!("{digest}.json"))
    }

    /// Collaborator log for `digest`.
    #[must_use]
    pub fn log_path(&self, digest: &Digest) -> PathBuf {
        self.logs_dir().join(format!("{digest}.log"))
    }

    /// The store-wide maintenance lock file.
    #[must_use]
    pub fn maintenance_lock_path(&self) -> PathBuf {
        self.root.join("maintenance.lock")
    }

    // -- reads --

    /// The entry for `key`: final, in progress, or absent. Never blocks.
    ///
    /// # Errors
    /// I/O failures and unparseable entries.
    pub fn get(&self, key: &CacheKey) -> Result<Option<CacheEntry>, StoreError> {
        let digest = key.digest();
        if let Some(entry) = self.get_final(&digest)? {
            return Ok(Some(CacheEntry::Final(entry)));
        }
        Ok(read_json::<Placeholder>(&self.placeholder_path(&digest))?.map(CacheEntry::InProgress))
    }

    /// The final entry stored under `digest`.
    ///
    /// # Errors
    /// I/O failures and unparseable entries.
    pub fn get_final(&self, digest: &Digest) -> Result<Option<FinalEntry>, StoreError> {
        read_json(&self.entry_path(digest))
    }

    /// `true` iff a final entry exists for `key`.
    ///
    /// # Errors
    /// I/O failures and unparseable entries.
    pub fn exists(&self, key: &CacheKey) -> Result<bool, StoreError> {
        Ok(self.get_final(&key.digest())?.is_some())
    }

    /// Every final entry, sorted by digest.
    ///
    /// # Errors
    /// I/O failures and unparseable entries.
    pub fn final_entries(&self) -> Result<Vec<(Digest, FinalEntry)>, StoreError> {
        let mut out = Vec::new();
        for shard in list_dir(&self.entries_dir())? {
            if !shard.is_dir() {
                continue;
            }
            for path in list_dir(&shard)? {
                let Some(digest) = digest_of(&path, ".json") else {
                    continue;
                };
                if let Some(entry) = read_json(&path)? {
                    out.push((digest, entry));
                }
            }
        }
        out.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(out)
    }

    /// Every placeholder, sorted by digest.
    ///
    /// # Errors
    /// I/O failures and unparseable markers.
    pub fn placeholders(&self) -> Result<Vec<PlaceholderRecord>, StoreError> {
        let mut out = Vec::new();
        for path in list_dir(&self.placeholders_dir())? {
            let Some(digest) = digest_of(&path, ".json") else {
                continue;
            };
            if let Some(placeholder) = read_json(&path)? {
                out.push(PlaceholderRecord { digest, placeholder });
            }
        }
        out.sort_by(|a, b| a.digest.cmp(&b.digest));
        Ok(out)
    }

    /// Every inconsistency flag, sorted by digest.
    ///
    /// # Errors
    /// I/O failures and unparseable flags.
    pub fn inconsistencies(&self) -> Result<Vec<(Digest, InconsistencyFlag)>, StoreError> {
        let mut out = Vec::new();
        for path in list_dir(&self.inconsistent_dir())? {
            let Some(digest) = digest_of(&path, ".json") else {
                continue;
            };
            if let Some(flag) = read_json(&path)? {
                out.push((digest, flag));
            }
        }
        out.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(out)
    }

    // -- writes (lock required) --

    fn check_guard(guard: &LockGuard<'_>, digest: &Digest) -> Result<(), StoreError> {
        if guard.digest() != digest {
            return Err(StoreError::WrongLock {
                held: guard.digest().clone(),
                wanted: digest.clone(),
            });
        }
        if !guard.verify()? {
            return Err(StoreError::LockLost(digest.clone()));
        }
        Ok(())
    }

    /// Write the final entry for `entry.key`.
    ///
    /// # Errors
    /// [`StoreError::AlreadyFinal`] if a final entry exists, and the guard
    /// errors if `guard` does not currently hold the key's lock.
    pub fn put(&self, guard: &LockGuard<'_>, entry: &FinalEntry) -> Result<(), StoreError> {
        let digest = entry.key.digest();
        Self::check_guard(guard, &digest)?;
        if self.get_final(&digest)?.is_some() {
            return Err(StoreError::AlreadyFinal(digest));
        }
        self.write_final(&digest, entry)
    }

    /// Replace an existing final entry with one of the same status, or
    /// write it if absent. Used by consolidation to settle on a canonical
    /// copy.
    ///
    /// # Errors
    /// [`StoreError::StatusChange`] if the statuses differ.
    pub fn replace(&self, guard: &LockGuard<'_>, entry: &FinalEntry) -> Result<(), StoreError> {
        let digest = entry.key.digest();
        Self::check_guard(guard, &digest)?;
        if let Some(existing) = self.get_final(&digest)?
            && existing.status != entry.status
        {
            return Err(StoreError::StatusChange {
                digest,
                existing: existing.status,
                replacement: entry.status,
            });
        }
        self.write_final(&digest, entry)
    }

    fn write_final(&self, digest: &Digest, entry: &FinalEntry) -> Result<(), StoreError> {
        let path = self.entry_path(digest);
        let json = to_json(&path, entry)?;
        write_atomic(&path, &json).map_err(|e| StoreError::io(&path, e))?;
        debug!(%digest, status = %entry.status, "final entry written");
        Ok(())
    }

    /// Write the in-progress marker for `placeholder.key`.
    ///
    /// # Errors
    /// Guard and I/O failures.
    pub fn put_placeholder(&self, guard: &LockGuard<'_>, placeholder: &Placeholder) -> Result<(), StoreError> {
        let digest = placeholder.key.digest();
        Self::check_guard(guard, &digest)?;
        let path = self.placeholder_path(&digest);
        let json = to_json(&path, placeholder)?;
        write_atomic(&path, &json).map_err(|e| StoreError::io(&path, e))
    }

    /// Remove the in-progress marker for `digest`. The caller must hold the
    /// key's lock or be its last holder cleaning up.
    ///
    /// # Errors
    /// I/O failures other than not-found.
    pub fn remove_placeholder(&self, digest: &Digest) -> Result<bool, StoreError> {
        let path = self.placeholder_path(digest);
        remove_if_exists(&path).map_err(|e| StoreError::io(&path, e))
    }

    /// Remove the in-progress marker for `digest` only if it was written
    /// under the lock token `owner`. A marker left by a worker that has
    /// since taken the key over stays in place.
    ///
    /// # Errors
    /// I/O failures and an unparseable marker.
    pub fn remove_placeholder_if_owned(&self, digest: &Digest, owner: &str) -> Result<bool, StoreError> {
        let path = self.placeholder_path(digest);
        match read_json::<Placeholder>(&path)? {
            Some(p) if p.owner == owner => remove_if_exists(&path).map_err(|e| StoreError::io(&path, e)),
            Some(p) => {
                debug!(%digest, owner = %p.owner, "placeholder belongs to another claim, leaving it");
                Ok(false)
            }
            None => Ok(false),
        }
    }

    /// Delete the final entry for `digest` together with its log, moving
    /// the key back to absent.
    ///
    /// # Errors
    /// Guard and I/O failures.
    pub fn delete_final(&self, guard: &LockGuard<'_>, digest: &Digest) -> Result<bool, StoreError> {
        Self::check_guard(guard, digest)?;
        let path = self.entry_path(digest);
        let removed = remove_if_exists(&path).map_err(|e| StoreError::io(&path, e))?;
        self.remove_log(digest)?;
        if removed {
            debug!(%digest, "final entry deleted");
        }
        Ok(removed)
    }

    /// Delete the log for `digest`.
    ///
    /// # Errors
    /// I/O failures other than not-found.
    pub fn remove_log(&self, digest: &Digest) -> Result<bool, StoreError> {
        let log = self.log_path(digest);
        remove_if_exists(&log).map_err(|e| StoreError::io(&log, e))
    }

    /// Record that copies of `flag.key` disagree.
    ///
    /// # Errors
    /// I/O failures.
    pub fn flag_inconsistent(&self, flag: &InconsistencyFlag) -> Result<(), StoreError> {
        let digest = flag.key.digest();
        let path = self.flag_path(&digest);
        let json = to_json(&path, flag)?;
        warn!(%digest, key = %flag.key, statuses = ?flag.statuses, "inconsistent entry flagged");
        write_atomic(&path, &json).map_err(|e| StoreError::io(&path, e))
    }

    /// Clear the inconsistency flag for `digest`.
    ///
    /// # Errors
    /// I/O failures other than not-found.
    pub fn clear_inconsistent(&self, digest: &Digest) -> Result<bool, StoreError> {
        let path = self.flag_path(digest);
        remove_if_exists(&path).map_err(|e| StoreError::io(&path, e))
    }
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Option<T>, StoreError> {
    match fs::read(path) {
        Ok(bytes) => serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|source| StoreError::Corrupt {
                path: path.to_owned(),
                source,
            }),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(StoreError::io(path, e)),
    }
}

fn to_json<T: Serialize>(path: &Path, value: &T) -> Result<Vec<u8>, StoreError> {
    serde_json::to_vec_pretty(value).map_err(|source| StoreError::Corrupt {
        path: path.to_owned(),
        source,
    })
}

fn list_dir(dir: &Path) -> Result<Vec<PathBuf>, StoreError> {
    match fs::read_dir(dir) {
        Ok(entries) => entries
            .map(|e| e.map(|e| e.path()).map_err(|e| StoreError::io(dir, e)))
            .collect(),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(StoreError::io(dir, e)),
    }
}

fn digest_of(path: &Path, suffix: &str) -> Option<Digest> {
    path.file_name()?.to_str()?.strip_suffix(suffix)?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::test_support::{final_entry, key};

    fn store() -> (tempfile::TempDir, Store) {
        let dir = tempfile::TempDir::new().unwrap();
        let store = Store::open(dir.path().join("cache")).unwrap();
        (dir, store)
    }

    #[test]
    fn absent_then_final() {
        let (_dir, store) = store();
        let locks = store.lock_manager(Duration::from_secs(60));
        let k = key(1, "git");
        assert!(store.get(&k).unwrap().is_none());
        assert!(!store.exists(&k).unwrap());

        let guard = LockGuard::try_lock(&locks, &k.digest()).unwrap().unwrap();
        let entry = final_entry(&k, Status::Success, 10);
        store.put(&guard, &entry).unwrap();
        assert!(store.exists(&k).unwrap());
        assert_eq!(store.get(&k).unwrap(), Some(CacheEntry::Final(entry.clone())));

        let err = store.put(&guard, &entry).unwrap_err();
        assert!(matches!(err, StoreError::AlreadyFinal(_)));
    }

    #[test]
    fn entries_are_sharded_by_digest_prefix() {
        let (_dir, store) = store();
        let locks = store.lock_manager(Duration::from_secs(60));
        let k = key(2, "git");
        let d = k.digest();
        let guard = LockGuard::try_lock(&locks, &d).unwrap().unwrap();
        store.put(&guard, &final_entry(&k, Status::Conflict, 1)).unwrap();
        assert!(store.root().join("entries").join(d.shard()).join(format!("{d}.json")).is_file());
    }

    #[test]
    fn placeholder_is_in_progress_not_final() {
        let (_dir, store) = store();
        let locks = store.lock_manager(Duration::from_secs(60));
        let k = key(3, "git");
        let guard = LockGuard::try_lock(&locks, &k.digest()).unwrap().unwrap();
        let placeholder = Placeholder {
            key: k.clone(),
            owner: guard.lease().info.token.clone(),
            host: "h".to_owned(),
            pid: 1,
            started_at_ms: 0,
        };
        store.put_placeholder(&guard, &placeholder).unwrap();
        assert!(store.get(&k).unwrap().unwrap().is_in_progress());
        assert!(!store.exists(&k).unwrap());
        assert_eq!(store.placeholders().unwrap().len(), 1);
        assert!(store.remove_placeholder(&k.digest()).unwrap());
        assert!(store.get(&k).unwrap().is_none());
    }

    #[test]
    fn placeholder_is_removed_only_by_its_owner() {
        let (_dir, store) = store();
        let locks = store.lock_manager(Duration::from_secs(60));
        let k = key(8, "git");
        let guard = LockGuard::try_lock(&locks, &k.digest()).unwrap().unwrap();
        let placeholder = Placeholder {
            key: k.clone(),
            owner: guard.lease().info.token.clone(),
            host: "h".to_owned(),
            pid: 1,
            started_at_ms: 0,
        };
        store.put_placeholder(&guard, &placeholder).unwrap();
        assert!(!store.remove_placeholder_if_owned(&k.digest(), "someone-else").unwrap());
        assert!(store.get(&k).unwrap().unwrap().is_in_progress());
        assert!(store.remove_placeholder_if_owned(&k.digest(), &placeholder.owner).unwrap());
        assert!(store.get(&k).unwrap().is_none());
        assert!(!store.remove_placeholder_if_owned(&k.digest(), &placeholder.owner).unwrap());
    }

    #[test]
    fn writes_require_the_matching_lock() {
        let (_dir, store) = store();
        let locks = store.lock_manager(Duration::from_secs(60));
        let k = key(4, "git");
        let other = key(5, "git");
        let guard = LockGuard::try_lock(&locks, &other.digest()).unwrap().unwrap();
        let err = store.put(&guard, &final_entry(&k, Status::Success, 1)).unwrap_err();
        assert!(matches!(err, StoreError::WrongLock { .. }));
    }

    #[test]
    fn lost_lock_blocks_writes() {
        let (_dir, store) = store();
        let locks = store.lock_manager(Duration::ZERO);
        let k = key(6, "git");
        let guard = LockGuard::try_lock(&locks, &k.digest()).unwrap().unwrap();
        // A second worker reclaims the zero-staleness lock.
        let _thief = LockGuard::try_lock(&locks, &k.digest()).unwrap().unwrap();
        let err = store.put(&guard, &final_entry(&k, Status::Success, 1)).unwrap_err();
        assert!(matches!(err, StoreError::LockLost(_)));
    }

    #[test]
    fn delete_final_removes_log() {
        let (_dir, store) = store();
        let locks = store.lock_manager(Duration::from_secs(60));
        let k = key(7, "git");
        let d = k.digest();
        let guard = LockGuard::try_lock(&locks, &d).unwrap().unwrap();
        store.put(&guard, &final_entry(&k, Status::Timeout, 1)).unwrap();
        fs::write(store.log_path(&d), "log").unwrap();
        assert!(store.delete_final(&guard, &d).unwrap());
        assert!(!store.log_path(&d).exists());
        assert!(store.get(&k).unwrap().is_none());
    }

    #[test]
    fn replace_keeps_status() {
        let (_dir, store) = store();
        let locks = store.lock_manager(Duration::from_secs(60));
        let k = key(8, "git");
        let guard = LockGuard::try_lock(&locks, &k.digest()).unwrap().unwrap();
        store.put(&guard, &final_entry(&k, Status::Success, 5)).unwrap();
        store.replace(&guard, &final_entry(&k, Status::Success, 2)).unwrap();
        assert_eq!(store.get_final(&k.digest()).unwrap().unwrap().created_at_ms, 2);
        let err = store.replace(&guard, &final_entry(&k, Status::Error, 1)).unwrap_err();
        assert!(matches!(err, StoreError::StatusChange { .. }));
    }

    #[test]
    fn final_entries_lists_all_shards() {
        let (_dir, store) = store();
        let locks = store.lock_manager(Duration::from_secs(60));
        for n in 0..6 {
            let k = key(n, "git");
            let guard = LockGuard::try_lock(&locks, &k.digest()).unwrap().unwrap();
            store.put(&guard, &final_entry(&k, Status::Success, 1)).unwrap();
        }
        let all = store.final_entries().unwrap();
        assert_eq!(all.len(), 6);
        assert!(all.windows(2).all(|w| w[0].0 < w[1].0));
    }

    #[test]
    fn corrupt_entry_is_reported() {
        let (_dir, store) = store();
        let k = key(9, "git");
        let d = k.digest();
        let path = store.root().join("entries").join(d.shard()).join(format!("{d}.json"));
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, "{not json").unwrap();
        assert!(matches!(store.get(&k), Err(StoreError::Corrupt { .. })));
    }

    #[test]
    fn inconsistency_flags_roundtrip() {
        let (_dir, store) = store();
        let k = key(10, "git");
        let flag = InconsistencyFlag {
            key: k.clone(),
            statuses: BTreeSet::from([Status::Success, Status::Conflict]),
            flagged_at_ms: 1,
        };
        store.flag_inconsistent(&flag).unwrap();
        assert_eq!(store.inconsistencies().unwrap(), vec![(k.digest(), flag)]);
        assert!(store.clear_inconsistent(&k.digest()).unwrap());
        assert!(store.inconsistencies().unwrap().is_empty());
    }
}
