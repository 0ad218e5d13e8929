//! Named, expiring locks over cache keys.
//!
//! [`LockManager`] is the seam between the coordination protocol and its
//! backing store. [`FsLockManager`] keeps one marker file per key under
//! `<root>/locks/`, created atomically and reclaimable once older than the
//! staleness threshold.

use std::fs;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use super::key::Digest;
use super::now_ms;

/// Lock backend failures. Contention is not an error; see [`Acquire`].
#[derive(Debug, Error)]
pub enum LockError {
    #[error("lock {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl LockError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_owned(),
            source,
        }
    }
}

/// Who holds a lock and since when.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockInfo {
    /// Unique per acquisition.
    pub token: String,
    pub host: String,
    pub pid: u32,
    pub acquired_at_ms: u64,
}

impl LockInfo {
    /// Age relative to `now_ms`; clocks that run backwards count as zero.
    #[must_use]
    pub const fn age(&self, now_ms: u64) -> Duration {
        Duration::from_millis(now_ms.saturating_sub(self.acquired_at_ms))
    }
}

/// Proof of holding a lock.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Lease {
    pub digest: Digest,
    pub info: LockInfo,
}

/// Result of one acquisition attempt.
#[derive(Debug)]
pub enum Acquire {
    Acquired(Lease),
    /// Held by someone else and not stale. `None` if the holder's marker
    /// could not be read.
    Held(Option<LockInfo>),
}

/// A named lock service with staleness-based expiry.
pub trait LockManager: Send + Sync {
    /// Try once to take the lock for `digest`, reclaiming it if stale.
    ///
    /// # Errors
    /// Backend failures only.
    fn try_acquire(&self, digest: &Digest) -> Result<Acquire, LockError>;

    /// `true` if `lease` is still the current holder.
    ///
    /// # Errors
    /// Backend failures only.
    fn verify(&self, lease: &Lease) -> Result<bool, LockError>;

    /// Release `lease` if it is still the current holder.
    ///
    /// # Errors
    /// Backend failures only.
    fn release(&self, lease: &Lease) -> Result<(), LockError>;

    /// Reset the acquisition time of `lease` to now so a long computation is
    /// not mistaken for an abandoned one. Returns `false` if the lease is no
    /// longer the current holder.
    ///
    /// # Errors
    /// Backend failures only.
    fn renew(&self, lease: &Lease) -> Result<bool, LockError>;

    /// The current holder of `digest`, stale or not.
    ///
    /// # Errors
    /// Backend failures only.
    fn holder(&self, digest: &Digest) -> Result<Option<LockInfo>, LockError>;

    /// Every lock marker currently present.
    ///
    /// # Errors
    /// Backend failures only.
    fn list(&self) -> Result<Vec<(Digest, LockInfo)>, LockError>;

    /// Remove the marker for `digest` if it is still stale.
    /// Returns whether a marker was removed.
    ///
    /// # Errors
    /// Backend failures only.
    fn break_stale(&self, digest: &Digest) -> Result<bool, LockError>;

    /// Age past which a lock is presumed abandoned.
    fn stale_after(&self) -> Duration;

    /// `true` if `info` is past the staleness threshold now.
    fn is_stale(&self, info: &LockInfo) -> bool {
        info.age(now_ms()) >= self.stale_after()
    }
}

/// A held lock, released on drop.
pub struct LockGuard<'a> {
    manager: &'a dyn LockManager,
    lease: Lease,
}

impl<'a> LockGuard<'a> {
    /// Take the lock for `digest` if it is free or stale.
    ///
    /// # Errors
    /// Backend failures only.
    pub fn try_lock(manager: &'a dyn LockManager, digest: &Digest) -> Result<Option<Self>, LockError> {
        match manager.try_acquire(digest)? {
            Acquire::Acquired(lease) => Ok(Some(Self { manager, lease })),
            Acquire::Held(_) => Ok(None),
        }
    }

    #[must_use]
    pub const fn digest(&self) -> &Digest {
        &self.lease.digest
    }

    #[must_use]
    pub const fn lease(&self) -> &Lease {
        &self.lease
    }

    /// `true` if this guard still owns the lock.
    ///
    /// # Errors
    /// Backend failures only.
    pub fn verify(&self) -> Result<bool, LockError> {
        self.manager.verify(&self.lease)
    }

    /// Refresh the lock; `false` if it was lost.
    ///
    /// # Errors
    /// Backend failures only.
    pub fn renew(&self) -> Result<bool, LockError> {
        self.manager.renew(&self.lease)
    }

    /// The manager's staleness threshold.
    #[must_use]
    pub fn stale_after(&self) -> Duration {
        self.manager.stale_after()
    }
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.manager.release(&self.lease) {
            warn!(digest = %self.lease.digest, error = %e, "failed to release lock");
        }
    }
}

impl std::fmt::Debug for LockGuard<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard").field("lease", &self.lease).finish()
    }
}

// ---------------------------------------------------------------------------
// FsLockManager
// ---------------------------------------------------------------------------

/// Reclaim attempts per acquisition before reporting the lock as held.
const MAX_RECLAIM_ROUNDS: usize = 3;

/// File-backed locks: `<dir>/<digest>.lock` holding JSON [`LockInfo`].
///
/// A marker is created by hard-linking a fully written temp file into
/// place, which fails atomically if the marker exists. A stale marker is
/// reclaimed by renaming it to a unique tombstone, but only after a re-read
/// shows it unchanged since it was judged stale; if the tombstone still
/// turns out to hold a fresh lock it is linked back. Renewal replaces the
/// marker in place with a newer `acquired_at_ms`.
#[derive(Clone, Debug)]
pub struct FsLockManager {
    dir: PathBuf,
    stale_after: Duration,
    host: String,
}

impl FsLockManager {
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>, stale_after: Duration) -> Self {
        Self {
            dir: dir.into(),
            stale_after,
            host: hostname(),
        }
    }

    fn marker(&self, digest: &Digest) -> PathBuf {
        self.dir.join(format!("{digest}.lock"))
    }

    fn new_info(&self) -> LockInfo {
        LockInfo {
            token: format!("{:016x}-{}", rand::random::<u64>(), std::process::id()),
            host: self.host.clone(),
            pid: std::process::id(),
            acquired_at_ms: now_ms(),
        }
    }

    /// A synced temp file in the lock directory holding `info`.
    fn write_temp(&self, path: &Path, info: &LockInfo) -> Result<tempfile::NamedTempFile, LockError> {
        fs::create_dir_all(&self.dir).map_err(|e| LockError::io(&self.dir, e))?;
        let mut tmp = tempfile::Builder::new()
            .prefix(".lock-")
            .tempfile_in(&self.dir)
            .map_err(|e| LockError::io(&self.dir, e))?;
        let json = serde_json::to_vec(info).map_err(|e| LockError::io(path, e.into()))?;
        tmp.write_all(&json)
            .and_then(|()| tmp.as_file().sync_all())
            .map_err(|e| LockError::io(tmp.path(), e))?;
        Ok(tmp)
    }

    /// Atomically create the marker. `Ok(false)` if it already exists.
    fn create(&self, path: &Path, info: &LockInfo) -> Result<bool, LockError> {
        let tmp = self.write_temp(path, info)?;
        match fs::hard_link(tmp.path(), path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(LockError::io(path, e)),
        }
    }

    /// Read a marker. A marker that exists but cannot be parsed is reported
    /// with its mtime as the acquisition time and an empty token.
    fn read(path: &Path) -> Result<Option<LockInfo>, LockError> {
        let bytes = match fs::read(path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(LockError::io(path, e)),
        };
        if let Ok(info) = serde_json::from_slice::<LockInfo>(&bytes) {
            return Ok(Some(info));
        }
        let acquired_at_ms = fs::metadata(path)
            .and_then(|m| m.modified())
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map_or_else(now_ms, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX));
        Ok(Some(LockInfo {
            token: String::new(),
            host: String::new(),
            pid: 0,
            acquired_at_ms,
        }))
    }

    /// Move a stale marker aside. Returns `true` if the caller may retry
    /// creation, `false` if the marker changed since `observed` was read or
    /// a fresh holder was found and restored.
    fn reclaim(&self, path: &Path, observed: &LockInfo) -> Result<bool, LockError> {
        match Self::read(path)? {
            None => return Ok(true),
            Some(current) if current != *observed || !self.is_stale(&current) => {
                debug!(path = %path.display(), "lock marker changed since it was judged stale");
                return Ok(false);
            }
            Some(_) => {}
        }
        let tombstone = self.dir.join(format!(
            ".stale-{:016x}-{}",
            rand::random::<u64>(),
            path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default()
        ));
        match fs::rename(path, &tombstone) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(true),
            Err(e) => return Err(LockError::io(path, e)),
        }
        let moved = Self::read(&tombstone)?;
        let restore = moved.as_ref().is_some_and(|m| m != observed && !self.is_stale(m));
        if restore {
            // The marker was replaced or renewed between the re-read and the
            // rename.
            match fs::hard_link(&tombstone, path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    warn!(
                        path = %path.display(),
                        token = %moved.as_ref().map(|m| m.token.as_str()).unwrap_or_default(),
                        "lock taken while restoring a fresh marker, its holder lost the lease"
                    );
                }
                Err(e) => {
                    Self::discard(&tombstone);
                    return Err(LockError::io(path, e));
                }
            }
        } else {
            warn!(
                path = %path.display(),
                host = %observed.host,
                pid = observed.pid,
                age_secs = observed.age(now_ms()).as_secs(),
                "reclaiming stale lock"
            );
        }
        Self::discard(&tombstone);
        Ok(!restore)
    }

    fn discard(tombstone: &Path) {
        if let Err(e) = fs::remove_file(tombstone)
            && e.kind() != std::io::ErrorKind::NotFound
        {
            warn!(path = %tombstone.display(), error = %e, "failed to remove lock tombstone");
        }
    }
}

impl LockManager for FsLockManager {
    fn try_acquire(&self, digest: &Digest) -> Result<Acquire, LockError> {
        let path = self.marker(digest);
        let info = self.new_info();
        for _ in 0..MAX_RECLAIM_ROUNDS {
            if self.create(&path, &info)? {
                debug!(%digest, token = %info.token, "lock acquired");
                return Ok(Acquire::Acquired(Lease {
                    digest: digest.clone(),
                    info,
                }));
            }
            let Some(current) = Self::read(&path)? else {
                // Released between our create and read.
                continue;
            };
            if !self.is_stale(&current) {
                return Ok(Acquire::Held(Some(current)));
            }
            if !self.reclaim(&path, &current)? {
                return Ok(Acquire::Held(Self::read(&path)?));
            }
        }
        Ok(Acquire::Held(Self::read(&path)?))
    }

    fn verify(&self, lease: &Lease) -> Result<bool, LockError> {
        Ok(Self::read(&self.marker(&lease.digest))?.is_some_and(|i| i.token == lease.info.token))
    }

    fn release(&self, lease: &Lease) -> Result<(), LockError> {
        if !self.verify(lease)? {
            warn!(digest = %lease.digest, "lock no longer held at release, leaving it");
            return Ok(());
        }
        let path = self.marker(&lease.digest);
        match fs::remove_file(&path) {
            Ok(()) => {
                debug!(digest = %lease.digest, "lock released");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(LockError::io(&path, e)),
        }
    }

    fn renew(&self, lease: &Lease) -> Result<bool, LockError> {
        if !self.verify(lease)? {
            return Ok(false);
        }
        let path = self.marker(&lease.digest);
        let info = LockInfo {
            acquired_at_ms: now_ms(),
            ..lease.info.clone()
        };
        let tmp = self.write_temp(&path, &info)?;
        tmp.persist(&path).map_err(|e| LockError::io(&path, e.error))?;
        debug!(digest = %lease.digest, "lock renewed");
        Ok(true)
    }

    fn holder(&self, digest: &Digest) -> Result<Option<LockInfo>, LockError> {
        Self::read(&self.marker(digest))
    }

    fn list(&self) -> Result<Vec<(Digest, LockInfo)>, LockError> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(LockError::io(&self.dir, e)),
        };
        let mut out = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| LockError::io(&self.dir, e))?;
            let name = entry.file_name();
            let Some(digest) = name
                .to_str()
                .and_then(|n| n.strip_suffix(".lock"))
                .and_then(|d| d.parse::<Digest>().ok())
            else {
                continue;
            };
            if let Some(info) = Self::read(&entry.path())? {
                out.push((digest, info));
            }
        }
        out.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(out)
    }

    fn break_stale(&self, digest: &Digest) -> Result<bool, LockError> {
        let path = self.marker(digest);
        match Self::read(&path)? {
            Some(info) if self.is_stale(&info) => self.reclaim(&path, &info),
            _ => Ok(false),
        }
    }

    fn stale_after(&self) -> Duration {
        self.stale_after
    }
}

fn hostname() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.is_empty())
        .or_else(|| {
            fs::read_to_string("/etc/hostname")
                .ok()
                .map(|h| h.trim().to_owned())
                .filter(|h| !h.is_empty())
        })
        .unwrap_or_else(|| "unknown".to_owned())
}
