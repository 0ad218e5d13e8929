//! The claim protocol: at most one live computation per key.
//!
//! 1. If a final entry exists, the key is done.
//! 2. Take the key's lock, retrying with capped exponential backoff and
//!    jitter; give up after the configured attempts and skip the key.
//! 3. Re-check for a final entry now that the lock is held.
//! 4. Write a placeholder, compute, write the final entry, remove the
//!    placeholder, release the lock.
//!
//! A [`Claim`] dropped before [`Claim::complete`] removes its placeholder and
//! releases its lock, so cancellation and early returns never leave a key
//! poisoned until the staleness threshold. Both only touch a placeholder
//! written under the claim's own lock token: a worker whose lock was
//! reclaimed never clears the marker of the worker that took over.
//!
//! [`Claim::keep_alive`] renews the lock while a computation runs, so a
//! computation longer than the staleness threshold keeps its key.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use rand::Rng as _;
use tracing::{debug, info, warn};

use super::entry::{FinalEntry, Placeholder};
use super::key::{CacheKey, Digest};
use super::lock::{LockGuard, LockManager};
use super::store::{Store, StoreError};
use super::now_ms;
use crate::config::CacheConfig;

/// Retry policy for lock acquisition.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Backoff {
    pub attempts: u32,
    pub base: Duration,
    pub max: Duration,
}

impl Backoff {
    /// Delay before retry number `attempt` (0-based): `base * 2^attempt`,
    /// capped at `max`, then scaled by a random factor in `[0.5, 1.0]`.
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = self.base.saturating_mul(1u32.checked_shl(attempt).unwrap_or(u32::MAX));
        let capped = exp.min(self.max);
        capped.mul_f64(rand::rng().random_range(0.5..=1.0))
    }
}

impl From<&CacheConfig> for Backoff {
    fn from(cfg: &CacheConfig) -> Self {
        Self {
            attempts: cfg.acquire_attempts.max(1),
            base: Duration::from_millis(cfg.backoff_base_ms),
            max: Duration::from_millis(cfg.backoff_max_ms),
        }
    }
}

/// Result of trying to claim a key.
#[derive(Debug)]
pub enum ClaimOutcome<'a> {
    /// A final entry exists; nothing to do.
    AlreadyDone(FinalEntry),
    /// Another worker holds the key; skip it this pass.
    Busy,
    /// This worker now owns the key.
    Acquired(Claim<'a>),
}

/// Coordinates claims on one store.
pub struct Coordinator<'a> {
    store: &'a Store,
    locks: &'a dyn LockManager,
    backoff: Backoff,
}

impl<'a> Coordinator<'a> {
    #[must_use]
    pub fn new(store: &'a Store, locks: &'a dyn LockManager, backoff: Backoff) -> Self {
        Self {
            store,
            locks,
            backoff,
        }
    }

    /// Claim `key` for computation.
    ///
    /// Contention and stale-lock recovery are handled here and surface as
    /// [`ClaimOutcome::Busy`], never as errors. Cancellation during backoff
    /// also yields `Busy`.
    ///
    /// # Errors
    /// Store and lock backend failures.
    pub fn claim(&self, key: &CacheKey, cancel: &AtomicBool) -> Result<ClaimOutcome<'a>, StoreError> {
        let digest = key.digest();
        for attempt in 0..self.backoff.attempts {
            if let Some(done) = self.store.get_final(&digest)? {
                return Ok(ClaimOutcome::AlreadyDone(done));
            }
            if let Some(guard) = LockGuard::try_lock(self.locks, &digest)? {
                // Another worker may have finished between our check and
                // the lock.
                if let Some(done) = self.store.get_final(&digest)? {
                    return Ok(ClaimOutcome::AlreadyDone(done));
                }
                let placeholder = Placeholder {
                    key: key.clone(),
                    owner: guard.lease().info.token.clone(),
                    host: guard.lease().info.host.clone(),
                    pid: guard.lease().info.pid,
                    started_at_ms: now_ms(),
                };
                self.store.put_placeholder(&guard, &placeholder)?;
                debug!(%key, "claimed");
                return Ok(ClaimOutcome::Acquired(Claim {
                    store: self.store,
                    guard,
                    key: key.clone(),
                    digest,
                    finished: false,
                }));
            }
            if attempt + 1 < self.backoff.attempts {
                let delay = self.backoff.delay(attempt);
                debug!(%key, attempt, ?delay, "lock busy, backing off");
                if sleep_unless_cancelled(delay, cancel) {
                    break;
                }
            }
        }
        if let Some(done) = self.store.get_final(&digest)? {
            return Ok(ClaimOutcome::AlreadyDone(done));
        }
        info!(%key, "key busy, skipping for this pass");
        Ok(ClaimOutcome::Busy)
    }
}

/// Floor on the renewal period for very small staleness thresholds.
const MIN_RENEW_INTERVAL: Duration = Duration::from_millis(10);

/// Sleep for `delay` in short slices. Returns `true` if cancelled.
fn sleep_unless_cancelled(delay: Duration, cancel: &AtomicBool) -> bool {
    const SLICE: Duration = Duration::from_millis(100);
    let mut left = delay;
    while !left.is_zero() {
        if cancel.load(Ordering::SeqCst) {
            return true;
        }
        let step = left.min(SLICE);
        std::thread::sleep(step);
        left -= step;
    }
    cancel.load(Ordering::SeqCst)
}

/// Exclusive ownership of one key while its result is computed.
pub struct Claim<'a> {
    store: &'a Store,
    guard: LockGuard<'a>,
    key: CacheKey,
    digest: Digest,
    finished: bool,
}

impl Claim<'_> {
    #[must_use]
    pub const fn key(&self) -> &CacheKey {
        &self.key
    }

    #[must_use]
    pub const fn digest(&self) -> &Digest {
        &self.digest
    }

    /// Where collaborator output for this key should go.
    #[must_use]
    pub fn log_path(&self) -> PathBuf {
        self.store.log_path(&self.digest)
    }

    /// Run `work` on this thread while a helper thread renews the lock every
    /// quarter of the staleness threshold.
    pub fn keep_alive<R>(&self, work: impl FnOnce() -> R) -> R {
        let interval = (self.guard.stale_after() / 4).max(MIN_RENEW_INTERVAL);
        let done = AtomicBool::new(false);
        std::thread::scope(|s| {
            s.spawn(|| {
                while !sleep_unless_cancelled(interval, &done) {
                    match self.guard.renew() {
                        Ok(true) => {}
                        Ok(false) => {
                            warn!(key = %self.key, "lock lost during computation");
                            break;
                        }
                        Err(e) => warn!(key = %self.key, error = %e, "failed to renew lock"),
                    }
                }
            });
            let _stop = SetOnDrop(&done);
            work()
        })
    }

    fn owner(&self) -> &str {
        &self.guard.lease().info.token
    }

    /// Write the final entry, then remove the placeholder and release the
    /// lock.
    ///
    /// # Errors
    /// If the write fails the claim is dropped as abandoned: the placeholder
    /// is removed and the key returns to absent.
    pub fn complete(mut self, entry: &FinalEntry) -> Result<(), StoreError> {
        if entry.key != self.key {
            return Err(StoreError::WrongLock {
                held: self.digest.clone(),
                wanted: entry.key.digest(),
            });
        }
        self.store.put(&self.guard, entry)?;
        self.finished = true;
        self.store.remove_placeholder_if_owned(&self.digest, self.owner())?;
        info!(key = %self.key, status = %entry.status, "result recorded");
        Ok(())
    }
}

impl Drop for Claim<'_> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        warn!(key = %self.key, "claim abandoned, clearing placeholder");
        if let Err(e) = self.store.remove_placeholder_if_owned(&self.digest, self.owner()) {
            warn!(key = %self.key, error = %e, "failed to remove placeholder");
        }
    }
}

/// Raises the flag when dropped, including during a panic.
struct SetOnDrop<'a>(&'a AtomicBool);

impl Drop for SetOnDrop<'_> {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

impl std::fmt::Debug for Claim<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Claim")
            .field("key", &self.key)
            .field("finished", &self.finished)
            .finish_non_exhaustive()
    }
}
