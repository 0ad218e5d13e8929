//! Store maintenance: find entries that should be recomputed and, when
//! asked, delete them.
//!
//! Every operation is a dry run unless `apply` is set. Deletions take the
//! key's lock first; a key whose lock is live is reported as busy and left
//! alone. Deleting a final entry also deletes its log.

use std::collections::BTreeMap;

use tracing::{info, instrument, warn};

use super::entry::Status;
use super::key::Digest;
use super::lock::{LockGuard, LockManager};
use super::now_ms;
use super::store::{Store, StoreError};
use crate::model::Classification;

/// What a curation pass matched and removed.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CurationReport {
    /// Entries scanned.
    pub scanned: usize,
    /// Digests matching the predicate, sorted.
    pub matched: Vec<Digest>,
    /// Matches actually deleted (always 0 on a dry run).
    pub deleted: usize,
    /// Matches skipped because their lock was live.
    pub busy: usize,
    pub dry_run: bool,
}

/// Delete final entries matching `pred`.
fn purge_final_where(
    store: &Store,
    locks: &dyn LockManager,
    apply: bool,
    pred: impl Fn(&super::FinalEntry) -> bool,
) -> Result<CurationReport, StoreError> {
    let mut report = CurationReport {
        dry_run: !apply,
        ..CurationReport::default()
    };
    for (digest, entry) in store.final_entries()? {
        report.scanned += 1;
        if !pred(&entry) {
            continue;
        }
        report.matched.push(digest.clone());
        if !apply {
            continue;
        }
        let Some(guard) = LockGuard::try_lock(locks, &digest)? else {
            warn!(%digest, "entry locked, not deleting");
            report.busy += 1;
            continue;
        };
        if store.delete_final(&guard, &digest)? {
            info!(%digest, key = %entry.key, status = %entry.status, "entry purged");
            report.deleted += 1;
        }
    }
    Ok(report)
}

/// Delete entries flagged inconsistent by consolidation, and the flags.
///
/// # Errors
/// Store and lock backend failures.
#[instrument(skip(store, locks))]
pub fn purge_inconsistent(store: &Store, locks: &dyn LockManager, apply: bool) -> Result<CurationReport, StoreError> {
    let mut report = CurationReport {
        dry_run: !apply,
        ..CurationReport::default()
    };
    for (digest, flag) in store.inconsistencies()? {
        report.scanned += 1;
        report.matched.push(digest.clone());
        if !apply {
            continue;
        }
        let Some(guard) = LockGuard::try_lock(locks, &digest)? else {
            report.busy += 1;
            continue;
        };
        store.delete_final(&guard, &digest)?;
        store.clear_inconsistent(&digest)?;
        info!(%digest, key = %flag.key, statuses = ?flag.statuses, "inconsistent entry purged");
        report.deleted += 1;
    }
    Ok(report)
}

/// Delete trivial merges whose status is a failure. A trivial merge should
/// never fail, so such results are suspect and worth recomputing.
///
/// # Errors
/// Store and lock backend failures.
#[instrument(skip(store, locks))]
pub fn purge_failed_trivial(store: &Store, locks: &dyn LockManager, apply: bool) -> Result<CurationReport, StoreError> {
    purge_final_where(store, locks, apply, |e| {
        e.classification == Some(Classification::Trivial) && e.status.is_failure()
    })
}

/// Delete final entries with the given status.
///
/// # Errors
/// Store and lock backend failures.
#[instrument(skip(store, locks))]
pub fn purge_status(
    store: &Store,
    locks: &dyn LockManager,
    status: Status,
    apply: bool,
) -> Result<CurationReport, StoreError> {
    purge_final_where(store, locks, apply, |e| e.status == status)
}

/// Delete placeholders with no live lock that are older than the
/// staleness threshold, with any log they produced.
///
/// # Errors
/// Store and lock backend failures.
#[instrument(skip(store, locks))]
pub fn purge_orphan_placeholders(
    store: &Store,
    locks: &dyn LockManager,
    apply: bool,
) -> Result<CurationReport, StoreError> {
    let mut report = CurationReport {
        dry_run: !apply,
        ..CurationReport::default()
    };
    let now = now_ms();
    for record in store.placeholders()? {
        report.scanned += 1;
        let age = std::time::Duration::from_millis(now.saturating_sub(record.placeholder.started_at_ms));
        if age < locks.stale_after() {
            continue;
        }
        if locks.holder(&record.digest)?.is_some_and(|h| !locks.is_stale(&h)) {
            continue;
        }
        report.matched.push(record.digest.clone());
        if !apply {
            continue;
        }
        // Taking the lock reclaims a stale one and keeps a new worker out
        // while the marker is removed.
        let Some(_guard) = LockGuard::try_lock(locks, &record.digest)? else {
            report.busy += 1;
            continue;
        };
        store.remove_placeholder(&record.digest)?;
        store.remove_log(&record.digest)?;
        info!(digest = %record.digest, key = %record.placeholder.key, "orphan placeholder removed");
        report.deleted += 1;
    }
    Ok(report)
}

/// Delete lock markers past the staleness threshold. Touches only the lock
/// namespace.
///
/// # Errors
/// Lock backend failures.
#[instrument(skip(locks))]
pub fn purge_stale_locks(locks: &dyn LockManager, apply: bool) -> Result<CurationReport, StoreError> {
    let mut report = CurationReport {
        dry_run: !apply,
        ..CurationReport::default()
    };
    for (digest, info) in locks.list()? {
        report.scanned += 1;
        if !locks.is_stale(&info) {
            continue;
        }
        report.matched.push(digest.clone());
        if apply && locks.break_stale(&digest)? {
            report.deleted += 1;
        }
    }
    Ok(report)
}

/// A snapshot of store contents.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub by_status: BTreeMap<Status, usize>,
    pub placeholders: usize,
    pub live_locks: usize,
    pub stale_locks: usize,
    pub inconsistent: usize,
}

impl CacheStats {
    #[must_use]
    pub fn total_final(&self) -> usize {
        self.by_status.values().sum()
    }
}

/// Count entries by status, placeholders, locks and flags.
///
/// # Errors
/// Store and lock backend failures.
pub fn stats(store: &Store, locks: &dyn LockManager) -> Result<CacheStats, StoreError> {
    let mut stats = CacheStats::default();
    for (_, entry) in store.final_entries()? {
        *stats.by_status.entry(entry.status).or_default() += 1;
    }
    stats.placeholders = store.placeholders()?.len();
    for (_, info) in locks.list()? {
        if locks.is_stale(&info) {
            stats.stale_locks += 1;
        } else {
            stats.live_locks += 1;
        }
    }
    stats.inconsistent = store.inconsistencies()?.len();
    Ok(stats)
}
