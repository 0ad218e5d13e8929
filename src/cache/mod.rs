//! The distributed result cache.
//!
//! A content-addressed store of evaluation results shared by many workers,
//! possibly on different machines syncing one directory. Writers coordinate
//! through per-key locks ([`lock`]) and in-progress placeholders
//! ([`coord`]); independently filled stores are merged by [`consolidate`]
//! and repaired by [`curate`].

pub mod consolidate;
pub mod coord;
pub mod curate;
pub mod entry;
pub mod key;
pub mod lock;
pub mod store;

pub use coord::{Backoff, Claim, ClaimOutcome, Coordinator};
pub use entry::{CacheEntry, FinalEntry, Placeholder, Status};
pub use key::{CacheKey, Digest};
pub use lock::{FsLockManager, LockError, LockGuard, LockInfo, LockManager};
pub use store::{InconsistencyFlag, Store, StoreError};

/// Milliseconds since the Unix epoch.
pub(crate) fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}
