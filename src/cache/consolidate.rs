//! Merging independently filled stores.
//!
//! For each key with a final entry in any input (the output store's own
//! content counts as one more input):
//!
//! - all copies agree on status: keep one canonical copy, the earliest
//!   `created_at_ms`, ties broken by the smaller payload JSON;
//! - copies disagree: flag the key inconsistent and write nothing.
//!
//! The choice depends only on the set of copies, so the result is the same
//! whatever order the inputs are given in. Placeholders are never copied.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use tracing::{info, instrument, warn};

use super::entry::{FinalEntry, Status};
use super::key::Digest;
use super::lock::LockGuard;
use super::now_ms;
use super::store::{InconsistencyFlag, Store, StoreError};

/// Resolution of one key across all inputs.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Resolution {
    /// Every copy has the same status; this is the canonical one.
    Agreed(FinalEntry),
    /// Copies disagree on status.
    Conflicting(InconsistencyFlag),
}

/// Pick the canonical copy among `copies`, or report disagreement.
///
/// Returns `None` for an empty slice.
#[must_use]
pub fn resolve(copies: &[FinalEntry]) -> Option<Resolution> {
    let first = copies.first()?;
    let statuses: BTreeSet<Status> = copies.iter().map(|e| e.status).collect();
    if statuses.len() > 1 {
        return Some(Resolution::Conflicting(InconsistencyFlag {
            key: first.key.clone(),
            statuses,
            flagged_at_ms: now_ms(),
        }));
    }
    copies
        .iter()
        .min_by(|a, b| {
            a.created_at_ms
                .cmp(&b.created_at_ms)
                .then_with(|| payload_text(a).cmp(&payload_text(b)))
                .then_with(|| a.classification.cmp(&b.classification))
        })
        .cloned()
        .map(Resolution::Agreed)
}

fn payload_text(entry: &FinalEntry) -> String {
    entry.payload.to_string()
}

/// Group every input's final entries by digest and resolve each key.
#[must_use]
pub fn plan(inputs: &[Vec<(Digest, FinalEntry)>]) -> BTreeMap<Digest, Resolution> {
    let mut copies: BTreeMap<Digest, Vec<FinalEntry>> = BTreeMap::new();
    for input in inputs {
        for (digest, entry) in input {
            copies.entry(digest.clone()).or_default().push(entry.clone());
        }
    }
    copies
        .into_iter()
        .filter_map(|(digest, copies)| resolve(&copies).map(|r| (digest, r)))
        .collect()
}

/// Counts from one consolidation.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ConsolidationReport {
    /// Distinct keys with at least one final entry.
    pub keys: usize,
    /// Keys written or rewritten in the output.
    pub written: usize,
    /// Keys whose output copy was already canonical.
    pub unchanged: usize,
    /// Keys flagged inconsistent.
    pub inconsistent: usize,
    /// Keys flagged by an earlier run whose copies now agree.
    pub cleared: usize,
    /// Keys skipped because a worker held their lock.
    pub busy: usize,
}

/// Consolidate `inputs` into `output`.
///
/// Writes take each key's lock in the output store; a key whose lock is
/// held is skipped and counted as busy.
///
/// # Errors
/// Store failures reading any input or writing the output.
#[instrument(skip_all, fields(inputs = inputs.len(), output = %output.root().display()))]
pub fn consolidate(
    inputs: &[&Store],
    output: &Store,
    stale_after: Duration,
) -> Result<ConsolidationReport, StoreError> {
    let mut all = Vec::with_capacity(inputs.len() + 1);
    for store in inputs {
        all.push(store.final_entries()?);
    }
    let existing: BTreeMap<Digest, FinalEntry> = output.final_entries()?.into_iter().collect();
    all.push(existing.clone().into_iter().collect());

    let locks = output.lock_manager(stale_after);
    let mut report = ConsolidationReport::default();
    for (digest, resolution) in plan(&all) {
        report.keys += 1;
        match resolution {
            Resolution::Conflicting(flag) => {
                output.flag_inconsistent(&flag)?;
                report.inconsistent += 1;
            }
            Resolution::Agreed(entry) => {
                if output.clear_inconsistent(&digest)? {
                    info!(%digest, "copies now agree, clearing inconsistency flag");
                    report.cleared += 1;
                }
                if existing.get(&digest) == Some(&entry) {
                    report.unchanged += 1;
                    continue;
                }
                let Some(guard) = LockGuard::try_lock(&locks, &digest)? else {
                    warn!(%digest, "key locked in output store, skipping");
                    report.busy += 1;
                    continue;
                };
                output.replace(&guard, &entry)?;
                report.written += 1;
            }
        }
    }
    info!(
        keys = report.keys,
        written = report.written,
        inconsistent = report.inconsistent,
        cleared = report.cleared,
        busy = report.busy,
        "consolidation finished"
    );
    Ok(report)
}
