//! Consolidating stores filled on different machines, then curating the
//! result.

use std::collections::BTreeMap;
use std::sync::atomic::AtomicBool;
use std::time::Duration;

use mergebench::cache::consolidate::consolidate;
use mergebench::cache::curate;
use mergebench::cache::{Backoff, CacheKey, ClaimOutcome, Coordinator, Digest, FinalEntry, Status, Store};
use mergebench::model::{Classification, RepoSlug};
use mergebench_git::GitOid;
use tempfile::TempDir;

const STALE: Duration = Duration::from_secs(600);

fn key(n: u8) -> CacheKey {
    CacheKey {
        repository: RepoSlug::new("octo/widgets").unwrap(),
        merge_commit: GitOid::from_bytes([n; 20]),
        parent_1: GitOid::from_bytes([n.wrapping_add(1); 20]),
        parent_2: GitOid::from_bytes([n.wrapping_add(2); 20]),
        tool: "git".to_owned(),
        config: String::new(),
    }
}

/// Record a result the way a worker would.
fn record(store: &Store, n: u8, status: Status, created_at_ms: u64, classification: Classification) {
    let locks = store.lock_manager(STALE);
    let backoff = Backoff {
        attempts: 1,
        base: Duration::from_millis(1),
        max: Duration::from_millis(1),
    };
    let coord = Coordinator::new(store, &locks, backoff);
    let k = key(n);
    let ClaimOutcome::Acquired(claim) = coord.claim(&k, &AtomicBool::new(false)).unwrap() else {
        panic!("expected to claim {k}");
    };
    let entry = FinalEntry {
        key: k,
        status,
        classification: Some(classification),
        created_at_ms,
        payload: serde_json::json!({ "machine_time": created_at_ms }),
    };
    claim.complete(&entry).unwrap();
}

fn snapshot(store: &Store) -> BTreeMap<Digest, FinalEntry> {
    store.final_entries().unwrap().into_iter().collect()
}

struct Machines {
    _dir: TempDir,
    a: Store,
    b: Store,
}

/// Machine A and machine B evaluated overlapping keys:
/// key 1 agrees, key 2 disagrees, key 3 and key 4 are one-sided.
fn machines() -> Machines {
    let dir = TempDir::new().unwrap();
    let a = Store::open(dir.path().join("a")).unwrap();
    let b = Store::open(dir.path().join("b")).unwrap();
    record(&a, 1, Status::Success, 200, Classification::Normal);
    record(&b, 1, Status::Success, 100, Classification::Normal);
    record(&a, 2, Status::Conflict, 100, Classification::Normal);
    record(&b, 2, Status::Success, 100, Classification::Normal);
    record(&a, 3, Status::Timeout, 100, Classification::Normal);
    record(&b, 4, Status::TestFailed, 100, Classification::Trivial);
    Machines { _dir: dir, a, b }
}

#[test]
fn disagreements_are_flagged_not_resolved() {
    let m = machines();
    let out_dir = TempDir::new().unwrap();
    let out = Store::open(out_dir.path()).unwrap();

    let report = consolidate(&[&m.a, &m.b], &out, STALE).unwrap();
    assert_eq!(report.keys, 4);
    assert_eq!(report.written, 3);
    assert_eq!(report.inconsistent, 1);

    let merged = snapshot(&out);
    assert_eq!(merged.len(), 3);
    assert!(!out.exists(&key(2)).unwrap());
    // Agreeing copies keep the earliest.
    assert_eq!(merged[&key(1).digest()].created_at_ms, 100);
    let flags = out.inconsistencies().unwrap();
    assert_eq!(flags.len(), 1);
    assert_eq!(flags[0].1.key, key(2));
    assert_eq!(
        flags[0].1.statuses.iter().copied().collect::<Vec<_>>(),
        vec![Status::Success, Status::Conflict]
    );
}

#[test]
fn order_of_inputs_does_not_matter() {
    let m = machines();
    let (d1, d2) = (TempDir::new().unwrap(), TempDir::new().unwrap());
    let ab = Store::open(d1.path()).unwrap();
    let ba = Store::open(d2.path()).unwrap();
    consolidate(&[&m.a, &m.b], &ab, STALE).unwrap();
    consolidate(&[&m.b, &m.a], &ba, STALE).unwrap();

    assert_eq!(snapshot(&ab), snapshot(&ba));
    let flags = |s: &Store| -> Vec<_> {
        s.inconsistencies()
            .unwrap()
            .into_iter()
            .map(|(d, f)| (d, f.key, f.statuses))
            .collect()
    };
    assert_eq!(flags(&ab), flags(&ba));
}

#[test]
fn consolidating_into_an_input_is_idempotent() {
    let m = machines();
    consolidate(&[&m.b], &m.a, STALE).unwrap();
    let once = snapshot(&m.a);
    let again = consolidate(&[&m.b], &m.a, STALE).unwrap();
    assert_eq!(again.written, 0);
    assert_eq!(snapshot(&m.a), once);
    // Key 2 stays as machine A had it; it is flagged, not overwritten.
    assert_eq!(once[&key(2).digest()].status, Status::Conflict);
}

#[test]
fn curation_after_consolidation_clears_suspect_entries() {
    let m = machines();
    let out_dir = TempDir::new().unwrap();
    let out = Store::open(out_dir.path()).unwrap();
    consolidate(&[&m.a, &m.b], &out, STALE).unwrap();
    let locks = out.lock_manager(STALE);

    let before = curate::stats(&out, &locks).unwrap();
    assert_eq!(before.inconsistent, 1);
    assert_eq!(before.total_final(), 3);

    let preview = curate::purge_inconsistent(&out, &locks, false).unwrap();
    assert_eq!(preview.matched, vec![key(2).digest()]);
    assert_eq!(curate::stats(&out, &locks).unwrap(), before);

    curate::purge_inconsistent(&out, &locks, true).unwrap();
    let trivial = curate::purge_failed_trivial(&out, &locks, true).unwrap();
    assert_eq!(trivial.matched, vec![key(4).digest()]);
    let timeouts = curate::purge_status(&out, &locks, Status::Timeout, true).unwrap();
    assert_eq!(timeouts.deleted, 1);

    let after = curate::stats(&out, &locks).unwrap();
    assert_eq!(after.inconsistent, 0);
    assert_eq!(after.total_final(), 1);
    assert!(out.exists(&key(1)).unwrap());
}
