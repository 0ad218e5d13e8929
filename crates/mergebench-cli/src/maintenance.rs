//! Store maintenance commands: stats, consolidation, curation.

use std::fs::File;
use std::path::PathBuf;

use anyhow::{Context as _, Result, bail};
use clap::{Args, Subcommand};
use mergebench::cache::consolidate::consolidate;
use mergebench::cache::curate::{self, CurationReport};
use mergebench::cache::{Status, Store};
use mergebench::config::MergebenchConfig;

#[derive(Subcommand)]
pub enum CacheCommands {
    /// Count entries by status, placeholders, locks and inconsistencies
    Stats,
}

#[derive(Args)]
pub struct ConsolidateArgs {
    /// Stores to merge (at least two)
    #[arg(required = true, num_args = 2..)]
    stores: Vec<PathBuf>,

    /// Store to write; its existing entries take part in the merge
    #[arg(long)]
    output: PathBuf,
}

#[derive(Args, Clone, Copy)]
pub struct Confirm {
    /// Actually delete (default is a dry run)
    #[arg(long)]
    yes: bool,
}

#[derive(Subcommand)]
pub enum CurateCommands {
    /// Delete entries flagged inconsistent by consolidation
    Inconsistent(Confirm),

    /// Delete trivial merges recorded as failures
    FailedTrivial(Confirm),

    /// Delete placeholders left by crashed workers
    Placeholders(Confirm),

    /// Delete entries with a given status
    Status {
        /// success, conflict, test_failed, timeout or error
        #[arg(long)]
        status: Status,
        #[command(flatten)]
        confirm: Confirm,
    },

    /// Delete lock markers past the staleness threshold
    StaleLocks(Confirm),
}

/// Exclusive OS lock on the store's maintenance lock file, held for the
/// lifetime of the value.
struct MaintenanceLock {
    _file: File,
}

impl MaintenanceLock {
    fn acquire(store: &Store) -> Result<Self> {
        let path = store.maintenance_lock_path();
        let file = File::options()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .with_context(|| format!("opening {}", path.display()))?;
        if let Err(e) = fs4::fs_std::FileExt::try_lock_exclusive(&file) {
            if e.kind() == std::io::ErrorKind::WouldBlock {
                bail!("another maintenance command holds {}", path.display());
            }
            return Err(e).with_context(|| format!("locking {}", path.display()));
        }
        Ok(Self { _file: file })
    }
}

fn open(root: &std::path::Path) -> Result<Store> {
    Store::open(root).with_context(|| format!("opening cache store {}", root.display()))
}

pub fn run_cache(config: &MergebenchConfig, cmd: &CacheCommands) -> Result<()> {
    match cmd {
        CacheCommands::Stats => {
            let store = open(&config.cache.root)?;
            let locks = store.lock_manager(config.cache.stale_after());
            let stats = curate::stats(&store, &locks)?;
            println!("Cache {}:", store.root().display());
            println!("  final entries: {}", stats.total_final());
            for status in Status::ALL {
                println!("    {status}: {}", stats.by_status.get(&status).copied().unwrap_or(0));
            }
            println!("  placeholders:  {}", stats.placeholders);
            println!("  locks:         {} live, {} stale", stats.live_locks, stats.stale_locks);
            println!("  inconsistent:  {}", stats.inconsistent);
        }
    }
    Ok(())
}

pub fn run_consolidate(config: &MergebenchConfig, args: &ConsolidateArgs) -> Result<()> {
    let inputs = args.stores.iter().map(|p| open(p)).collect::<Result<Vec<_>>>()?;
    let output = open(&args.output)?;
    let _maintenance = MaintenanceLock::acquire(&output)?;
    let refs: Vec<&Store> = inputs.iter().collect();
    let report = consolidate(&refs, &output, config.cache.stale_after())?;
    println!(
        "Consolidated {} key(s) into {}: {} written, {} unchanged, {} busy, {} inconsistent, {} flag(s) cleared.",
        report.keys,
        output.root().display(),
        report.written,
        report.unchanged,
        report.busy,
        report.inconsistent,
        report.cleared
    );
    if report.inconsistent > 0 {
        println!("Inspect with 'mergebench cache stats'; remove with 'mergebench curate inconsistent --yes'.");
    }
    Ok(())
}

pub fn run_curate(config: &MergebenchConfig, cmd: &CurateCommands) -> Result<()> {
    let store = open(&config.cache.root)?;
    let _maintenance = MaintenanceLock::acquire(&store)?;
    let locks = store.lock_manager(config.cache.stale_after());
    let (what, report) = match cmd {
        CurateCommands::Inconsistent(c) => ("inconsistent entries", curate::purge_inconsistent(&store, &locks, c.yes)?),
        CurateCommands::FailedTrivial(c) => {
            ("failed trivial merges", curate::purge_failed_trivial(&store, &locks, c.yes)?)
        }
        CurateCommands::Placeholders(c) => {
            ("orphan placeholders", curate::purge_orphan_placeholders(&store, &locks, c.yes)?)
        }
        CurateCommands::Status { status, confirm } => {
            ("entries with that status", curate::purge_status(&store, &locks, *status, confirm.yes)?)
        }
        CurateCommands::StaleLocks(c) => ("stale locks", curate::purge_stale_locks(&locks, c.yes)?),
    };
    print_report(what, &report);
    Ok(())
}

fn print_report(what: &str, report: &CurationReport) {
    if report.dry_run {
        println!(
            "Curation preview: scanned {}, would delete {} {what}.",
            report.scanned,
            report.matched.len()
        );
        for digest in &report.matched {
            println!("  {digest}");
        }
        if !report.matched.is_empty() {
            println!("To apply: rerun with --yes");
        }
    } else {
        println!(
            "Curation complete: scanned {}, deleted {} of {} {what}, {} busy.",
            report.scanned,
            report.deleted,
            report.matched.len(),
            report.busy
        );
    }
}
