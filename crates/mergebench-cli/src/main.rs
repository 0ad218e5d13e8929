use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use mergebench::config::{CONFIG_FILE, MergebenchConfig};

mod discover;
mod evaluate;
mod maintenance;
mod telemetry;

/// Merge-tool benchmark harness
///
/// Finds real two-parent merges in git repositories, replays them with each
/// configured merge tool, tests the result, and caches every outcome in a
/// store that many machines can fill at once.
///
/// WORKFLOW:
///
///   1. Discover merges:   mergebench discover --repos repos.csv
///   2. Evaluate (shard):  mergebench evaluate --shard 0/4
///   3. Merge stores:      mergebench consolidate a/ b/ --output cache/
///   4. Clean up:          mergebench curate inconsistent --yes
#[derive(Parser)]
#[command(name = "mergebench")]
#[command(version, about)]
#[command(propagate_version = true)]
#[command(after_help = "See 'mergebench <command> --help' for more information on a specific command.")]
struct Cli {
    /// Configuration file; a missing file means defaults
    #[arg(long, global = true, env = "MERGEBENCH_CONFIG", default_value = CONFIG_FILE)]
    config: PathBuf,

    /// Cache store directory, overriding `[cache] root`
    #[arg(long, global = true, env = "MERGEBENCH_CACHE")]
    cache: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Find merge candidates and write one ledger per repository
    ///
    /// Repositories that already have a ledger are skipped, so an
    /// interrupted run can simply be restarted.
    Discover(discover::DiscoverArgs),

    /// Replay ledger candidates with every configured tool
    ///
    /// Results land in the cache store. Keys already computed or held by
    /// another worker are skipped.
    Evaluate(evaluate::EvaluateArgs),

    /// Inspect the cache store
    #[command(subcommand)]
    Cache(maintenance::CacheCommands),

    /// Merge several cache stores into one
    ///
    /// Entries that disagree on status are flagged as inconsistent rather
    /// than resolved; see 'mergebench curate inconsistent'.
    Consolidate(maintenance::ConsolidateArgs),

    /// Delete cache entries so they are recomputed on the next run
    ///
    /// Every operation previews what it would delete unless --yes is given.
    #[command(subcommand)]
    Curate(maintenance::CurateCommands),
}

fn main() -> Result<()> {
    let _telemetry = telemetry::init();
    let cli = Cli::parse();

    let mut config = MergebenchConfig::load(&cli.config)?;
    if let Some(cache) = cli.cache {
        config.cache.root = cache;
    }

    let cancel = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&cancel);
    // SIGINT, SIGTERM and SIGHUP all cancel. Running collaborators are
    // killed by their poll loop and claims unwind through Drop, so a repeated
    // signal only reports that shutdown is under way.
    ctrlc::set_handler(move || {
        if flag.swap(true, Ordering::SeqCst) {
            eprintln!("Already stopping; waiting for claimed keys to be released.");
        } else {
            eprintln!("Interrupted; stopping collaborators and releasing claimed keys.");
        }
    })
    .context("installing signal handler")?;

    match cli.command {
        Commands::Discover(args) => discover::run(&config, &args, &cancel),
        Commands::Evaluate(args) => evaluate::run(&config, &args, &cancel),
        Commands::Cache(cmd) => maintenance::run_cache(&config, &cmd),
        Commands::Consolidate(args) => maintenance::run_consolidate(&config, &args),
        Commands::Curate(cmd) => maintenance::run_curate(&config, &cmd),
    }
}
