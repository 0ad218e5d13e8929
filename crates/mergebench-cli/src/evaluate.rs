use std::path::PathBuf;
use std::sync::atomic::AtomicBool;

use anyhow::{Context as _, Result, bail};
use clap::Args;
use mergebench::cache::{Backoff, Coordinator, Store};
use mergebench::config::MergebenchConfig;
use mergebench::discovery::{GitCliProvider, Ledger};
use mergebench::worker::{
    MergeTool, ScriptMergeTool, ScriptTestRunner, Shard, TrivialFilter, WorkList, Worker, WorkerOptions,
};
use tracing::info;

#[derive(Args)]
pub struct EvaluateArgs {
    /// Evaluate only repositories in shard i of n
    #[arg(long, value_name = "I/N", default_value = "0/1")]
    shard: Shard,

    /// Also evaluate trivial merges
    #[arg(long, conflicts_with = "only_trivial")]
    include_trivial: bool,

    /// Evaluate only trivial merges (and merges of unrelated histories)
    #[arg(long)]
    only_trivial: bool,

    /// Restrict to the named tools; may be repeated
    #[arg(long = "tool", value_name = "NAME")]
    tools: Vec<String>,

    /// Directory of ledger files, overriding `[discovery] ledger_dir`
    #[arg(long)]
    ledger_dir: Option<PathBuf>,
}

impl EvaluateArgs {
    const fn filter(&self) -> TrivialFilter {
        if self.only_trivial {
            TrivialFilter::Only
        } else if self.include_trivial {
            TrivialFilter::Include
        } else {
            TrivialFilter::Exclude
        }
    }
}

pub fn run(config: &MergebenchConfig, args: &EvaluateArgs, cancel: &AtomicBool) -> Result<()> {
    let tools: Vec<Box<dyn MergeTool>> = config
        .tools
        .iter()
        .filter(|t| args.tools.is_empty() || args.tools.contains(&t.name))
        .map(|t| Box::new(ScriptMergeTool::new(t, config.evaluation.merge_timeout())) as Box<dyn MergeTool>)
        .collect();
    if tools.is_empty() {
        bail!("no merge tools selected; add [[tools]] entries to the configuration");
    }

    let ledger_dir = args.ledger_dir.clone().unwrap_or_else(|| config.discovery.ledger_dir.clone());
    let work = WorkList::load(&Ledger::new(&ledger_dir), args.shard, args.filter())
        .with_context(|| format!("reading ledgers in {}", ledger_dir.display()))?;
    info!(
        shard = %args.shard,
        repositories = work.repositories().count(),
        candidates = work.candidate_count(),
        tools = tools.len(),
        "work list loaded"
    );

    let store = Store::open(&config.cache.root)
        .with_context(|| format!("opening cache store {}", config.cache.root.display()))?;
    let locks = store.lock_manager(config.cache.stale_after());
    let coordinator = Coordinator::new(&store, &locks, Backoff::from(&config.cache));
    let provider = GitCliProvider::new(&config.discovery.repos_dir, config.discovery.clone_url_template.clone());
    let tests = ScriptTestRunner::new(&config.evaluation);
    let worker = Worker::new(
        &coordinator,
        &provider,
        &tests,
        WorkerOptions {
            workdir_root: config.evaluation.workdir.clone(),
            test_attempts: config.evaluation.test_attempts,
        },
    );

    let report = worker.run(work.items(&tools), cancel);
    println!(
        "Evaluation {} (shard {}): {} completed, {} cached, {} busy, {} failed.",
        if report.cancelled { "interrupted" } else { "complete" },
        args.shard,
        report.completed,
        report.cached,
        report.busy,
        report.failed
    );
    for (status, n) in &report.by_status {
        println!("  {status}: {n}");
    }
    if report.cancelled {
        bail!("interrupted");
    }
    Ok(())
}
